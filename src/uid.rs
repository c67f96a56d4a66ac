//! Instance UID generation (RFC 4122 v4), replacing `util/uuid.hpp` from the original
//! implementation with the idiomatic `uuid` crate.

/// Generate a fresh random instance UID. A new one is produced every time an outlet
/// process starts a stream (spec §3), so equal descriptors across restarts differ here.
pub fn fresh_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}
