//! The pool-allocated sample object (C1's data type; spec §3, §4.1).

pub mod pool;
pub mod queue;
pub mod sendbuffer;

use crate::format::ChannelFormat;
use std::sync::Arc;

pub use pool::Pool;
pub use queue::ConsumerQueue;
pub use sendbuffer::SendBuffer;

/// Reserved capture-timestamp value meaning "deduce from predecessor + 1/rate" (spec §3).
pub const DEDUCED_TIMESTAMP: f64 = -1.0;

/// Channel payload, sized per format: a flat byte buffer for numeric formats, or one
/// owned byte sequence per channel for strings.
#[derive(Debug, Clone)]
pub enum Payload {
    Numeric(Box<[u8]>),
    Strings(Box<[Vec<u8>]>),
}

impl Payload {
    fn new_numeric(format: ChannelFormat, channels: u32) -> Self {
        Payload::Numeric(vec![0u8; format.size() * channels as usize].into_boxed_slice())
    }

    fn new_strings(channels: u32) -> Self {
        Payload::Strings(vec![Vec::new(); channels as usize].into_boxed_slice())
    }

    pub fn as_numeric(&self) -> Option<&[u8]> {
        match self {
            Payload::Numeric(b) => Some(b),
            Payload::Strings(_) => None,
        }
    }

    pub fn as_numeric_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Payload::Numeric(b) => Some(b),
            Payload::Strings(_) => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[Vec<u8>]> {
        match self {
            Payload::Strings(s) => Some(s),
            Payload::Numeric(_) => None,
        }
    }

    pub fn as_strings_mut(&mut self) -> Option<&mut [Vec<u8>]> {
        match self {
            Payload::Strings(s) => Some(s),
            Payload::Numeric(_) => None,
        }
    }
}

/// A single pool-allocated, reference-counted sample. Cloning a `SampleRef` just bumps
/// the `Arc` strong count; the sample returns to its owning pool's freelist when the
/// last reference is dropped (see `pool::Sample`'s `Drop` impl).
pub type SampleRef = Arc<pool::Sample>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_numeric_sized_correctly() {
        let p = Payload::new_numeric(ChannelFormat::Int16, 4);
        assert_eq!(p.as_numeric().unwrap().len(), 8);
    }

    #[test]
    fn payload_strings_one_per_channel() {
        let p = Payload::new_strings(3);
        assert_eq!(p.as_strings().unwrap().len(), 3);
    }
}
