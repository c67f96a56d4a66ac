//! Channel format enum and the property tables the rest of the crate consults
//! (mirrors `format_sizes`/`format_ieee754`/`format_subnormal`/`format_integral`/
//! `format_float` in the original `sample.h`).

/// Channel formats, in the exact wire/XML order used by the protocol (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelFormat {
    Undefined = 0,
    Float32 = 1,
    Double64 = 2,
    String = 3,
    Int32 = 4,
    Int16 = 5,
    Int8 = 6,
    Int64 = 7,
}

impl ChannelFormat {
    pub const ALL: [ChannelFormat; 8] = [
        ChannelFormat::Undefined,
        ChannelFormat::Float32,
        ChannelFormat::Double64,
        ChannelFormat::String,
        ChannelFormat::Int32,
        ChannelFormat::Int16,
        ChannelFormat::Int8,
        ChannelFormat::Int64,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| *f as u8 == v)
    }

    /// XML channel-format token (spec §6).
    pub fn xml_token(self) -> &'static str {
        match self {
            ChannelFormat::Undefined => "undefined",
            ChannelFormat::Float32 => "float32",
            ChannelFormat::Double64 => "double64",
            ChannelFormat::String => "string",
            ChannelFormat::Int32 => "int32",
            ChannelFormat::Int16 => "int16",
            ChannelFormat::Int8 => "int8",
            ChannelFormat::Int64 => "int64",
        }
    }

    pub fn from_xml_token(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.xml_token() == s)
    }

    /// Fixed per-value byte size; 0 for `String`, which is length-prefixed instead.
    pub fn size(self) -> usize {
        match self {
            ChannelFormat::Undefined => 0,
            ChannelFormat::Float32 => 4,
            ChannelFormat::Double64 => 8,
            ChannelFormat::String => 0,
            ChannelFormat::Int32 => 4,
            ChannelFormat::Int16 => 2,
            ChannelFormat::Int8 => 1,
            ChannelFormat::Int64 => 8,
        }
    }

    pub fn is_ieee754(self) -> bool {
        matches!(self, ChannelFormat::Float32 | ChannelFormat::Double64)
    }

    pub fn supports_subnormals(self) -> bool {
        matches!(self, ChannelFormat::Float32 | ChannelFormat::Double64)
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ChannelFormat::Int32 | ChannelFormat::Int16 | ChannelFormat::Int8 | ChannelFormat::Int64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ChannelFormat::Float32 | ChannelFormat::Double64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_token_roundtrip() {
        for f in ChannelFormat::ALL {
            assert_eq!(ChannelFormat::from_xml_token(f.xml_token()), Some(f));
        }
    }

    #[test]
    fn sizes_match_spec() {
        assert_eq!(ChannelFormat::Float32.size(), 4);
        assert_eq!(ChannelFormat::Double64.size(), 8);
        assert_eq!(ChannelFormat::Int8.size(), 1);
        assert_eq!(ChannelFormat::Int64.size(), 8);
        assert_eq!(ChannelFormat::String.size(), 0);
    }
}
