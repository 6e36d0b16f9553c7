/// Error while encoding or decoding a wire structure.
///
/// Decoding errors are recoverable at the connection level: a frame that
/// fails to decode is dropped and logged, it never takes the process down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Ran out of bytes while decoding.
    Truncated {
        /// What was being decoded.
        what: &'static str,
    },
    /// A non-empty parameter set encoded to fewer than 3 bytes.
    InvalidParameterSetSize(usize),
    /// Unknown invocation version byte.
    UnknownVersion(u8),
    /// Unknown type tag in a parameter set or result table.
    UnknownTypeTag(u8),
    /// String field was not valid UTF-8.
    BadUtf8(&'static str),
    /// A length field was negative or otherwise out of range.
    BadLength {
        /// What was being decoded.
        what: &'static str,
        /// The offending length.
        len: i64,
    },
    /// Malformed hashinator configuration.
    BadHashConfig(&'static str),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated { what } => write!(f, "truncated buffer decoding {what}"),
            WireError::InvalidParameterSetSize(n) => {
                write!(f, "invalid parameter set size: {n}")
            }
            WireError::UnknownVersion(v) => write!(f, "unknown invocation version {v}"),
            WireError::UnknownTypeTag(t) => write!(f, "unknown type tag {t}"),
            WireError::BadUtf8(what) => write!(f, "invalid UTF-8 in {what}"),
            WireError::BadLength { what, len } => write!(f, "bad length {len} for {what}"),
            WireError::BadHashConfig(why) => write!(f, "bad hashinator config: {why}"),
        }
    }
}

impl std::error::Error for WireError {}
