pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A field or byte span does not lie within the addressed buffer.
    #[error("span at offset {offset} of {len} bytes exceeds {available} available")]
    OutOfRange {
        offset: usize,
        len: usize,
        available: usize,
    },
    #[error("invalid field width: {0}")]
    InvalidWidth(String),
    /// Value does not fit the target field.
    #[error("Overflow")]
    Overflow,
    #[error("Not enough bytes, got {actual}, expected {minimum}")]
    NotEnoughData { actual: usize, minimum: usize },
    /// Structurally invalid input, rejected before any output is produced.
    #[error("malformed input: {0}")]
    Malformed(String),
    /// Input with valid structure that failed an integrity check.
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("Invalid timecode config: {0}")]
    TimecodeConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
