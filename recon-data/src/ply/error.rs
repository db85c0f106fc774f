use thiserror::Error;

/// Errors raised while reading or writing PLY interchange files.
#[derive(Debug, Error)]
pub enum PlyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a PLY file: first line must be 'ply'")]
    MissingHeader,

    #[error("header is not terminated by 'end_header'")]
    MissingSentinel,

    #[error("malformed header line at byte {offset}: '{line}'")]
    MalformedHeader { offset: usize, line: String },

    #[error("unsupported PLY format: {0}")]
    UnsupportedFormat(String),

    #[error("unknown property type: {0}")]
    UnknownPropertyType(String),

    #[error("missing element '{0}'")]
    MissingElement(String),

    #[error("missing field '{name}'")]
    MissingField { name: String },

    #[error("field index {index} out of bounds ({len} fields)")]
    FieldIndexOutOfBounds { index: usize, len: usize },

    #[error("payload truncated at byte {offset}: expected {expected} more bytes")]
    Truncated { offset: usize, expected: usize },

    #[error("column '{name}' has {len} values, expected {expected}")]
    ColumnLength {
        name: String,
        len: usize,
        expected: usize,
    },

    #[error("mesh parsing error: {0}")]
    Mesh(String),
}
