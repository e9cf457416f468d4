use thiserror::Error;

/// A line sequence that could not be assembled into an element.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("element <{tag}> exceeded {lines} lines without a close tag")]
    Overrun { tag: &'static str, lines: usize },
}

/// An assembled element that did not yield a reading.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("malformed element: {0}")]
    Malformed(String),

    #[error("missing field <{0}>")]
    MissingField(&'static str),

    #[error("field <{field}> is not a hex integer: {value:?}")]
    InvalidHex { field: &'static str, value: String },

    #[error("field <{0}> is zero")]
    ZeroField(&'static str),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to publish record: {0}")]
    Publish(String),
}

/// Fatal failure of the line source.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("line source closed")]
    Closed,

    #[error("failed to read from line source: {0}")]
    Io(#[from] std::io::Error),
}
