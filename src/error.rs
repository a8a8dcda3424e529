use std::fmt;

#[derive(Debug)]
pub enum VellumError {
    // Malformed or unsupported TrueType input; message carries the table/offset.
    Font(String),
    // Malformed or unsupported PNG input; message carries the byte offset.
    Image(String),
    // Internal encoder invariant broke; the current document must be discarded.
    Encoding(String),
    Io(std::io::Error),
}

impl fmt::Display for VellumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VellumError::Font(message) => write!(f, "font error: {}", message),
            VellumError::Image(message) => write!(f, "image error: {}", message),
            VellumError::Encoding(message) => write!(f, "encoding error: {}", message),
            VellumError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for VellumError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VellumError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VellumError {
    fn from(value: std::io::Error) -> Self {
        VellumError::Io(value)
    }
}

impl From<VellumError> for std::io::Error {
    fn from(value: VellumError) -> Self {
        match value {
            VellumError::Io(err) => err,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
