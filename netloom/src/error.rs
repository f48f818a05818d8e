use std::io;

// Malformed input on the wire. Default policy for a connection that feeds a
// parser into this error is to close.
#[derive(Debug, thiserror::Error)]
pub enum ParserError {

    #[error("invalid status line '{0}'")]
    InvalidStatusLine(String),

    #[error("invalid header line '{0}'")]
    InvalidHeader(String),

    #[error("invalid chunk size line '{0}'")]
    InvalidChunkSize(String),

    #[error("invalid line '{0}'")]
    InvalidLine(String),
}

// Framing under-run: the caller should retry with more data.
#[derive(Debug, thiserror::Error)]
#[error("not enough data available for parsing")]
pub struct DataError;

// Misuse of a builder or encoder. Programmer fault, fatal to the operation.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {

    #[error("invalid frame opcode {0:#x}")]
    InvalidOpcode(u8),

    #[error("control frame payload of {0} bytes exceeds the 125 byte limit")]
    OversizedControlFrame(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection already closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
#[error("authentication rejected for user '{user}'")]
pub struct AuthError {
    pub user: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Connection(ConnectionError::Io(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
