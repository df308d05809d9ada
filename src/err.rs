use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("carrier I/O error: {0}")]
    Carrier(#[from] io::Error),

    #[error("read/write/accept deadline elapsed")]
    Timeout,

    #[error("operation on a closed session or listener")]
    BrokenPipe,

    #[error("socket option not available on a session that does not own its carrier")]
    InvalidOperation,

    #[error("FEC codec error: {0}")]
    Fec(String),

    #[error("nonce source initialization failed: {0}")]
    NonceSource(String),

    #[error("malformed datagram: {0}")]
    Malformed(&'static str),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let msg = err.to_string();
        match err {
            Error::Carrier(e) => e,
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, msg),
            Error::BrokenPipe => io::Error::new(io::ErrorKind::BrokenPipe, msg),
            Error::InvalidOperation => io::Error::new(io::ErrorKind::Unsupported, msg),
            Error::Fec(_) | Error::NonceSource(_) | Error::Malformed(_) => {
                io::Error::new(io::ErrorKind::InvalidData, msg)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
