use std::io;

/// The three error kinds that can arise while framing or decoding a
/// message, as distinct from a PAM status code propagated from the real
/// library across the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error talking to the peer")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("resource exhausted decoding a message")]
    Resource,
}

impl ProtocolError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ProtocolError::Protocol(msg.into())
    }

    /// An unexpected end of file on a pipe is reported the same way as any
    /// other I/O error: the wire format has no notion of a clean
    /// mid-message close.
    pub fn unexpected_eof() -> Self {
        ProtocolError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the pipe"))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
