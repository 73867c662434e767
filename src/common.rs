#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The provided buffer is too short. For use with the `octets` module;
    /// also covers truncated varints.
    BufferTooShort,

    /// The packet header could not be parsed: short bytes, unknown version,
    /// or an implausible connection ID length.
    MalformedHeader,

    /// A frame's inner payload is neither microdata nor JSON of a known
    /// shape.
    MalformedFramePayload,

    /// A PROTECTED or HANDSHAKE packet matched no connection in the table.
    UnknownConnection,

    /// The remote credential failed verification or names the wrong issuer.
    InvalidCredential,

    /// The handshake deadline passed without reaching ESTABLISHED.
    HandshakeTimeout,

    /// No inbound traffic within the idle window.
    IdleTimeout,

    /// The peer reported an owner other than us. Permanent, not a retry.
    AlreadyOwnedByOther(String),

    /// The operation requires an ESTABLISHED connection.
    NotEstablished,

    /// A UDP send failed. Transient; the connection stays up.
    SendFailure,

    /// The operation cannot be completed because the connection is in an
    /// invalid state.
    InvalidState,

    /// other errors
    Other(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::AlreadyOwnedByOther(owner) => {
                write!(f, "Owned by different user: {owner}")
            }
            Error::HandshakeTimeout => write!(f, "Handshake timeout"),
            Error::IdleTimeout => write!(f, "Idle timeout"),
            Error::InvalidCredential => write!(f, "Invalid credential"),
            Error::NotEstablished => write!(f, "Connection not established"),
            _ => write!(f, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<octets::BufferTooShortError> for Error {
    fn from(_err: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

impl std::convert::From<serde_json::Error> for Error {
    fn from(_err: serde_json::Error) -> Self {
        Error::MalformedFramePayload
    }
}

// support conversion to String
impl std::convert::From<Error> for String {
    fn from(err: Error) -> Self {
        format!("{}", err)
    }
}

/// Milliseconds since the Unix epoch, for timestamps placed in frame
/// payloads.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
