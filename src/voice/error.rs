//! Voice connection errors and the platform close-code table.

use std::fmt::{self, Display, Formatter};

use tungstenite::error::{Error as WsError, ProtocolError as WsProtocolError};
use tungstenite::protocol::frame::CloseFrame;

use super::rtp::IpDiscoveryError;

/// Voice connection error.
#[derive(Debug)]
pub enum Error {
    /// The remote closed the socket with a known voice close code.
    Api(ApiError),
    /// The remote closed the socket without a recognized code.
    Closed(Option<CloseFrame<'static>>),
    Ws(WsError),
    Io(std::io::Error),
    Json(serde_json::Error),
    IpDiscovery(IpDiscoveryError),
    /// A frame arrived without its `d` payload.
    MissingPayload,
    /// The server offered no supported encryption mode.
    UnsupportedEncryption,
    /// Packet encryption failed.
    Crypto,
    /// The handshake did not finish within the deadline.
    Timeout,
}

impl Error {
    /// Checks if the error was a result of being disconnected gracefully.
    pub fn disconnected(&self) -> bool {
        matches!(self, Error::Api(err) if err.code == 4014)
    }

    /// Checks if we can safely resume after an error.
    pub fn can_resume(&self) -> bool {
        match self {
            Error::Api(err) => err.code == 4015,
            Error::Ws(WsError::Protocol(p)) => {
                matches!(p, WsProtocolError::ResetWithoutClosingHandshake)
            }
            _ => false,
        }
    }

    /// The close code and reason to report to clients, if this error came
    /// from the socket closing.
    pub fn close_info(&self) -> Option<(u16, String, bool)> {
        match self {
            Error::Api(err) => Some((err.code, err.message.clone(), true)),
            Error::Closed(Some(frame)) => {
                Some((frame.code.into(), frame.reason.clone().into_owned(), true))
            }
            Error::Closed(None) => Some((1000, String::new(), true)),
            Error::Timeout => Some((4000, String::from("Voice connection timed out"), false)),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Api(err) => Display::fmt(err, f),
            Error::Closed(frame) => write!(f, "closed: {:?}", frame),
            Error::Ws(err) => Display::fmt(err, f),
            Error::Io(err) => Display::fmt(err, f),
            Error::Json(err) => Display::fmt(err, f),
            Error::IpDiscovery(err) => Display::fmt(err, f),
            Error::MissingPayload => f.write_str("frame missing payload"),
            Error::UnsupportedEncryption => f.write_str("no supported encryption mode"),
            Error::Crypto => f.write_str("packet encryption failed"),
            Error::Timeout => f.write_str("voice handshake timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Ws(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::IpDiscovery(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Error {
        match err {
            WsError::Io(err) => Error::Io(err),
            err => Error::Ws(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<IpDiscoveryError> for Error {
    fn from(err: IpDiscoveryError) -> Error {
        Error::IpDiscovery(err)
    }
}

/// A close delivered by the voice endpoint.
#[derive(Clone, Debug)]
pub struct ApiError {
    pub code: u16,
    pub message: String,
}

impl ApiError {
    /// Builds an error from a close frame, substituting the documented
    /// reason for known codes.
    pub fn from_close(frame: &CloseFrame) -> Option<ApiError> {
        let code: u16 = frame.code.into();

        close_reason(code).map(|reason| ApiError {
            code,
            message: reason.to_owned(),
        })
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "#{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// The documented reason for a voice close code, for codes this server
/// recognizes.
pub fn close_reason(code: u16) -> Option<&'static str> {
    match code {
        4001 => Some("Unknown opcode"),
        4002 => Some("Failed to decode payload"),
        4003 => Some("Not authenticated"),
        4004 => Some("Authentication failed"),
        4005 => Some("Already authenticated"),
        4006 => Some("Session no longer valid"),
        4009 => Some("Session timeout"),
        4011 => Some("Server not found"),
        4012 => Some("Unknown protocol"),
        4014 => Some("Disconnected"),
        4015 => Some("Voice server crashed"),
        4016 => Some("Unknown encryption mode"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn known_codes_have_fixed_reasons() {
        assert_eq!(close_reason(4006), Some("Session no longer valid"));
        assert_eq!(close_reason(4015), Some("Voice server crashed"));
        assert_eq!(close_reason(4000), None);
        assert_eq!(close_reason(1000), None);
    }

    #[test]
    fn unknown_code_passes_reason_through() {
        let frame = CloseFrame {
            code: CloseCode::Library(4000),
            reason: "something else".into(),
        };

        assert!(ApiError::from_close(&frame).is_none());

        let err = Error::Closed(Some(frame));
        let (code, reason, by_remote) = err.close_info().unwrap();
        assert_eq!(code, 4000);
        assert_eq!(reason, "something else");
        assert!(by_remote);
    }

    #[test]
    fn resume_and_disconnect_classification() {
        let crashed = Error::Api(ApiError {
            code: 4015,
            message: String::new(),
        });
        assert!(crashed.can_resume());
        assert!(!crashed.disconnected());

        let kicked = Error::Api(ApiError {
            code: 4014,
            message: String::new(),
        });
        assert!(kicked.disconnected());
        assert!(!kicked.can_resume());
    }
}
