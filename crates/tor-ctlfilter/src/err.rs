//! Declare an error type for the tor-ctlfilter crate.

use std::io::Error as IoError;
use std::path::PathBuf;
use std::sync::Arc;

use tor_error::{ErrorKind, HasKind};

use crate::codec::CodecError;
use crate::endpoint::Endpoint;

/// An error that ends a filtering session, or stops a listener.
///
/// Refused commands are not errors: they are answered and the session
/// continues.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// We couldn't connect to the control port.
    #[error("Unable to connect to control port at {endpoint}")]
    UpstreamUnreachable {
        /// The address we tried.
        endpoint: Endpoint,
        /// What went wrong.
        #[source]
        cause: Arc<IoError>,
    },

    /// The control port took too long to let us authenticate.
    #[error("Timed out while authenticating to control port at {0}")]
    HandshakeTimeout(Endpoint),

    /// The control port answered one of our handshake commands with an
    /// error.
    #[error("Control port at {endpoint} refused {command}: {reply:?}")]
    UpstreamRefused {
        /// The control port.
        endpoint: Endpoint,
        /// The command that was refused.
        command: &'static str,
        /// The first line of the reply.
        reply: String,
    },

    /// The control port said something we didn't understand, or said it
    /// at the wrong time.
    #[error("Protocol violation from control port at {endpoint}: {problem}")]
    UpstreamProtocol {
        /// The control port.
        endpoint: Endpoint,
        /// What was wrong.
        problem: String,
    },

    /// None of the authentication methods that the control port offers are
    /// ones we're configured (or able) to use.
    #[error("No usable authentication method (control port offers {offered:?})")]
    NoUsableAuth {
        /// The methods that the control port listed.
        offered: Vec<String>,
    },

    /// We couldn't read the authentication cookie.
    #[error("Unable to read authentication cookie from {}", path.display())]
    CookieUnreadable {
        /// Where we looked for the cookie.
        path: PathBuf,
        /// What went wrong.
        #[source]
        cause: Arc<IoError>,
    },

    /// Reading from or writing to the client failed.
    #[error("I/O error on client connection")]
    ClientIo(#[source] Arc<IoError>),

    /// Reading from or writing to the control port failed.
    #[error("I/O error on control port connection")]
    UpstreamIo(#[source] Arc<IoError>),

    /// The client sent a line that was too long.
    #[error("Client sent a line longer than {0} bytes")]
    ClientLineTooLong(usize),

    /// We couldn't open a listener.
    #[error("Unable to listen on {endpoint}")]
    Listen {
        /// The address we tried to listen on.
        endpoint: Endpoint,
        /// What went wrong.
        #[source]
        cause: Arc<IoError>,
    },

    /// An internal error of some kind that should never occur.
    #[error("Internal error")]
    Bug(#[from] tor_error::Bug),
}

impl Error {
    /// Return true if this error only means that one side of the connection
    /// went away.
    pub fn is_connection_close(&self) -> bool {
        use std::io::ErrorKind as IK;
        #[allow(clippy::match_like_matches_macro)]
        match self {
            Self::ClientIo(e) | Self::UpstreamIo(e) => match e.kind() {
                IK::UnexpectedEof
                | IK::ConnectionAborted
                | IK::ConnectionReset
                | IK::BrokenPipe => true,
                _ => false,
            },
            _ => false,
        }
    }

    /// Construct an error from a failure while reading the client's lines.
    pub(crate) fn from_client_read(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => Self::ClientIo(Arc::new(e)),
            CodecError::LineTooLong(n) => Self::ClientLineTooLong(n),
            CodecError::BadReplyLine(_) => {
                tor_error::internal!("Reply decoding error on client stream").into()
            }
        }
    }

    /// Construct an error from a failure while reading replies from the
    /// control port at `endpoint`.
    pub(crate) fn from_upstream_read(endpoint: &Endpoint, e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => Self::UpstreamIo(Arc::new(e)),
            CodecError::BadReplyLine(line) => Self::UpstreamProtocol {
                endpoint: endpoint.clone(),
                problem: format!("malformed reply line {:?}", line),
            },
            CodecError::LineTooLong(_) => {
                tor_error::internal!("Line length limit on control port stream").into()
            }
        }
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::UpstreamUnreachable { .. } | E::HandshakeTimeout(_) | E::UpstreamIo(_) => {
                EK::LocalNetworkError
            }
            E::UpstreamRefused { .. } | E::UpstreamProtocol { .. } => EK::TorProtocolViolation,
            E::NoUsableAuth { .. } | E::CookieUnreadable { .. } => EK::InvalidConfig,
            E::ClientIo(_) => EK::LocalNetworkError,
            E::ClientLineTooLong(_) => EK::RemoteProtocolViolation,
            E::Listen { cause, .. } => match cause.kind() {
                std::io::ErrorKind::AddrInUse => EK::LocalResourceAlreadyInUse,
                _ => EK::LocalNetworkError,
            },
            E::Bug(e) => e.kind(),
        }
    }
}
