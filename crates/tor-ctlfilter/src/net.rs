//! Opening and accepting TCP and unix-domain stream sockets.

use std::io;
use std::path::PathBuf;

use futures::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio_util::compat::TokioAsyncReadCompatExt as _;
use tracing::debug;

use crate::endpoint::Endpoint;

/// A byte stream that we can read and write.
pub(crate) trait ReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> ReadWrite for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A stream of either kind, with the type erased.
pub(crate) type BoxedStream = Box<dyn ReadWrite>;

/// Open a stream to `endpoint`.
pub(crate) async fn connect(endpoint: &Endpoint) -> io::Result<BoxedStream> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let s = tokio::net::TcpStream::connect(addr).await?;
            Ok(Box::new(s.compat()))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let s = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(s.compat()))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(io::ErrorKind::Unsupported.into()),
    }
}

/// Write all of `buf` to `writer`, then flush it.
pub(crate) async fn write_all_and_flush<W>(writer: &mut W, buf: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(buf).await?;
    writer.flush().await
}

/// What we know about the process on the other end of an accepted stream.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct PeerInfo {
    /// The executable of the peer process, if we could find it.
    ///
    /// Only available for unix-domain peers.
    pub exe: Option<PathBuf>,
}

/// A bound listening socket.
pub(crate) enum Listener {
    /// A TCP listener.
    Tcp(tokio::net::TcpListener),
    /// A unix-domain listener, and the path it is bound to.
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

impl Listener {
    /// Bind a new listener at `endpoint`.
    pub(crate) async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(tokio::net::TcpListener::bind(addr).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Listener::Unix(
                tokio::net::UnixListener::bind(path)?,
                path.clone(),
            )),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    /// Return the endpoint that this listener is actually bound to.
    ///
    /// This differs from the requested endpoint if we asked for port 0.
    pub(crate) fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(l) => Ok(Endpoint::Tcp(l.local_addr()?)),
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Wait for a new connection.
    pub(crate) async fn accept(&self) -> io::Result<(BoxedStream, PeerInfo)> {
        match self {
            Listener::Tcp(l) => {
                let (s, addr) = l.accept().await?;
                debug!("Accepted TCP connection from {}", safelog::sensitive(addr));
                Ok((Box::new(s.compat()), PeerInfo::default()))
            }
            #[cfg(unix)]
            Listener::Unix(l, _) => {
                let (s, _) = l.accept().await?;
                let exe = peer_exe(&s);
                Ok((Box::new(s.compat()), PeerInfo { exe }))
            }
        }
    }

    /// Release this listener, removing its socket file if it has one.
    pub(crate) fn close(self) {
        match self {
            Listener::Tcp(l) => drop(l),
            #[cfg(unix)]
            Listener::Unix(l, path) => {
                drop(l);
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!("Unable to remove socket {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Find the executable of the process at the other end of `stream`.
#[cfg(unix)]
fn peer_exe(stream: &tokio::net::UnixStream) -> Option<PathBuf> {
    let pid = match stream.peer_cred() {
        Ok(cred) => cred.pid()?,
        Err(e) => {
            debug!("Unable to get peer credentials: {}", e);
            return None;
        }
    };
    exe_of_pid(pid)
}

/// Return the executable of process `pid`, from procfs.
#[cfg(unix)]
fn exe_of_pid(pid: libc::pid_t) -> Option<PathBuf> {
    let link = PathBuf::from(format!("/proc/{}/exe", pid));
    match std::fs::read_link(&link) {
        Ok(exe) => Some(exe),
        Err(e) => {
            debug!("Unable to read {}: {}", link.display(), e);
            None
        }
    }
}
