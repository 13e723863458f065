//! A single filtered client connection.
//!
//! A [`Session`] owns one client stream and one control port connection.
//! It authenticates to the control port, then relays between the two,
//! passing each client command through a [`CommandFilter`] on the way.

use std::fmt;
use std::sync::Arc;

use asynchronous_codec::FramedRead;
use futures::io::WriteHalf;
use futures::{AsyncRead, AsyncReadExt as _, AsyncWrite, FutureExt as _, Stream, StreamExt as _};
use tracing::debug;

use crate::codec::LineCodec;
use crate::command::quote;
use crate::err::Error;
use crate::filter::{CommandFilter, LocalAnswer, Verdict};
use crate::handshake::{Handshake, UpstreamConfig, UpstreamConn};
use crate::net::{BoxedStream, write_all_and_flush};

/// What we say to a client that authenticates to us.
const AUTHENTICATED_REPLY: &[u8] = b"250 OK\r\n";

/// What we say to a client that sends `QUIT`.
const QUIT_REPLY: &[u8] = b"250 closing connection\r\n";

/// The stages that a session goes through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SessionState {
    /// Opening a connection to the control port.
    Connecting,
    /// Connected; proving ourselves to the control port.
    Authenticating,
    /// Passing commands and replies back and forth.
    Relaying,
    /// Finished normally.
    Closed,
    /// Finished because of an error.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a session finished without error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SessionEnd {
    /// The client closed its connection.
    ClientClosed,
    /// The control port closed its connection.
    UpstreamClosed,
    /// The client sent `QUIT`.
    ClientQuit,
}

/// One client's filtered connection to the control port.
pub struct Session<S> {
    /// The client's stream.
    downstream: S,
    /// How to reach the control port.
    upstream: Arc<UpstreamConfig>,
    /// The filter for this client's commands.
    filter: CommandFilter,
    /// Where we are.
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Create a new session for the client on `downstream`.
    ///
    /// Nothing happens until [`run`](Self::run) is called.
    pub fn new(downstream: S, upstream: Arc<UpstreamConfig>, filter: CommandFilter) -> Self {
        Session {
            downstream,
            upstream,
            filter,
            state: SessionState::Connecting,
        }
    }

    /// Run this session until one side closes, or until something goes wrong.
    ///
    /// If we can't authenticate to the control port, we close the client's
    /// connection without sending it anything.
    pub async fn run(mut self) -> Result<SessionEnd, Error> {
        let result = self.run_inner().await;
        match &result {
            Ok(end) => {
                self.set_state(SessionState::Closed);
                debug!("Session ended: {:?}", end);
            }
            Err(_) => self.set_state(SessionState::Failed),
        }
        result
    }

    /// Record and log a state transition.
    fn set_state(&mut self, state: SessionState) {
        debug!("Session state: {} -> {}", self.state, state);
        self.state = state;
    }

    /// Helper for `run`: connect, authenticate, and relay.
    async fn run_inner(&mut self) -> Result<SessionEnd, Error> {
        let upstream = Arc::clone(&self.upstream);
        let handshake = Handshake::new(&upstream);
        let conn = handshake.connect().await?;
        self.set_state(SessionState::Authenticating);
        let conn = handshake.authenticate(conn).await?;
        self.set_state(SessionState::Relaying);
        self.relay(conn).await
    }

    /// Relay between the client and the authenticated control port
    /// connection `conn`.
    async fn relay(&mut self, conn: UpstreamConn) -> Result<SessionEnd, Error> {
        let endpoint = self.upstream.address().clone();
        let UpstreamConn {
            replies,
            writer: mut up_writer,
            info,
        } = conn;
        let mut replies = replies.fuse();

        let (down_reader, mut down_writer) = (&mut self.downstream).split();
        let mut lines = FramedRead::new(down_reader, LineCodec::default()).fuse();

        // True while a forwarded command is waiting for its reply.
        let mut in_flight = false;

        loop {
            futures::select! {
                reply = replies.next() => {
                    let reply = match reply {
                        None => return Ok(SessionEnd::UpstreamClosed),
                        Some(Err(e)) => return Err(Error::from_upstream_read(&endpoint, e)),
                        Some(Ok(r)) => r,
                    };
                    if !reply.is_async_event() {
                        if !in_flight {
                            return Err(Error::UpstreamProtocol {
                                endpoint,
                                problem: format!("unsolicited reply {:?}", reply.summary()),
                            });
                        }
                        in_flight = false;
                    }
                    to_client(&mut down_writer, reply.as_bytes()).await?;
                }

                line = next_unless(&mut lines, in_flight).fuse() => {
                    let line = match line {
                        None => return Ok(SessionEnd::ClientClosed),
                        Some(Err(e)) => return Err(Error::from_client_read(e)),
                        Some(Ok(l)) => l,
                    };
                    let decision = self.filter.evaluate_bytes(&line);
                    match decision.verdict() {
                        Verdict::Allow => {
                            to_upstream(&mut up_writer, &line).await?;
                            in_flight = true;
                        }
                        Verdict::Rewrite(new_line) => {
                            to_upstream(&mut up_writer, new_line.as_bytes()).await?;
                            in_flight = true;
                        }
                        Verdict::Deny(reason) => {
                            let reply = format!("{}\r\n", reason.reply());
                            to_client(&mut down_writer, reply.as_bytes()).await?;
                        }
                        Verdict::Answer(LocalAnswer::ProtocolInfo) => {
                            let reply = protocolinfo_reply(info.tor_version.as_deref());
                            to_client(&mut down_writer, reply.as_bytes()).await?;
                        }
                        Verdict::Answer(LocalAnswer::Authenticated) => {
                            to_client(&mut down_writer, AUTHENTICATED_REPLY).await?;
                        }
                        Verdict::Answer(LocalAnswer::Quit) => {
                            to_client(&mut down_writer, QUIT_REPLY).await?;
                            return Ok(SessionEnd::ClientQuit);
                        }
                    }
                }
            }
        }
    }
}

/// Return the next item from `stream`, or wait forever if `blocked` is set.
async fn next_unless<St>(stream: &mut St, blocked: bool) -> Option<St::Item>
where
    St: Stream + Unpin,
{
    if blocked {
        futures::future::pending().await
    } else {
        stream.next().await
    }
}

/// Send `line`, and a line terminator, to the control port.
async fn to_upstream(writer: &mut WriteHalf<BoxedStream>, line: &[u8]) -> Result<(), Error> {
    let mut buf = Vec::with_capacity(line.len() + 2);
    buf.extend_from_slice(line);
    buf.extend_from_slice(b"\r\n");
    write_all_and_flush(writer, &buf)
        .await
        .map_err(|e| Error::UpstreamIo(Arc::new(e)))
}

/// Send `data` to the client.
async fn to_client<W>(writer: &mut W, data: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    write_all_and_flush(writer, data)
        .await
        .map_err(|e| Error::ClientIo(Arc::new(e)))
}

/// Build our answer to a client's `PROTOCOLINFO`.
///
/// We offer only `NULL` authentication: the client's credential, if any, is
/// never checked.
pub(crate) fn protocolinfo_reply(tor_version: Option<&str>) -> String {
    let mut reply = String::from("250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n");
    if let Some(v) = tor_version {
        reply.push_str(&format!("250-VERSION Tor={}\r\n", quote(v)));
    }
    reply.push_str("250 OK\r\n");
    reply
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::filter::FilterMode;
    use crate::policy::{Policy, PolicyBuilder};
    use assert_matches::assert_matches;
    use std::sync::Mutex;
    use tokio::io::{
        AsyncBufRead, AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader,
    };
    use tokio_util::compat::TokioAsyncReadCompatExt as _;

    /// A fake control port that accepts one connection, records the lines
    /// it gets, and answers "250 OK" to everything after the handshake.
    ///
    /// After `SETEVENTS`, it also sends an event.
    async fn fake_control_port() -> (Arc<UpstreamConfig>, Arc<Mutex<Vec<String>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let (r, mut w) = s.into_split();
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                seen2.lock().unwrap().push(line.clone());
                let answer = match line.as_str() {
                    "PROTOCOLINFO" => {
                        "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"0.4.8.9\"\r\n250 OK\r\n"
                    }
                    "SETEVENTS BW" => "250 OK\r\n650 BW 10 20\r\n",
                    "GETINFO config-text" => "250+config-text=\r\nSocksPort 0\r\n.\r\n250 OK\r\n",
                    _ => "250 OK\r\n",
                };
                if w.write_all(answer.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        let mut b = UpstreamConfig::builder();
        b.address(Endpoint::Tcp(addr));
        (Arc::new(b.build().unwrap()), seen)
    }

    async fn next_line<R: AsyncBufRead + Unpin>(r: &mut R) -> String {
        let mut line = String::new();
        r.read_line(&mut line).await.unwrap();
        line
    }

    fn policy(toml_text: &str) -> Arc<Policy> {
        let b: PolicyBuilder = toml::from_str(toml_text).unwrap();
        Arc::new(b.build().unwrap())
    }

    #[test]
    fn protocolinfo_answer() {
        assert_eq!(
            protocolinfo_reply(Some("0.4.8.9")),
            "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"0.4.8.9\"\r\n250 OK\r\n"
        );
        assert_eq!(
            protocolinfo_reply(None),
            "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250 OK\r\n"
        );
    }

    #[tokio::test]
    async fn relay() {
        let (upstream, seen) = fake_control_port().await;
        let filter = CommandFilter::new(
            policy(
                r#"
                allow_commands = ["SETEVENTS", "GETINFO"]
                rewrite_lines = { "GETINFO secret" = "GETINFO version" }
                "#,
            ),
            FilterMode::Enforce,
        );
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(Session::new(server.compat(), upstream, filter).run());

        let (r, mut w) = tokio::io::split(client);
        let mut r = BufReader::new(r);

        w.write_all(b"PROTOCOLINFO 1\r\n").await.unwrap();
        assert_eq!(next_line(&mut r).await, "250-PROTOCOLINFO 1\r\n");
        assert_eq!(next_line(&mut r).await, "250-AUTH METHODS=NULL\r\n");
        assert_eq!(next_line(&mut r).await, "250-VERSION Tor=\"0.4.8.9\"\r\n");
        assert_eq!(next_line(&mut r).await, "250 OK\r\n");

        w.write_all(b"AUTHENTICATE \"whatever\"\n").await.unwrap();
        assert_eq!(next_line(&mut r).await, "250 OK\r\n");

        w.write_all(b"SIGNAL NEWNYM\r\n").await.unwrap();
        assert_eq!(next_line(&mut r).await, "510 Command filtered\r\n");

        w.write_all(b"SETEVENTS BW\r\n").await.unwrap();
        assert_eq!(next_line(&mut r).await, "250 OK\r\n");
        assert_eq!(next_line(&mut r).await, "650 BW 10 20\r\n");

        w.write_all(b"GETINFO config-text\r\n").await.unwrap();
        assert_eq!(next_line(&mut r).await, "250+config-text=\r\n");
        assert_eq!(next_line(&mut r).await, "SocksPort 0\r\n");
        assert_eq!(next_line(&mut r).await, ".\r\n");
        assert_eq!(next_line(&mut r).await, "250 OK\r\n");

        w.write_all(b"GETINFO secret\r\n").await.unwrap();
        assert_eq!(next_line(&mut r).await, "250 OK\r\n");

        w.write_all(b"QUIT\r\n").await.unwrap();
        assert_eq!(next_line(&mut r).await, "250 closing connection\r\n");
        assert_matches!(session.await.unwrap(), Ok(SessionEnd::ClientQuit));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "PROTOCOLINFO",
                "AUTHENTICATE",
                "SETEVENTS BW",
                "GETINFO config-text",
                "GETINFO version",
            ]
        );
    }

    #[tokio::test]
    async fn client_closes() {
        let (upstream, _seen) = fake_control_port().await;
        let filter = CommandFilter::new(Arc::new(Policy::default()), FilterMode::Enforce);
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(Session::new(server.compat(), upstream, filter).run());
        drop(client);
        assert_matches!(session.await.unwrap(), Ok(SessionEnd::ClientClosed));
    }

    #[tokio::test]
    async fn handshake_failure_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = UpstreamConfig::builder();
        b.address(Endpoint::Unix(dir.path().join("nothing-here")));
        let filter = CommandFilter::new(Arc::new(Policy::default()), FilterMode::Enforce);
        let (mut client, server) = tokio::io::duplex(4096);
        let result = Session::new(server.compat(), Arc::new(b.build().unwrap()), filter)
            .run()
            .await;
        assert_matches!(result, Err(Error::UpstreamUnreachable { .. }));

        // The session is gone, and it never said anything.
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn line_too_long() {
        let (upstream, seen) = fake_control_port().await;
        let filter = CommandFilter::new(Arc::new(Policy::default()), FilterMode::Enforce);
        let (client, server) = tokio::io::duplex(1 << 20);
        let session = tokio::spawn(Session::new(server.compat(), upstream, filter).run());
        let (_r, mut w) = tokio::io::split(client);
        let long = vec![b'A'; crate::codec::MAX_LINE_LEN + 10];
        w.write_all(&long).await.unwrap();
        assert_matches!(session.await.unwrap(), Err(Error::ClientLineTooLong(_)));
        assert_eq!(*seen.lock().unwrap(), vec!["PROTOCOLINFO", "AUTHENTICATE"]);
    }
}
