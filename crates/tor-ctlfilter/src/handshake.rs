//! Connecting and authenticating to the real control port.
//!
//! Before a session relays anything, it asks the control port which
//! authentication methods it supports (`PROTOCOLINFO`), picks one, and
//! authenticates (`AUTHENTICATE`).  Clients never see the credential.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use asynchronous_codec::FramedRead;
use derive_builder::Builder;
use futures::io::{ReadHalf, WriteHalf};
use futures::{AsyncReadExt as _, StreamExt as _};
use safelog::Sensitive;
use serde::{Deserialize, Serialize};
use tor_config::{ConfigBuildError, impl_standard_builder};
use tracing::debug;

use crate::codec::{Reply, ReplyCodec};
use crate::command::{quote, split_args, unquote};
use crate::endpoint::Endpoint;
use crate::err::Error;
use crate::net::{self, BoxedStream, write_all_and_flush};

/// How long we give the control port to let us in, by default.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which authentication method to use with the control port.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum UpstreamAuth {
    /// Use `NULL` if the control port offers it, and `COOKIE` otherwise.
    #[default]
    Auto,
    /// No authentication.
    Null,
    /// Cookie authentication, using the cookie file that the control port
    /// names.
    Cookie,
    /// Cookie authentication, using a cookie from this file.
    CookieFile(PathBuf),
    /// Password authentication.
    Password(Sensitive<String>),
}

/// Where to find the real control port, and how to log in to it.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[builder_struct_attr(serde(deny_unknown_fields))]
pub struct UpstreamConfig {
    /// The address of the control port.
    ///
    /// Defaults to Tor's usual `127.0.0.1:9051`.
    #[builder(default = "default_address()")]
    address: Endpoint,

    /// How to authenticate.
    #[builder(default)]
    auth: UpstreamAuth,

    /// How long the whole connect-and-authenticate handshake may take.
    #[builder(default = "DEFAULT_HANDSHAKE_TIMEOUT")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    handshake_timeout: Duration,
}

impl_standard_builder! { UpstreamConfig }

/// Return the default control port address.
fn default_address() -> Endpoint {
    Endpoint::Tcp(std::net::SocketAddr::from(([127, 0, 0, 1], 9051)))
}

impl UpstreamConfig {
    /// Return the address of the control port.
    pub fn address(&self) -> &Endpoint {
        &self.address
    }

    /// Return the configured authentication method.
    pub fn auth(&self) -> &UpstreamAuth {
        &self.auth
    }

    /// Return the handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

/// What the control port told us in answer to `PROTOCOLINFO`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct ProtocolInfo {
    /// The authentication methods on offer, upper-cased.
    pub auth_methods: Vec<String>,
    /// The cookie file, if cookie authentication is available.
    pub cookie_file: Option<PathBuf>,
    /// The version of Tor, if it said.
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    /// Extract a `ProtocolInfo` from a successful `PROTOCOLINFO` reply.
    pub fn from_reply(reply: &Reply) -> Result<Self, String> {
        let mut info = ProtocolInfo::default();
        for line in reply.lines() {
            let (keyword, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            let args = split_args(rest).map_err(|e| format!("{} line: {}", keyword, e))?;
            let values = args.iter().filter_map(|a| a.split_once('='));
            match keyword {
                "AUTH" => {
                    for (k, v) in values {
                        match k {
                            "METHODS" => info.auth_methods.extend(
                                v.split(',')
                                    .filter(|m| !m.is_empty())
                                    .map(str::to_ascii_uppercase),
                            ),
                            "COOKIEFILE" => {
                                let path = unquote(v).map_err(|e| format!("COOKIEFILE: {}", e))?;
                                info.cookie_file = Some(path.into());
                            }
                            _ => {}
                        }
                    }
                }
                "VERSION" => {
                    for (k, v) in values {
                        if k == "Tor" {
                            info.tor_version =
                                Some(unquote(v).map_err(|e| format!("VERSION: {}", e))?);
                        }
                    }
                }
                _ => {}
            }
        }
        if info.auth_methods.is_empty() {
            return Err("no authentication methods listed".into());
        }
        Ok(info)
    }

    /// Return true if the control port offers `method`.
    pub fn offers(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// The credential we've decided to present.
#[derive(Clone, Debug)]
enum Credential {
    /// Nothing at all.
    Null,
    /// The contents of a cookie file.
    Cookie(PathBuf),
    /// A password.
    Password(Sensitive<String>),
}

impl Credential {
    /// Pick a credential based on our configuration and what the control
    /// port offers.
    fn choose(
        endpoint: &Endpoint,
        auth: &UpstreamAuth,
        info: &ProtocolInfo,
    ) -> Result<Self, Error> {
        let unusable = || Error::NoUsableAuth {
            offered: info.auth_methods.clone(),
        };
        let advertised_cookie = || {
            info.cookie_file.clone().ok_or_else(|| Error::UpstreamProtocol {
                endpoint: endpoint.clone(),
                problem: "offered COOKIE authentication without a COOKIEFILE".into(),
            })
        };
        match auth {
            UpstreamAuth::Auto if info.offers("NULL") => Ok(Credential::Null),
            UpstreamAuth::Auto if info.offers("COOKIE") => {
                Ok(Credential::Cookie(advertised_cookie()?))
            }
            UpstreamAuth::Null if info.offers("NULL") => Ok(Credential::Null),
            UpstreamAuth::Cookie if info.offers("COOKIE") => {
                Ok(Credential::Cookie(advertised_cookie()?))
            }
            UpstreamAuth::CookieFile(path) if info.offers("COOKIE") => {
                Ok(Credential::Cookie(path.clone()))
            }
            UpstreamAuth::Password(pw) if info.offers("HASHEDPASSWORD") => {
                Ok(Credential::Password(pw.clone()))
            }
            _ => Err(unusable()),
        }
    }

    /// Return the `AUTHENTICATE` command that presents this credential.
    async fn command(&self) -> Result<Sensitive<String>, Error> {
        let line = match self {
            Credential::Null => "AUTHENTICATE".to_owned(),
            Credential::Cookie(path) => {
                format!("AUTHENTICATE {}", hex::encode(read_cookie(path).await?))
            }
            Credential::Password(pw) => format!("AUTHENTICATE {}", quote(pw.as_inner())),
        };
        Ok(Sensitive::new(line))
    }

    /// Return the name of this method, for logging.
    fn method_name(&self) -> &'static str {
        match self {
            Credential::Null => "NULL",
            Credential::Cookie(_) => "COOKIE",
            Credential::Password(_) => "HASHEDPASSWORD",
        }
    }
}

/// Read an authentication cookie from `path`.
///
/// The read happens on tokio's blocking pool, so a slow filesystem can't
/// stall other sessions.
async fn read_cookie(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.map_err(|e| Error::CookieUnreadable {
        path: path.to_owned(),
        cause: Arc::new(e),
    })
}

/// An authenticated connection to the control port.
pub(crate) struct UpstreamConn {
    /// Replies from the control port.
    pub(crate) replies: FramedRead<ReadHalf<BoxedStream>, ReplyCodec>,
    /// Where to send commands.
    pub(crate) writer: WriteHalf<BoxedStream>,
    /// What the control port said about itself.
    pub(crate) info: ProtocolInfo,
}

impl std::fmt::Debug for UpstreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConn")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// A connection to the control port that is partway through the
/// handshake.
pub(crate) struct Connected {
    /// Replies from the control port.
    replies: FramedRead<ReadHalf<BoxedStream>, ReplyCodec>,
    /// Where to send commands.
    writer: WriteHalf<BoxedStream>,
}

/// The connect-and-authenticate handshake with a control port.
///
/// Both steps together must finish within the configured handshake
/// timeout.
pub(crate) struct Handshake<'a> {
    /// The control port to use.
    config: &'a UpstreamConfig,
    /// When we give up.
    deadline: tokio::time::Instant,
}

impl<'a> Handshake<'a> {
    /// Begin a handshake with the control port in `config`.
    pub(crate) fn new(config: &'a UpstreamConfig) -> Self {
        Handshake {
            config,
            deadline: tokio::time::Instant::now() + config.handshake_timeout,
        }
    }

    /// Run `fut`, failing with a timeout error if the deadline passes first.
    async fn before_deadline<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .unwrap_or_else(|_| Err(Error::HandshakeTimeout(self.config.address.clone())))
    }

    /// Open a connection to the control port.
    pub(crate) async fn connect(&self) -> Result<Connected, Error> {
        let endpoint = &self.config.address;
        let stream = self
            .before_deadline(async {
                net::connect(endpoint)
                    .await
                    .map_err(|e| Error::UpstreamUnreachable {
                        endpoint: endpoint.clone(),
                        cause: Arc::new(e),
                    })
            })
            .await?;
        debug!("Connected to control port at {}", endpoint);

        let (reader, writer) = stream.split();
        Ok(Connected {
            replies: FramedRead::new(reader, ReplyCodec::default()),
            writer,
        })
    }

    /// Find out how to authenticate on `conn`, and do so.
    pub(crate) async fn authenticate(&self, conn: Connected) -> Result<UpstreamConn, Error> {
        self.before_deadline(self.authenticate_inner(conn)).await
    }

    /// Implementation for `authenticate`, without the timeout.
    async fn authenticate_inner(&self, conn: Connected) -> Result<UpstreamConn, Error> {
        let endpoint = &self.config.address;
        let Connected {
            mut replies,
            mut writer,
        } = conn;

        send(&mut writer, "PROTOCOLINFO").await?;
        let reply = next_reply(endpoint, &mut replies).await?;
        if !reply.is_success() {
            return Err(Error::UpstreamRefused {
                endpoint: endpoint.clone(),
                command: "PROTOCOLINFO",
                reply: reply.summary(),
            });
        }
        let info = ProtocolInfo::from_reply(&reply).map_err(|problem| Error::UpstreamProtocol {
            endpoint: endpoint.clone(),
            problem,
        })?;

        let credential = Credential::choose(endpoint, &self.config.auth, &info)?;
        debug!(
            "Authenticating to control port at {} with {}",
            endpoint,
            credential.method_name()
        );
        send(&mut writer, credential.command().await?.as_inner()).await?;
        let reply = next_reply(endpoint, &mut replies).await?;
        if !reply.is_success() {
            return Err(Error::UpstreamRefused {
                endpoint: endpoint.clone(),
                command: "AUTHENTICATE",
                reply: reply.summary(),
            });
        }

        Ok(UpstreamConn {
            replies,
            writer,
            info,
        })
    }
}

/// Send a single command line.
async fn send(writer: &mut WriteHalf<BoxedStream>, line: &str) -> Result<(), Error> {
    let mut buf = Vec::with_capacity(line.len() + 2);
    buf.extend_from_slice(line.as_bytes());
    buf.extend_from_slice(b"\r\n");
    write_all_and_flush(writer, &buf)
        .await
        .map_err(|e| Error::UpstreamIo(Arc::new(e)))
}

/// Wait for the answer to the command we just sent.
///
/// No events should arrive before we authenticate, but if any do, we skip
/// them.
async fn next_reply(
    endpoint: &Endpoint,
    replies: &mut FramedRead<ReadHalf<BoxedStream>, ReplyCodec>,
) -> Result<Reply, Error> {
    loop {
        match replies.next().await {
            Some(Ok(r)) if r.is_async_event() => continue,
            Some(Ok(r)) => return Ok(r),
            Some(Err(e)) => return Err(Error::from_upstream_read(endpoint, e)),
            None => {
                return Err(Error::UpstreamProtocol {
                    endpoint: endpoint.clone(),
                    problem: "connection closed during handshake".into(),
                });
            }
        }
    }
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
    use asynchronous_codec::Decoder as _;
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

    async fn connect_upstream(config: &UpstreamConfig) -> Result<UpstreamConn, Error> {
        let hs = Handshake::new(config);
        let conn = hs.connect().await?;
        hs.authenticate(conn).await
    }

    fn reply(text: &str) -> Reply {
        let mut buf = BytesMut::from(text.as_bytes());
        ReplyCodec::default().decode(&mut buf).unwrap().unwrap()
    }

    fn info(text: &str) -> Result<ProtocolInfo, String> {
        ProtocolInfo::from_reply(&reply(text))
    }

    #[test]
    fn protocolinfo() {
        let i = info(
            "250-PROTOCOLINFO 1\r\n\
             250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/run/tor/control.authcookie\"\r\n\
             250-VERSION Tor=\"0.4.8.9\"\r\n\
             250 OK\r\n",
        )
        .unwrap();
        assert_eq!(i.auth_methods, vec!["COOKIE", "SAFECOOKIE"]);
        assert_eq!(
            i.cookie_file.as_deref(),
            Some(Path::new("/run/tor/control.authcookie"))
        );
        assert_eq!(i.tor_version.as_deref(), Some("0.4.8.9"));
        assert!(i.offers("COOKIE"));
        assert!(!i.offers("NULL"));

        let i = info("250-PROTOCOLINFO 1\n250-AUTH METHODS=NULL\n250 OK\n").unwrap();
        assert_eq!(i.auth_methods, vec!["NULL"]);
        assert_eq!(i.tor_version, None);

        assert!(info("250-PROTOCOLINFO 1\r\n250 OK\r\n").is_err());
        assert!(info("250-AUTH METHODS=\r\n250 OK\r\n").is_err());
        assert!(info("250-AUTH METHODS=NULL COOKIEFILE=\"/x\r\n250 OK\r\n").is_err());
    }

    #[tokio::test]
    async fn choose_credential() {
        let ep: Endpoint = "127.0.0.1:9051".parse().unwrap();
        let mk = |methods: &[&str], cookie: Option<&str>| ProtocolInfo {
            auth_methods: methods.iter().map(|s| s.to_string()).collect(),
            cookie_file: cookie.map(PathBuf::from),
            tor_version: None,
        };
        let choose = |auth: &UpstreamAuth, info: &ProtocolInfo| Credential::choose(&ep, auth, info);

        let null_and_cookie = mk(&["NULL", "COOKIE"], Some("/c"));
        assert_matches!(choose(&UpstreamAuth::Auto, &null_and_cookie), Ok(Credential::Null));
        assert_matches!(
            choose(&UpstreamAuth::Cookie, &null_and_cookie),
            Ok(Credential::Cookie(p)) if p == Path::new("/c")
        );

        let cookie = mk(&["COOKIE", "SAFECOOKIE"], Some("/c"));
        assert_matches!(choose(&UpstreamAuth::Auto, &cookie), Ok(Credential::Cookie(_)));
        assert_matches!(
            choose(&UpstreamAuth::Null, &cookie),
            Err(Error::NoUsableAuth { .. })
        );
        assert_matches!(
            choose(&UpstreamAuth::CookieFile("/other".into()), &cookie),
            Ok(Credential::Cookie(p)) if p == Path::new("/other")
        );

        let no_file = mk(&["COOKIE"], None);
        assert_matches!(
            choose(&UpstreamAuth::Auto, &no_file),
            Err(Error::UpstreamProtocol { .. })
        );

        let safecookie_only = mk(&["SAFECOOKIE"], Some("/c"));
        assert_matches!(
            choose(&UpstreamAuth::Auto, &safecookie_only),
            Err(Error::NoUsableAuth { .. })
        );

        let password = mk(&["HASHEDPASSWORD"], None);
        let pw = UpstreamAuth::Password(Sensitive::new("a \"b\"".into()));
        let cred = choose(&pw, &password).unwrap();
        assert_eq!(
            cred.command().await.unwrap().as_inner(),
            r#"AUTHENTICATE "a \"b\"""#
        );
        assert_matches!(
            choose(&UpstreamAuth::Auto, &password),
            Err(Error::NoUsableAuth { .. })
        );
    }

    #[tokio::test]
    async fn cookie_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        std::fs::write(&path, [0x01_u8, 0xab, 0xff]).unwrap();
        let cred = Credential::Cookie(path);
        assert_eq!(
            cred.command().await.unwrap().as_inner(),
            "AUTHENTICATE 01abff"
        );

        let cred = Credential::Cookie(dir.path().join("missing"));
        assert_matches!(cred.command().await, Err(Error::CookieUnreadable { .. }));
    }

    #[test]
    fn config() {
        let c: UpstreamConfigBuilder = toml::from_str(
            r#"
            address = "unix:/run/tor/control"
            auth = { password = "hunter2" }
            handshake_timeout = "3 sec"
            "#,
        )
        .unwrap();
        let c = c.build().unwrap();
        assert_eq!(c.address(), &Endpoint::Unix("/run/tor/control".into()));
        assert_eq!(
            c.auth(),
            &UpstreamAuth::Password(Sensitive::new("hunter2".into()))
        );
        assert_eq!(c.handshake_timeout(), Duration::from_secs(3));

        let c: UpstreamConfigBuilder = toml::from_str(r#"auth = "cookie""#).unwrap();
        let c = c.build().unwrap();
        assert_eq!(c.auth(), &UpstreamAuth::Cookie);
        assert_eq!(c.handshake_timeout(), DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(c.address(), &default_address());

        let c: UpstreamConfigBuilder =
            toml::from_str(r#"auth = { cookie_file = "/var/lib/tor/cookie" }"#).unwrap();
        assert_eq!(
            c.build().unwrap().auth(),
            &UpstreamAuth::CookieFile("/var/lib/tor/cookie".into())
        );

        assert!(toml::from_str::<UpstreamConfigBuilder>("port = 9051").is_err());
    }

    /// Run a one-connection fake control port that answers with `answers`,
    /// in order, and returns the lines it received.
    async fn fake_control_port(
        answers: Vec<&'static str>,
    ) -> (UpstreamConfig, tokio::task::JoinHandle<Vec<String>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let (r, mut w) = s.into_split();
            let mut lines = BufReader::new(r).lines();
            let mut seen = Vec::new();
            for answer in answers {
                let Some(line) = lines.next_line().await.unwrap() else {
                    break;
                };
                seen.push(line);
                w.write_all(answer.as_bytes()).await.unwrap();
            }
            seen
        });
        let mut b = UpstreamConfig::builder();
        b.address(Endpoint::Tcp(addr));
        (b.build().unwrap(), task)
    }

    #[tokio::test]
    async fn handshake_ok() {
        let (config, task) = fake_control_port(vec![
            "250-PROTOCOLINFO 1\n250-AUTH METHODS=NULL\n250-VERSION Tor=\"0.2.7.6\"\n250 OK\n",
            "250 OK\r\n",
        ])
        .await;
        let conn = connect_upstream(&config).await.unwrap();
        assert_eq!(conn.info.tor_version.as_deref(), Some("0.2.7.6"));
        assert_eq!(task.await.unwrap(), vec!["PROTOCOLINFO", "AUTHENTICATE"]);
    }

    #[tokio::test]
    async fn handshake_refused() {
        let (config, _task) = fake_control_port(vec!["510 PROTOCOLINFO denied.\r\n"]).await;
        assert_matches!(
            connect_upstream(&config).await,
            Err(Error::UpstreamRefused {
                command: "PROTOCOLINFO",
                ..
            })
        );

        let (config, _task) = fake_control_port(vec![
            "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250 OK\r\n",
            "515 Authentication failed\r\n",
        ])
        .await;
        assert_matches!(
            connect_upstream(&config).await,
            Err(Error::UpstreamRefused {
                command: "AUTHENTICATE",
                ..
            })
        );
    }

    #[tokio::test]
    async fn handshake_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut b = UpstreamConfig::builder();
        b.address(Endpoint::Tcp(listener.local_addr().unwrap()))
            .handshake_timeout(Duration::from_millis(100));
        let config = b.build().unwrap();
        // Accept, but never answer.
        let _task = tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(s);
        });
        assert_matches!(
            connect_upstream(&config).await,
            Err(Error::HandshakeTimeout(_))
        );
    }

    #[tokio::test]
    async fn unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = UpstreamConfig::builder();
        b.address(Endpoint::Unix(dir.path().join("123")));
        assert_matches!(
            connect_upstream(&b.build().unwrap()).await,
            Err(Error::UpstreamUnreachable { .. })
        );
    }
}
