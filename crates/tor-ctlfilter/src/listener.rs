//! Listening for clients, and launching a session for each one.

use std::io::Error as IoError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt as _;
use futures::channel::oneshot;
use tokio::task::JoinHandle;
use tor_error::{debug_report, internal, warn_report};
use tracing::{Instrument as _, debug, info, warn};

use crate::endpoint::Endpoint;
use crate::err::Error;
use crate::filter::{CommandFilter, FilterMode};
use crate::handshake::UpstreamConfig;
use crate::net::{BoxedStream, Listener, PeerInfo, write_all_and_flush};
use crate::policy::{Policy, PolicyStore};
use crate::session::Session;

/// What we tell a client for whom we have no policy, before hanging up.
pub const NO_POLICY_REPLY: &str = "550 No filter policy available for this client";

/// How a listener decides which policy applies to a client.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PolicySelector {
    /// Every client gets the policy with this name.
    Named(String),
    /// Each client gets the policy that lists its executable in
    /// `exec_paths`.
    ///
    /// This only works for unix-domain listeners, on systems with procfs.
    ByExecPath,
}

/// A listener that has not been started yet.
#[derive(Clone, Debug)]
pub struct FilterListener {
    /// Where to listen.
    endpoint: Endpoint,
    /// How to pick a policy.
    selector: PolicySelector,
    /// Whether to enforce policies or only watch.
    mode: FilterMode,
    /// The control port that sessions connect to.
    upstream: Arc<UpstreamConfig>,
    /// The current set of policies.
    policies: Arc<PolicyStore>,
    /// Extra onion service targets to refuse, besides those from the policy.
    denied_targets: Vec<Endpoint>,
}

impl FilterListener {
    /// Describe a new listener on `endpoint`.
    pub fn new(
        endpoint: Endpoint,
        selector: PolicySelector,
        upstream: Arc<UpstreamConfig>,
        policies: Arc<PolicyStore>,
    ) -> Self {
        FilterListener {
            endpoint,
            selector,
            mode: FilterMode::Enforce,
            upstream,
            policies,
            denied_targets: Vec::new(),
        }
    }

    /// Set the mode for this listener's sessions.
    #[must_use]
    pub fn mode(mut self, mode: FilterMode) -> Self {
        self.mode = mode;
        self
    }

    /// Refuse onion services that target any of `targets`.
    ///
    /// The control port and this listener's own address are always refused;
    /// this is for anything else, such as the proxy's other listeners.
    #[must_use]
    pub fn with_denied_targets(mut self, targets: impl IntoIterator<Item = Endpoint>) -> Self {
        self.denied_targets.extend(targets);
        self
    }

    /// Return the address we were asked to listen on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Bind our socket and start accepting clients in a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(self) -> Result<ListenerHandle, Error> {
        let listen_err = |e: IoError| Error::Listen {
            endpoint: self.endpoint.clone(),
            cause: Arc::new(e),
        };
        let listener = Listener::bind(&self.endpoint).await.map_err(listen_err)?;
        let local = listener.local_endpoint().map_err(listen_err)?;
        info!("Listening for control connections on {}.", local);
        if self.selector == PolicySelector::ByExecPath && !local.is_unix() {
            warn!(
                "Listener {} selects policies by executable, but only unix sockets can tell us the client's executable.",
                local
            );
        }

        let mut denied = vec![self.upstream.address().clone(), local.clone()];
        denied.extend(self.denied_targets);
        let ctx = Arc::new(ListenerContext {
            local: local.clone(),
            selector: self.selector,
            mode: self.mode,
            upstream: self.upstream,
            policies: self.policies,
            denied,
            next_session: AtomicU64::new(0),
        });

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, ctx, rx));
        Ok(ListenerHandle {
            local,
            shutdown: tx,
            task,
        })
    }
}

/// A running listener.
///
/// Dropping this handle also stops the listener, but without waiting for
/// it to finish.
#[derive(Debug)]
pub struct ListenerHandle {
    /// The address we're actually bound to.
    local: Endpoint,
    /// Used to tell the accept loop to stop.
    shutdown: oneshot::Sender<()>,
    /// The accept loop.
    task: JoinHandle<Result<(), Error>>,
}

impl ListenerHandle {
    /// Return the address that this listener is bound to.
    ///
    /// If we asked for TCP port 0, this has the real port.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Stop accepting clients, close the socket, and wait for the accept
    /// loop to finish.
    ///
    /// Sessions that are already running are not affected.
    ///
    /// Returns the error that stopped the accept loop, if it had already
    /// stopped on its own.
    pub async fn stop(self) -> Result<(), Error> {
        // If the loop has already exited, there's nobody to tell.
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(internal!("Accept loop for {} panicked: {}", self.local, e).into()),
        }
    }
}

/// State shared between a listener's accept loop and its sessions.
struct ListenerContext {
    /// The address we're bound to.
    local: Endpoint,
    /// How to pick a policy.
    selector: PolicySelector,
    /// Whether to enforce policies or only watch.
    mode: FilterMode,
    /// The control port.
    upstream: Arc<UpstreamConfig>,
    /// The current set of policies.
    policies: Arc<PolicyStore>,
    /// Onion service targets that every session refuses.
    denied: Vec<Endpoint>,
    /// Counter used to label sessions in the logs.
    next_session: AtomicU64,
}

impl ListenerContext {
    /// Find the policy that applies to `peer`, using the current snapshot.
    fn select_policy(&self, peer: &PeerInfo) -> Option<Arc<Policy>> {
        let policies = self.policies.snapshot();
        match &self.selector {
            PolicySelector::Named(name) => policies.get(name).cloned(),
            PolicySelector::ByExecPath => {
                let exe = peer.exe.as_deref()?;
                let (name, policy) = policies.for_exec_path(exe)?;
                debug!("Client {} gets policy {:?}", exe.display(), name);
                Some(Arc::clone(policy))
            }
        }
    }

    /// Launch a task to handle the newly accepted client on `stream`.
    fn launch(self: &Arc<Self>, stream: BoxedStream, peer: PeerInfo) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!("session", listener = %self.local, id);
        let policy = self.select_policy(&peer);
        let ctx = Arc::clone(self);
        tokio::spawn(
            async move {
                match policy {
                    Some(policy) => ctx.run_session(stream, policy).await,
                    None => refuse_client(stream, &peer).await,
                }
            }
            .instrument(span),
        );
    }

    /// Run a session for `stream`, under `policy`.
    async fn run_session(&self, stream: BoxedStream, policy: Arc<Policy>) {
        let filter = CommandFilter::new(policy, self.mode).with_denied_targets(self.denied.clone());
        match Session::new(stream, Arc::clone(&self.upstream), filter).run().await {
            Ok(end) => debug!("Session finished: {:?}", end),
            Err(e) if e.is_connection_close() => debug_report!(e, "Session closed"),
            Err(e) => warn_report!(e, "Session on {} failed", self.local),
        }
    }
}

/// Tell a client that we have nothing for it, and hang up.
async fn refuse_client(mut stream: BoxedStream, peer: &PeerInfo) {
    info!(
        "No filter policy for client (executable: {}); disconnecting.",
        peer.exe
            .as_deref()
            .map_or_else(|| "unknown".into(), |p| p.display().to_string())
    );
    let reply = format!("{}\r\n", NO_POLICY_REPLY);
    if let Err(e) = write_all_and_flush(&mut stream, reply.as_bytes()).await {
        debug!("Couldn't send refusal to client: {}", e);
    }
}

/// Return true if a given error, when received from accept, is a fatal
/// error.
fn accept_err_is_fatal(err: &IoError) -> bool {
    #![allow(clippy::match_like_matches_macro)]

    // Running out of file descriptors isn't distinguished by ErrorKind;
    // we need to use OS-specific errors.
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(libc::EMFILE) | Some(libc::ENFILE) => return false,
        _ => {}
    }
    match err.kind() {
        std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset => false,
        _ => true,
    }
}

/// Accept clients on `listener` until told to stop via `shutdown`, or until
/// a fatal error.
async fn accept_loop(
    listener: Listener,
    ctx: Arc<ListenerContext>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), Error> {
    let result = loop {
        let accepted = futures::select! {
            _ = shutdown => None,
            r = listener.accept().fuse() => Some(r),
        };
        match accepted {
            None => break Ok(()),
            Some(Ok((stream, peer))) => ctx.launch(stream, peer),
            Some(Err(e)) if accept_err_is_fatal(&e) => {
                break Err(Error::Listen {
                    endpoint: ctx.local.clone(),
                    cause: Arc::new(e),
                });
            }
            Some(Err(e)) => warn!("Incoming connection on {} failed: {}", ctx.local, e),
        }
    };
    listener.close();
    info!("Stopped listening on {}.", ctx.local);
    result
}
