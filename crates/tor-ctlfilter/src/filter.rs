//! Deciding what to do with each command a client sends.

use std::fmt;
use std::sync::Arc;

use safelog::sensitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{Command, MalformedCommand, Strategy, is_separator};
use crate::endpoint::Endpoint;
use crate::policy::{Policy, RuleMatch};
use crate::portmap::parse_add_onion_ports;

/// The reply we send when a command is refused by policy.
pub const FILTERED_REPLY: &str = "510 Command filtered";

/// The reply we send when a policy requires authentication and the client
/// hasn't authenticated.
pub const AUTH_REQUIRED_REPLY: &str = "514 Authentication required";

/// Whether a listener enforces its policy, or only reports on it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum FilterMode {
    /// Refuse and rewrite commands as the policy says.
    #[default]
    Enforce,
    /// Forward every command unchanged, but log what the policy would have
    /// done with it.
    Watch,
}

/// Why a command was refused.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DenyReason {
    /// The policy has no rule allowing this command.
    #[error("not allowed by policy")]
    NotAllowed,
    /// An `ADD_ONION` port mapping pointed at a denied address.
    #[error("onion service target {0} is on the deny list")]
    DeniedOnionTarget(Endpoint),
    /// The client tried to negotiate credentials with us.
    #[error("authentication challenges are not supported")]
    CredentialNegotiation,
    /// The policy requires authentication, and the client hasn't done it.
    #[error("client has not authenticated")]
    AuthenticationRequired,
    /// The command could not be parsed well enough to check it.
    #[error("malformed command")]
    Malformed(#[source] MalformedCommand),
}

impl DenyReason {
    /// Return the status line to send to the client.
    pub fn reply(&self) -> &'static str {
        match self {
            DenyReason::AuthenticationRequired => AUTH_REQUIRED_REPLY,
            _ => FILTERED_REPLY,
        }
    }
}

/// A command that we answer ourselves, without forwarding it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LocalAnswer {
    /// Describe our (null) authentication method.
    ProtocolInfo,
    /// Report successful authentication.
    Authenticated,
    /// Say goodbye, and close the session.
    Quit,
}

/// What to do with one command.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Verdict {
    /// Forward the command unchanged.
    Allow,
    /// Forward this line instead of the command.
    Rewrite(String),
    /// Refuse the command; tell the client why.
    Deny(DenyReason),
    /// Answer the command ourselves.
    Answer(LocalAnswer),
}

impl Verdict {
    /// Return true if this verdict refuses the command.
    pub fn is_deny(&self) -> bool {
        matches!(self, Verdict::Deny(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "allow"),
            Verdict::Rewrite(_) => write!(f, "rewrite"),
            Verdict::Deny(reason) => write!(f, "deny ({})", reason),
            Verdict::Answer(_) => write!(f, "answer locally"),
        }
    }
}

/// The outcome of filtering one command.
///
/// In [`FilterMode::Enforce`], the effective verdict is the policy's
/// verdict.  In [`FilterMode::Watch`], refusals and rewrites are replaced
/// with [`Verdict::Allow`], but the policy's verdict is kept here so that it
/// can be reported.
#[derive(Clone, Debug)]
pub struct Decision {
    /// What we are actually going to do.
    effective: Verdict,
    /// What the policy said to do.
    policy: Verdict,
}

impl Decision {
    /// Return the verdict to act on.
    pub fn verdict(&self) -> &Verdict {
        &self.effective
    }

    /// Return the verdict that the policy produced.
    pub fn policy_verdict(&self) -> &Verdict {
        &self.policy
    }

    /// Return true if watch mode overrode the policy's verdict.
    pub fn overridden(&self) -> bool {
        !matches!(
            (&self.effective, &self.policy),
            (Verdict::Allow, Verdict::Allow)
                | (Verdict::Rewrite(_), Verdict::Rewrite(_))
                | (Verdict::Deny(_), Verdict::Deny(_))
                | (Verdict::Answer(_), Verdict::Answer(_))
        )
    }
}

/// Check every port mapping of an `ADD_ONION` command against `deny`.
///
/// `args` is everything after the `ADD_ONION` keyword.  Malformed mappings
/// are refused, as is a command with no mappings at all.
pub fn check_add_onion<'a, I>(args: &str, deny: I) -> Result<(), DenyReason>
where
    I: IntoIterator<Item = &'a Endpoint> + Clone,
{
    let mappings = parse_add_onion_ports(args).map_err(DenyReason::Malformed)?;
    for mapping in &mappings {
        if deny
            .clone()
            .into_iter()
            .any(|denied| denied.covers(mapping.target()))
        {
            return Err(DenyReason::DeniedOnionTarget(mapping.target().clone()));
        }
    }
    Ok(())
}

/// Applies a [`Policy`] to the commands of a single session.
///
/// A `CommandFilter` is stateful only in that it remembers whether the
/// client has sent `AUTHENTICATE`.
#[derive(Clone, Debug)]
pub struct CommandFilter {
    /// The policy for this session.
    policy: Arc<Policy>,
    /// Whether to enforce the policy.
    mode: FilterMode,
    /// Onion service targets that are denied whatever the policy says.
    ///
    /// These are the addresses of the proxy itself and of the real control
    /// port.
    implicit_deny: Vec<Endpoint>,
    /// True if the client has sent `AUTHENTICATE`.
    authenticated: bool,
}

impl CommandFilter {
    /// Create a new filter applying `policy`.
    pub fn new(policy: Arc<Policy>, mode: FilterMode) -> Self {
        CommandFilter {
            policy,
            mode,
            implicit_deny: Vec::new(),
            authenticated: false,
        }
    }

    /// Add `targets` to the onion service deny list for this filter only.
    #[must_use]
    pub fn with_denied_targets(mut self, targets: impl IntoIterator<Item = Endpoint>) -> Self {
        self.implicit_deny.extend(targets);
        self
    }

    /// Return the mode of this filter.
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Decide what to do with `line`, a command line without its terminator.
    pub fn evaluate(&mut self, line: &str) -> Decision {
        let policy = match Command::parse(line) {
            Ok(cmd) => self.policy_verdict(&cmd),
            Err(e) => Verdict::Deny(DenyReason::Malformed(e)),
        };
        self.decide(line, policy)
    }

    /// As [`evaluate`](Self::evaluate), but for a line that might not be
    /// UTF-8.
    pub fn evaluate_bytes(&mut self, line: &[u8]) -> Decision {
        match std::str::from_utf8(line) {
            Ok(line) => self.evaluate(line),
            Err(_) => {
                let verdict = Verdict::Deny(DenyReason::Malformed(MalformedCommand::InvalidUtf8));
                self.decide(&String::from_utf8_lossy(line), verdict)
            }
        }
    }

    /// Apply our mode to the policy's verdict, and log the result.
    fn decide(&mut self, line: &str, policy: Verdict) -> Decision {
        if matches!(policy, Verdict::Answer(LocalAnswer::Authenticated)) {
            self.authenticated = true;
        }
        let effective = match (self.mode, &policy) {
            (FilterMode::Watch, Verdict::Deny(_) | Verdict::Rewrite(_)) => Verdict::Allow,
            (_, v) => v.clone(),
        };
        let decision = Decision { effective, policy };

        let keyword = line.split(is_separator).next().unwrap_or_default();
        if decision.overridden() {
            info!(
                "Watch mode: would have applied \"{}\" to {} command",
                decision.policy, keyword
            );
        } else if decision.effective.is_deny() {
            info!("Refused {} command: {}", keyword, decision.effective);
        }
        debug!(
            "Filter verdict {} for command {}",
            decision.policy,
            sensitive(line)
        );
        decision
    }

    /// Work out what the policy says to do with `cmd`.
    fn policy_verdict(&self, cmd: &Command<'_>) -> Verdict {
        let kind = cmd.kind();
        if self.policy.require_authenticate()
            && !self.authenticated
            && !kind.permitted_before_auth()
        {
            return Verdict::Deny(DenyReason::AuthenticationRequired);
        }

        match kind.strategy() {
            Strategy::AnswerProtocolInfo => Verdict::Answer(LocalAnswer::ProtocolInfo),
            Strategy::AnswerAuthenticate => Verdict::Answer(LocalAnswer::Authenticated),
            Strategy::AnswerQuit => Verdict::Answer(LocalAnswer::Quit),
            Strategy::Refuse => Verdict::Deny(DenyReason::CredentialNegotiation),
            Strategy::Rules | Strategy::RulesThenOnionCheck => self.apply_rules(cmd),
        }
    }

    /// Apply the policy's allow and rewrite rules to `cmd`, then check the
    /// line that would be forwarded.
    fn apply_rules(&self, cmd: &Command<'_>) -> Verdict {
        let verdict = match self.policy.match_rules(cmd) {
            RuleMatch::NoMatch => return Verdict::Deny(DenyReason::NotAllowed),
            RuleMatch::Allowed => Verdict::Allow,
            RuleMatch::Rewrite(line) => Verdict::Rewrite(line),
        };

        // What matters is the line that goes upstream, which a rewrite may
        // have turned into a different command.
        let forwarded = match &verdict {
            Verdict::Rewrite(line) => match Command::parse(line) {
                Ok(c) => c,
                Err(e) => return Verdict::Deny(DenyReason::Malformed(e)),
            },
            _ => cmd.clone(),
        };
        match forwarded.kind().strategy() {
            Strategy::Rules => verdict,
            Strategy::RulesThenOnionCheck => {
                let deny = self
                    .policy
                    .deny_onions()
                    .iter()
                    .chain(self.implicit_deny.iter());
                match check_add_onion(forwarded.args(), deny) {
                    Ok(()) => verdict,
                    Err(reason) => Verdict::Deny(reason),
                }
            }
            // A rewrite must not turn a command into one we'd handle
            // ourselves.
            _ => Verdict::Deny(DenyReason::NotAllowed),
        }
    }
}
