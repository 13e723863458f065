//! Filter policies: what a client is allowed to ask the control port to do.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tor_config::{ConfigBuildError, impl_standard_builder};

use crate::command::Command;
use crate::endpoint::Endpoint;

/// A set of rules describing which control commands a client may issue.
///
/// A policy is immutable once built.  Sessions hold it by `Arc`, and a
/// configuration reload replaces the whole policy rather than changing it.
///
/// The default policy allows nothing except the commands that the proxy
/// always answers itself (`PROTOCOLINFO`, `AUTHENTICATE`, and `QUIT`).
///
/// A line is checked against the rules in this order; the first match wins:
///
///  1. `rewrite_lines`: the line is replaced by the associated value.
///  2. `rewrite_prefixes`: if the line starts with a key, the whole line is
///     replaced by the associated value.  The longest matching key wins.
///  3. `allow_lines`: the line is allowed as-is.
///  4. `allow_prefixes`: the line is allowed as-is.
///  5. `allow_commands`: the line is allowed as-is if its keyword is listed.
///     Keywords are compared without regard to case.
///
/// Lines that match no rule are refused.  `ADD_ONION` commands that pass
/// these rules must also pass the `deny_onions` check.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError", validate = "Self::validate"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[builder_struct_attr(serde(deny_unknown_fields))]
pub struct Policy {
    /// Command keywords that are allowed with any arguments.
    #[builder(default)]
    allow_commands: Vec<String>,

    /// Complete command lines that are allowed.
    #[builder(default)]
    allow_lines: Vec<String>,

    /// Prefixes of command lines that are allowed.
    #[builder(default)]
    allow_prefixes: Vec<String>,

    /// Complete command lines that are replaced before being forwarded.
    #[builder(default)]
    rewrite_lines: BTreeMap<String, String>,

    /// Prefixes of command lines whose lines are replaced before being
    /// forwarded.
    #[builder(default)]
    rewrite_prefixes: BTreeMap<String, String>,

    /// Addresses that must never be the target of an onion service created
    /// with `ADD_ONION`.
    #[builder(default)]
    deny_onions: Vec<Endpoint>,

    /// If true, clients must send `AUTHENTICATE` before anything else is
    /// accepted.
    ///
    /// The proxy accepts any credential; this only exists for clients that
    /// misbehave if a control port lets them skip authentication.
    #[builder(default)]
    require_authenticate: bool,

    /// Executables this policy applies to, for listeners that choose a
    /// policy by looking at the connecting process.
    #[builder(default)]
    exec_paths: Vec<PathBuf>,
}

impl_standard_builder! { Policy }

/// The result of checking a line against a [`Policy`]'s rules.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum RuleMatch {
    /// A rewrite rule matched; forward this line instead.
    Rewrite(String),
    /// An allow rule matched.
    Allowed,
    /// Nothing matched.
    NoMatch,
}

impl Policy {
    /// Check `cmd` against this policy's allow and rewrite rules.
    pub(crate) fn match_rules(&self, cmd: &Command<'_>) -> RuleMatch {
        let line = cmd.line();
        if let Some(replacement) = self.rewrite_lines.get(line) {
            return RuleMatch::Rewrite(replacement.clone());
        }
        if let Some((_, replacement)) = self
            .rewrite_prefixes
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
        {
            return RuleMatch::Rewrite(replacement.clone());
        }
        if self.allow_lines.iter().any(|l| l == line)
            || self.allow_prefixes.iter().any(|p| line.starts_with(p.as_str()))
            || self
                .allow_commands
                .iter()
                .any(|c| c.eq_ignore_ascii_case(cmd.keyword()))
        {
            return RuleMatch::Allowed;
        }
        RuleMatch::NoMatch
    }

    /// Return the deny list for `ADD_ONION` targets.
    pub fn deny_onions(&self) -> &[Endpoint] {
        &self.deny_onions
    }

    /// Return true if clients must authenticate before issuing commands.
    pub fn require_authenticate(&self) -> bool {
        self.require_authenticate
    }

    /// Return the executables this policy applies to.
    pub fn exec_paths(&self) -> &[PathBuf] {
        &self.exec_paths
    }
}

impl PolicyBuilder {
    /// Check that the rules can be applied safely.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        /// Return true if `s` would let a rule smuggle a line break upstream.
        fn bad_chars(s: &str) -> bool {
            s.contains(['\r', '\n', '\0'])
        }
        let invalid = |field: &str, problem: String| ConfigBuildError::Invalid {
            field: field.to_owned(),
            problem,
        };

        for keyword in self.allow_commands.iter().flatten() {
            if keyword.is_empty() || keyword.contains(char::is_whitespace) || bad_chars(keyword) {
                return Err(invalid(
                    "allow_commands",
                    format!("{:?} is not a command keyword", keyword),
                ));
            }
        }
        for line in self.allow_lines.iter().flatten() {
            if line.is_empty() || bad_chars(line) {
                return Err(invalid("allow_lines", format!("bad line {:?}", line)));
            }
        }
        for prefix in self.allow_prefixes.iter().flatten() {
            if prefix.is_empty() || bad_chars(prefix) {
                return Err(invalid("allow_prefixes", format!("bad prefix {:?}", prefix)));
            }
        }
        for (field, map) in [
            ("rewrite_lines", &self.rewrite_lines),
            ("rewrite_prefixes", &self.rewrite_prefixes),
        ] {
            for (from, to) in map.iter().flatten() {
                if from.is_empty() || bad_chars(from) {
                    return Err(invalid(field, format!("bad pattern {:?}", from)));
                }
                if to.is_empty() || bad_chars(to) || to.starts_with('+') {
                    return Err(invalid(field, format!("bad replacement {:?}", to)));
                }
            }
        }
        Ok(())
    }
}

/// A collection of named policies.
#[derive(Clone, Debug, Default)]
pub struct PolicySet {
    /// The policies, by name.
    policies: BTreeMap<String, Arc<Policy>>,
}

impl PolicySet {
    /// Return a new empty `PolicySet`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `policy` under `name`, replacing any policy that had that name.
    pub fn insert(&mut self, name: impl Into<String>, policy: Policy) {
        self.policies.insert(name.into(), Arc::new(policy));
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Policy>> {
        self.policies.get(name)
    }

    /// Find the policy that applies to the executable at `exe`, if any.
    ///
    /// If several policies list the same executable, the one whose name
    /// sorts first is used.
    pub fn for_exec_path(&self, exe: &Path) -> Option<(&str, &Arc<Policy>)> {
        self.policies
            .iter()
            .find(|(_, p)| p.exec_paths.iter().any(|path| path == exe))
            .map(|(name, p)| (name.as_str(), p))
    }

    /// Return an iterator over the names of the policies in this set.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Return the number of policies in this set.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Return true if this set has no policies.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// The current [`PolicySet`], shared between listeners and the code that
/// reloads policies.
///
/// Readers take a snapshot and keep using it; [`replace`](Self::replace)
/// publishes a new set without affecting anyone holding an old snapshot.
#[derive(Debug)]
pub struct PolicyStore {
    /// The current set of policies.
    //
    // We hold the lock only long enough to clone or swap the Arc.
    current: Mutex<Arc<PolicySet>>,
}

impl PolicyStore {
    /// Create a new store holding `policies`.
    pub fn new(policies: PolicySet) -> Self {
        PolicyStore {
            current: Mutex::new(Arc::new(policies)),
        }
    }

    /// Return the current set of policies.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        Arc::clone(&self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the current set of policies, returning the old one.
    pub fn replace(&self, policies: PolicySet) -> Arc<PolicySet> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(policies))
    }
}
