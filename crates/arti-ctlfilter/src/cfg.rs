//! Configuration for the arti-ctlfilter command line application
//
// (This module is called `cfg` to match the `arti` binary's layout.)

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow, bail};
use derive_builder::Builder;
use fs_mistrust::Mistrust;
use serde::{Deserialize, Serialize};
use tor_config::{
    ConfigBuildError, define_list_builder_accessors, define_list_builder_helper,
    impl_standard_builder,
};
use tor_ctlfilter::{
    Endpoint, FilterMode, Policy, PolicyBuilder, PolicySelector, PolicySet, UpstreamConfig,
    UpstreamConfigBuilder,
};
use tracing::debug;

use crate::logging::{LoggingConfig, LoggingConfigBuilder};

/// Example configuration file.
///
/// This is the text of `ctlfilter-example-config.toml`.
pub const CTLFILTER_EXAMPLE_CONFIG: &str = include_str!("./ctlfilter-example-config.toml");

/// Structure to hold our application configuration options
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[builder_struct_attr(serde(deny_unknown_fields))]
pub(crate) struct ApplicationConfig {
    /// If true, we should watch our configuration file and policy directory
    /// for changes, and reload our policies when they change.
    ///
    /// `SIGHUP` triggers a reload whether or not this is set.
    #[builder(default)]
    pub(crate) watch_configuration: bool,
}
impl_standard_builder! { ApplicationConfig }

/// Configuration for a single filtering listener.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError", validate = "Self::validate"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[builder_struct_attr(serde(deny_unknown_fields))]
pub(crate) struct ListenerConfig {
    /// Where to listen for clients.
    address: Endpoint,

    /// The name of the policy that applies to every client of this listener.
    ///
    /// Exactly one of `policy` or `by_exec_path` must be set.
    #[builder(default, setter(into, strip_option))]
    policy: Option<String>,

    /// If true, choose each client's policy by the path of the executable
    /// that connected to us.
    ///
    /// Only works for `unix:` listeners on Linux.
    #[builder(default)]
    by_exec_path: bool,

    /// If true, log what this listener would refuse, but forward everything.
    #[builder(default)]
    watch: bool,
}
impl_standard_builder! { ListenerConfig: !Default }

impl ListenerConfigBuilder {
    /// Return an error unless exactly one way of choosing a policy is set.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        let named = matches!(&self.policy, Some(Some(_)));
        let by_exec_path = self.by_exec_path.unwrap_or(false);
        match (named, by_exec_path) {
            (true, false) | (false, true) => Ok(()),
            (false, false) => Err(ConfigBuildError::MissingField {
                field: "{policy or by_exec_path}".into(),
            }),
            (true, true) => Err(ConfigBuildError::Inconsistent {
                fields: vec!["policy".into(), "by_exec_path".into()],
                problem: "'policy' is mutually exclusive with 'by_exec_path'".into(),
            }),
        }
    }
}

impl ListenerConfig {
    /// Return the address to listen on.
    pub(crate) fn address(&self) -> &Endpoint {
        &self.address
    }

    /// Return the name of the fixed policy for this listener, if it has one.
    pub(crate) fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    /// Return how this listener picks a policy for each client.
    pub(crate) fn selector(&self) -> PolicySelector {
        match &self.policy {
            Some(name) => PolicySelector::Named(name.clone()),
            None => PolicySelector::ByExecPath,
        }
    }

    /// Return the filter mode for this listener.
    ///
    /// `force_watch` comes from the command line, and overrides the
    /// configuration.
    pub(crate) fn mode(&self, force_watch: bool) -> FilterMode {
        if self.watch || force_watch {
            FilterMode::Watch
        } else {
            FilterMode::Enforce
        }
    }
}

/// Local type alias, mostly helpful for derive_builder to DTRT
type ListenerListConfig = Vec<ListenerConfig>;

define_list_builder_helper! {
    struct ListenerListConfigBuilder {
        listeners: [ListenerConfigBuilder],
    }
    built: ListenerListConfig = listeners;
    default = vec![];
}

define_list_builder_accessors! {
    struct CtlFilterConfigBuilder {
        pub(crate) listeners: [ListenerConfigBuilder],
    }
}

/// Structure to hold the whole of our configuration.
///
/// Policies can come from two places: the `[policies]` table of the
/// configuration file, and the `*.toml` files in `policy_dir`.  This
/// structure only holds the first kind; see [`load_policies`].
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(private, name = "build_unvalidated", error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[builder_struct_attr(serde(deny_unknown_fields))]
pub(crate) struct CtlFilterConfig {
    /// The control port we're guarding.
    #[builder(sub_builder(fn_name = "build"))]
    #[builder_field_attr(serde(default))]
    upstream: UpstreamConfig,

    /// The sockets where we accept clients.
    #[builder_field_attr(serde(default))]
    #[builder(sub_builder(fn_name = "build"), setter(custom))]
    listeners: ListenerListConfig,

    /// Named policies.
    #[builder_field_attr(serde(default))]
    #[builder(
        field(
            type = "BTreeMap<String, PolicyBuilder>",
            build = "build_policy_map(&self.policies)?"
        ),
        setter(custom)
    )]
    policies: BTreeMap<String, Policy>,

    /// A directory of further policies, one per `NAME.toml` file.
    #[builder(default, setter(into, strip_option))]
    policy_dir: Option<PathBuf>,

    /// Logging configuration
    #[builder(sub_builder(fn_name = "build"))]
    #[builder_field_attr(serde(default))]
    logging: LoggingConfig,

    /// Configuration for application behavior.
    #[builder(sub_builder(fn_name = "build"))]
    #[builder_field_attr(serde(default))]
    application: ApplicationConfig,
}
impl_standard_builder! { CtlFilterConfig: !Default }

/// Build every policy in `policies`.
fn build_policy_map(
    policies: &BTreeMap<String, PolicyBuilder>,
) -> Result<BTreeMap<String, Policy>, ConfigBuildError> {
    policies
        .iter()
        .map(|(name, b)| {
            let policy = b.build().map_err(|e| ConfigBuildError::Invalid {
                field: format!("policies.{}", name),
                problem: e.to_string(),
            })?;
            Ok((name.clone(), policy))
        })
        .collect()
}

impl CtlFilterConfigBuilder {
    /// Return a mutable reference to the named policy builders.
    pub(crate) fn policies(&mut self) -> &mut BTreeMap<String, PolicyBuilder> {
        &mut self.policies
    }

    /// Build the [`CtlFilterConfig`], checking the listeners for consistency.
    pub(crate) fn build(&self) -> Result<CtlFilterConfig, ConfigBuildError> {
        let config = self.build_unvalidated()?;

        if config.listeners.is_empty() {
            return Err(ConfigBuildError::MissingField {
                field: "listeners".into(),
            });
        }
        let mut seen = HashSet::new();
        for listener in &config.listeners {
            if listener.address() == config.upstream.address() {
                return Err(ConfigBuildError::Inconsistent {
                    fields: vec!["listeners.address".into(), "upstream.address".into()],
                    problem: format!("{} is the control port itself", listener.address()),
                });
            }
            if !seen.insert(listener.address()) {
                return Err(ConfigBuildError::Invalid {
                    field: "listeners.address".into(),
                    problem: format!("{} is used more than once", listener.address()),
                });
            }
        }

        Ok(config)
    }
}

impl CtlFilterConfig {
    /// Return the configuration for the control port.
    pub(crate) fn upstream(&self) -> &UpstreamConfig {
        &self.upstream
    }

    /// Return the configured listeners.
    pub(crate) fn listeners(&self) -> &[ListenerConfig] {
        &self.listeners
    }

    /// Return the policy directory, if there is one.
    pub(crate) fn policy_dir(&self) -> Option<&Path> {
        self.policy_dir.as_deref()
    }

    /// Return the [`LoggingConfig`] for this configuration.
    pub(crate) fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    /// Return the [`ApplicationConfig`] for this configuration.
    pub(crate) fn application(&self) -> &ApplicationConfig {
        &self.application
    }
}

/// Check the permissions on `path`, then read it.
fn read_checked(path: &Path, mistrust: &Mistrust) -> anyhow::Result<String> {
    mistrust
        .verifier()
        .permit_readable()
        .require_file()
        .check(path)
        .with_context(|| format!("Permission problem on {}", path.display()))?;
    std::fs::read_to_string(path).with_context(|| format!("Unable to read {}", path.display()))
}

/// Parse a configuration from the text of a TOML file.
pub(crate) fn parse_config(text: &str) -> anyhow::Result<CtlFilterConfig> {
    let builder: CtlFilterConfigBuilder = toml::from_str(text).context("Malformed configuration")?;
    builder.build().context("Invalid configuration")
}

/// Read and parse the configuration file at `path`.
pub(crate) fn load_config(path: &Path, mistrust: &Mistrust) -> anyhow::Result<CtlFilterConfig> {
    let text = read_checked(path, mistrust)?;
    parse_config(&text).with_context(|| format!("In {}", path.display()))
}

/// Return the name that a file in the policy directory defines a policy
/// for, or None if we should ignore the file.
fn policy_file_name(path: &Path) -> Option<&str> {
    if path.extension()? != "toml" {
        return None;
    }
    let name = path.file_stem()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    Some(name)
}

/// Collect every policy that `config` names or points to.
///
/// Fails if a policy is defined twice, if any policy is invalid, or if a
/// listener names a policy that doesn't exist.
pub(crate) fn load_policies(
    config: &CtlFilterConfig,
    mistrust: &Mistrust,
) -> anyhow::Result<PolicySet> {
    let mut set = PolicySet::new();
    for (name, policy) in &config.policies {
        set.insert(name.clone(), policy.clone());
    }

    if let Some(dir) = config.policy_dir() {
        mistrust
            .verifier()
            .permit_readable()
            .require_directory()
            .check(dir)
            .with_context(|| format!("Permission problem on {}", dir.display()))?;
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Unable to list policy directory {}", dir.display()))?
        {
            files.push(entry?.path());
        }
        files.sort();

        for path in &files {
            let Some(name) = policy_file_name(path) else {
                debug!("Ignoring {} in policy directory", path.display());
                continue;
            };
            if set.get(name).is_some() {
                bail!("Policy {:?} is defined twice", name);
            }
            let text = read_checked(path, mistrust)?;
            let builder: PolicyBuilder = toml::from_str(&text)
                .with_context(|| format!("Malformed policy in {}", path.display()))?;
            let policy = builder
                .build()
                .with_context(|| format!("Invalid policy in {}", path.display()))?;
            set.insert(name, policy);
        }
    }

    for listener in config.listeners() {
        if let Some(name) = listener.policy() {
            if set.get(name).is_none() {
                return Err(anyhow!(
                    "Listener {} uses policy {:?}, which does not exist",
                    listener.address(),
                    name
                ));
            }
        }
    }

    Ok(set)
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
    use std::time::Duration;
    use tor_ctlfilter::UpstreamAuth;

    /// A minimal valid configuration.
    const MINIMAL: &str = r#"
        [[listeners]]
        address = "127.0.0.1:9052"
        policy = "p"

        [policies.p]
        allow_commands = ["GETINFO"]
    "#;

    #[test]
    fn example_config() {
        let config = parse_config(CTLFILTER_EXAMPLE_CONFIG).unwrap();
        assert_eq!(
            config.upstream().address(),
            &"unix:/var/run/tor/control".parse().unwrap()
        );
        assert_eq!(config.upstream().auth(), &UpstreamAuth::Cookie);
        assert_eq!(config.upstream().handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.listeners().len(), 2);
        assert_eq!(
            config.listeners()[0].selector(),
            PolicySelector::Named("onionshare".into())
        );
        assert_eq!(config.listeners()[1].selector(), PolicySelector::ByExecPath);
        assert_eq!(config.listeners()[1].mode(false), FilterMode::Watch);
        assert!(config.policy_dir().is_none());
        assert!(!config.application().watch_configuration);

        let policies = load_policies(&config, &Mistrust::new_dangerously_trust_everyone()).unwrap();
        assert_eq!(
            policies.names().collect::<Vec<_>>(),
            vec!["onionshare", "ricochet"]
        );
    }

    #[test]
    fn minimal_config() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.upstream(), &UpstreamConfig::default());
        assert_eq!(config.logging(), &LoggingConfig::default());
        let l = &config.listeners()[0];
        assert_eq!(l.policy(), Some("p"));
        assert_eq!(l.mode(false), FilterMode::Enforce);
        assert_eq!(l.mode(true), FilterMode::Watch);
    }

    #[test]
    fn builder() {
        let mut b = CtlFilterConfig::builder();
        b.upstream().address("unix:/run/tor/control".parse().unwrap());
        b.listeners().push({
            let mut l = ListenerConfig::builder();
            l.address("127.0.0.1:9052".parse().unwrap()).policy("p");
            l
        });
        b.policies().insert("p".into(), PolicyBuilder::default());
        b.application().watch_configuration(true);
        let config = b.build().unwrap();
        assert!(config.application().watch_configuration);
        assert_eq!(config.listeners()[0].address().to_string(), "tcp:127.0.0.1:9052");
    }

    #[test]
    fn bad_configs() {
        let bad = |s: &str| {
            let e = parse_config(s).unwrap_err();
            format!("{:#}", e)
        };

        // No listeners.
        assert!(bad("").contains("listeners"));
        // Neither or both ways to pick a policy.
        assert!(bad(r#"[[listeners]]
            address = "127.0.0.1:9052"
            "#)
        .contains("by_exec_path"));
        assert!(bad(r#"[[listeners]]
            address = "127.0.0.1:9052"
            policy = "p"
            by_exec_path = true
            "#)
        .contains("mutually exclusive"));
        // The same address twice.
        assert!(bad(r#"[[listeners]]
            address = "127.0.0.1:9052"
            policy = "p"
            [[listeners]]
            address = "tcp:127.0.0.1:9052"
            policy = "p"
            "#)
        .contains("more than once"));
        // Listening on the control port.
        assert!(bad(r#"[[listeners]]
            address = "127.0.0.1:9051"
            policy = "p"
            "#)
        .contains("control port"));
        // A rewrite that would smuggle in a second command.
        assert!(bad(&format!(
            "{}\nrewrite_lines = {{ \"GETINFO a\" = \"GETINFO b\\r\\nSIGNAL HALT\" }}",
            MINIMAL
        ))
        .contains("policies.p"));
        // Unknown keys.
        assert!(bad(&format!("{}\n[nonsense]\n", MINIMAL)).contains("nonsense"));
    }

    #[test]
    fn missing_policy() {
        let config = parse_config(
            r#"
            [[listeners]]
            address = "127.0.0.1:9052"
            policy = "absent"
            "#,
        )
        .unwrap();
        let e = load_policies(&config, &Mistrust::new_dangerously_trust_everyone()).unwrap_err();
        assert!(e.to_string().contains("absent"));
    }

    #[test]
    fn policy_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("torbirdy.toml"),
            r#"allow_commands = ["SIGNAL"]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README"), "not a policy").unwrap();
        std::fs::write(dir.path().join(".hidden.toml"), "garbage =").unwrap();

        let text = format!(
            r#"
            policy_dir = "{}"
            [[listeners]]
            address = "127.0.0.1:9052"
            policy = "torbirdy"
            "#,
            dir.path().display()
        );
        let config = parse_config(&text).unwrap();
        let mistrust = Mistrust::new_dangerously_trust_everyone();
        let policies = load_policies(&config, &mistrust).unwrap();
        assert_eq!(policies.names().collect::<Vec<_>>(), vec!["torbirdy"]);

        // A file-based policy may not replace one from the config file.
        let text = format!("{}\n[policies.torbirdy]\n", text);
        let config = parse_config(&text).unwrap();
        let e = load_policies(&config, &mistrust).unwrap_err();
        assert!(e.to_string().contains("defined twice"));

        // A broken policy file is an error.
        std::fs::write(dir.path().join("broken.toml"), "allow_commands = 7").unwrap();
        let config = parse_config(&format!(
            r#"
            policy_dir = "{}"
            [[listeners]]
            address = "127.0.0.1:9052"
            by_exec_path = true
            "#,
            dir.path().display()
        ))
        .unwrap();
        assert!(load_policies(&config, &mistrust).is_err());
    }
}
