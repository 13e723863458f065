//! Where arti-ctlfilter's log messages go.
//!
//! Messages always go to stderr.  They can also go to any number of files,
//! each with its own filter.  Command lines that clients send are wrapped in
//! `safelog` types, so they are redacted unless
//! `logging.log_sensitive_information` is set.

use anyhow::{Context, Result, anyhow};
use derive_builder::Builder;
use fs_mistrust::Mistrust;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tor_config::ConfigBuildError;
use tor_config::impl_standard_builder;
use tor_config::{define_list_builder_accessors, define_list_builder_helper};
use tor_error::warn_report;
use tracing::{Subscriber, error};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, filter::Targets, fmt, registry};

/// The `[logging]` section of the configuration.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[non_exhaustive]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[builder_struct_attr(serde(deny_unknown_fields))]
pub(crate) struct LoggingConfig {
    /// Which messages to write to stderr, as `tracing` target directives.
    ///
    /// `-l` overrides this.  Use `"info,tor_ctlfilter::filter=debug"` to see
    /// the verdict for every command.
    #[builder(default = "default_console_filter()", setter(into, strip_option))]
    console: Option<String>,

    /// Files to log to, if any.
    #[builder_field_attr(serde(default))]
    #[builder(sub_builder(fn_name = "build"), setter(custom))]
    files: LogfileListConfig,

    /// Log command lines and peer addresses in full.
    ///
    /// Command lines can carry passwords and onion service keys, so this is
    /// only for debugging a policy.
    #[builder_field_attr(serde(default))]
    #[builder(default)]
    log_sensitive_information: bool,
}
impl_standard_builder! { LoggingConfig }

/// Default for `logging.console`.
#[allow(clippy::unnecessary_wraps)]
fn default_console_filter() -> Option<String> {
    Some("info".to_owned())
}

/// The built form of `logging.files`.
type LogfileListConfig = Vec<LogfileConfig>;

define_list_builder_helper! {
    struct LogfileListConfigBuilder {
        files: [LogfileConfigBuilder],
    }
    built: LogfileListConfig = files;
    default = vec![];
}

define_list_builder_accessors! {
    struct LoggingConfigBuilder {
        pub(crate) files: [LogfileConfigBuilder],
    }
}

/// One `[[logging.files]]` entry.
#[derive(Debug, Builder, Clone, Eq, PartialEq)]
#[builder(derive(Debug, Serialize, Deserialize))]
#[builder(build_fn(error = "ConfigBuildError"))]
pub(crate) struct LogfileConfig {
    /// When to start a new file.
    #[builder(default)]
    rotate: LogRotation,
    /// The file to write.  With rotation, a date suffix is appended.
    #[builder(setter(into))]
    path: PathBuf,
    /// Which messages to write, in the same syntax as `logging.console`.
    #[builder(setter(into))]
    filter: String,
}

impl_standard_builder! { LogfileConfig: !Default }

/// When a log file starts afresh.
#[derive(Debug, Default, Clone, Serialize, Deserialize, Copy, Eq, PartialEq)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogRotation {
    /// Once a day.
    Daily,
    /// Once an hour.
    Hourly,
    /// Never: the file grows without bound.
    #[default]
    Never,
}

/// Parse the filter `s`, saying where it came from if it's bad.
fn filt_from_str_verbose(s: &str, source: &str) -> Result<Targets> {
    Targets::from_str(s).with_context(|| format!("in {}", source))
}

/// Parse an optional filter.  An empty string counts as no filter.
fn filt_from_opt_str(s: &Option<String>, source: &str) -> Result<Option<Targets>> {
    Ok(match s {
        Some(s) if !s.is_empty() => Some(filt_from_str_verbose(s, source)?),
        _ => None,
    })
}

/// Check that the filters in `config` (and `cli`, if given) all parse.
///
/// Used by `--check`, which never sets up logging.
pub(crate) fn check_filters(config: &LoggingConfig, cli: Option<&str>) -> Result<()> {
    if let Some(cli) = cli {
        filt_from_str_verbose(cli, "--log-level command line parameter")?;
    }
    filt_from_opt_str(&config.console, "logging.console")?;
    for file in &config.files {
        filt_from_str_verbose(&file.filter, "logging.files.filter")?;
    }
    Ok(())
}

/// Build the stderr layer.
///
/// The `-l` filter wins over `logging.console`; with neither, we log at
/// `info`.
fn console_layer<S>(config: &LoggingConfig, cli: Option<&str>) -> Result<impl Layer<S> + use<S>>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let filter = cli
        .map(|s| filt_from_str_verbose(s, "--log-level command line parameter"))
        .or_else(|| filt_from_opt_str(&config.console, "logging.console").transpose())
        .unwrap_or_else(|| filt_from_str_verbose("info", "default console filter"))?;
    let use_color = std::io::stderr().is_terminal();
    Ok(fmt::Layer::default()
        .with_ansi(use_color)
        .with_writer(std::io::stderr) // we make this explicit, to match with use_color.
        .with_filter(filter))
}

/// Split a log file path into the directory to create and the file name
/// to write there.
fn split_log_path(path: &Path) -> Result<(&Path, &Path)> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("Log file path \"{}\" names no file", path.display()))?;
    let dir = match path.parent() {
        Some(d) if d != Path::new("") => d,
        _ => Path::new("."),
    };
    Ok((dir, Path::new(name)))
}

/// Build the layer for one log file, creating its directory if needed.
///
/// Writes happen on a background thread.  The returned [`WorkerGuard`]
/// flushes that thread's queue when dropped.
fn logfile_layer<S>(
    config: &LogfileConfig,
    mistrust: &Mistrust,
) -> Result<(Box<dyn Layer<S> + Send + Sync + 'static>, WorkerGuard)>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span> + Send + Sync,
{
    use tracing_appender::{
        non_blocking,
        rolling::{RollingFileAppender, Rotation},
    };

    let filter = filt_from_str_verbose(&config.filter, "logging.files.filter")?;
    let rotation = match config.rotate {
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Never => Rotation::NEVER,
    };
    let (directory, fname) = split_log_path(&config.path)?;
    mistrust
        .make_directory(directory)
        .with_context(|| format!("Unable to create log directory {}", directory.display()))?;

    let appender = RollingFileAppender::new(rotation, directory, fname);
    let (nonblocking, guard) = non_blocking(appender);
    let layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nonblocking)
        .with_filter(filter);
    Ok((Box::new(layer), guard))
}

/// Build one layer per configured log file.
///
/// A `Vec` of layers is itself a layer, so this works for no files too.
fn logfile_layers<S>(
    config: &LoggingConfig,
    mistrust: &Mistrust,
) -> Result<(Vec<Box<dyn Layer<S> + Send + Sync + 'static>>, Vec<WorkerGuard>)>
where
    S: Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span> + Send + Sync,
{
    let mut layers = Vec::with_capacity(config.files.len());
    let mut guards = Vec::with_capacity(config.files.len());
    for file in &config.files {
        let (layer, guard) = logfile_layer(file, mistrust)?;
        layers.push(layer);
        guards.push(guard);
    }
    Ok((layers, guards))
}

/// Return the message a panic was raised with.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "(no message)"
    }
}

/// Log panics through `tracing` as well as stderr, so that they reach the
/// log files.
fn install_panic_handler() {
    let default_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_handler(panic_info);

        let msg = panic_message(panic_info.payload());
        let backtrace = std::backtrace::Backtrace::force_capture();
        match panic_info.location() {
            Some(location) => error!("Panic at {}: {}\n{}", location, msg, backtrace),
            None => error!("Panic at ???: {}\n{}", msg, backtrace),
        };
    }));
}

/// Keeps logging working until dropped.
///
/// Hold this until the program exits: dropping it flushes the log files and
/// turns safe logging back on.
pub(crate) struct LogGuards {
    /// One guard per log file.
    #[allow(unused)]
    guards: Vec<WorkerGuard>,

    /// Present if `log_sensitive_information` turned safe logging off.
    #[allow(unused)]
    safelog_guard: Option<safelog::Guard>,
}

/// Install our global subscriber, as `config` and the `-l` filter `cli` say.
///
/// Fails if a filter doesn't parse or a log directory can't be created.
pub(crate) fn setup_logging(
    config: &LoggingConfig,
    mistrust: &Mistrust,
    cli: Option<&str>,
) -> Result<LogGuards> {
    // Every layer carries its own filter; a global filter here would apply
    // to all of them at once.
    let registry = registry().with(console_layer(config, cli)?);

    let (layer, guards) = logfile_layers(config, mistrust)?;
    let registry = registry.with(layer);

    registry.init();

    let safelog_guard = if config.log_sensitive_information {
        match safelog::disable_safe_logging() {
            Ok(guard) => Some(guard),
            Err(e) => {
                // Not fatal: we just keep logging safely.
                warn_report!(e, "Unable to disable safe logging");
                None
            }
        }
    } else {
        None
    };

    install_panic_handler();

    Ok(LogGuards {
        guards,
        safelog_guard,
    })
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

    #[test]
    fn parse_logging() {
        let b: LoggingConfigBuilder = toml::from_str(
            r#"
            console = "warn"
            log_sensitive_information = true

            [[files]]
            path = "/var/log/ctlfilter/debug.log"
            filter = "debug"
            rotate = "daily"

            [[files]]
            path = "/var/log/ctlfilter/info.log"
            filter = "info"
            "#,
        )
        .unwrap();
        let c = b.build().unwrap();
        assert_eq!(c.console.as_deref(), Some("warn"));
        assert!(c.log_sensitive_information);
        assert_eq!(c.files.len(), 2);
        assert_eq!(c.files[0].rotate, LogRotation::Daily);
        assert_eq!(c.files[1].rotate, LogRotation::Never);
        assert_eq!(c.files[1].path, PathBuf::from("/var/log/ctlfilter/info.log"));

        check_filters(&c, Some("info,tor_ctlfilter=trace")).unwrap();
        assert!(check_filters(&c, Some("info,tor_ctlfilter=loud")).is_err());
    }

    #[test]
    fn default_logging() {
        let c = LoggingConfig::default();
        assert_eq!(c.console.as_deref(), Some("info"));
        assert!(c.files.is_empty());
        assert!(!c.log_sensitive_information);
    }

    #[test]
    fn bad_filter() {
        let mut b = LoggingConfig::builder();
        b.console("info,tor_ctlfilter=loud");
        let c = b.build().unwrap();
        assert!(check_filters(&c, None).is_err());
    }

    #[test]
    fn logfile_needs_path() {
        let b: LoggingConfigBuilder = toml::from_str(
            r#"
            [[files]]
            filter = "debug"
            "#,
        )
        .unwrap();
        assert!(b.build().is_err());
    }

    #[test]
    fn log_paths() {
        let (dir, name) = split_log_path(Path::new("/var/log/ctlfilter/x.log")).unwrap();
        assert_eq!(dir, Path::new("/var/log/ctlfilter"));
        assert_eq!(name, Path::new("x.log"));

        let (dir, name) = split_log_path(Path::new("x.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, Path::new("x.log"));

        assert!(split_log_path(Path::new("/")).is_err());
        assert!(split_log_path(Path::new("/var/log/..")).is_err());
    }

    #[test]
    fn logfiles_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = LoggingConfig::builder();
        b.files().push({
            let mut f = LogfileConfig::builder();
            f.path(dir.path().join("sub/ctlfilter.log")).filter("debug");
            f
        });
        let c = b.build().unwrap();
        let mistrust = Mistrust::new_dangerously_trust_everyone();
        let (layers, guards) =
            logfile_layers::<tracing_subscriber::Registry>(&c, &mistrust).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(guards.len(), 1);
        assert!(dir.path().join("sub").is_dir());
    }

    #[test]
    fn panic_messages() {
        let s: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn std::any::Any + Send> = Box::new(format!("formatted {}", 7));
        assert_eq!(panic_message(s.as_ref()), "formatted 7");
        let s: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(s.as_ref()), "(no message)");
    }
}
