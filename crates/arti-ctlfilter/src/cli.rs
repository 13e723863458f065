//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// A filtering proxy for the Tor control port.
#[derive(Clone, Debug, Parser)]
#[command(author = "The Tor Project Developers")]
#[command(version)]
pub(crate) struct Cli {
    /// Config file to read.
    #[arg(long, short)]
    #[arg(value_name = "FILE")]
    pub(crate) config: PathBuf,

    /// Override the console log filter from the configuration.
    ///
    /// (Usually one of 'trace', 'debug', 'info', 'warn', 'error'.)
    #[arg(long, short)]
    #[arg(value_name = "LEVEL")]
    pub(crate) log_level: Option<String>,

    /// Log what every listener would refuse, but refuse nothing.
    #[arg(long)]
    pub(crate) watch: bool,

    /// Don't check permissions on the files we use.
    #[arg(long)]
    pub(crate) disable_fs_permission_checks: bool,

    /// Check the configuration and policies, then exit.
    #[arg(long)]
    pub(crate) check: bool,
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
    use clap::CommandFactory as _;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags() {
        let cli = Cli::parse_from(["arti-ctlfilter", "-c", "/etc/ctlfilter.toml"]);
        assert_eq!(cli.config, PathBuf::from("/etc/ctlfilter.toml"));
        assert_eq!(cli.log_level, None);
        assert!(!cli.watch);
        assert!(!cli.check);
        assert!(!cli.disable_fs_permission_checks);

        let cli = Cli::parse_from([
            "arti-ctlfilter",
            "--config",
            "x.toml",
            "-l",
            "debug,tor_ctlfilter=trace",
            "--watch",
            "--check",
            "--disable-fs-permission-checks",
        ]);
        assert_eq!(cli.log_level.as_deref(), Some("debug,tor_ctlfilter=trace"));
        assert!(cli.watch);
        assert!(cli.check);
        assert!(cli.disable_fs_permission_checks);
    }

    #[test]
    fn config_required() {
        let e = Cli::try_parse_from(["arti-ctlfilter", "--watch"]).unwrap_err();
        assert_eq!(
            e.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }
}
