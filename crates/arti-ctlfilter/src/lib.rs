#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
#![allow(clippy::needless_lifetimes)] // See arti#1765
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->
// Overrides specific to this crate:
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

mod cfg;
mod cli;
mod logging;
mod process;
mod reload;

pub use cfg::CTLFILTER_EXAMPLE_CONFIG;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use fs_mistrust::Mistrust;
use safelog::with_safe_logging_suppressed;
use tor_ctlfilter::{FilterListener, ListenerHandle, PolicySet, PolicyStore};
use tor_error::warn_report;
use tracing::info;

use crate::cfg::CtlFilterConfig;
use crate::cli::Cli;

/// Environment variable that turns off file permission checks, like
/// `--disable-fs-permission-checks`.
const FS_PERMISSIONS_CHECKS_DISABLE_VAR: &str = "ARTI_FS_DISABLE_PERMISSION_CHECKS";

/// Start every configured listener, then run until we're told to stop.
async fn run(
    cli: Cli,
    mistrust: Mistrust,
    config: CtlFilterConfig,
    policies: PolicySet,
) -> Result<()> {
    let store = Arc::new(PolicyStore::new(policies));
    let upstream = Arc::new(config.upstream().clone());

    let mut handles = Vec::new();
    for (idx, listener) in config.listeners().iter().enumerate() {
        // Clients on one listener must not publish another listener as an
        // onion service.
        let others = config
            .listeners()
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != idx)
            .map(|(_, l)| l.address().clone());
        let filter = FilterListener::new(
            listener.address().clone(),
            listener.selector(),
            upstream.clone(),
            store.clone(),
        )
        .mode(listener.mode(cli.watch))
        .with_denied_targets(others);

        match filter.start().await {
            Ok(handle) => {
                info!(
                    "Filtering {} on {} ({:?} mode)",
                    upstream.address(),
                    handle.local_endpoint(),
                    listener.mode(cli.watch),
                );
                handles.push(handle);
            }
            Err(e) => {
                stop_all(handles).await;
                return Err(e)
                    .with_context(|| format!("Unable to listen on {}", listener.address()));
            }
        }
    }

    if let Err(e) = reload::watch_for_config_changes(cli.config, mistrust, config, store) {
        stop_all(handles).await;
        return Err(e);
    }

    let waited = process::wait_for_ctrl_c().await;
    info!("Shutting down.");
    stop_all(handles).await;
    waited.context("Unable to wait for ctrl-c")
}

/// Stop every listener in `handles`, logging any failures.
async fn stop_all(handles: Vec<ListenerHandle>) {
    for handle in handles {
        let endpoint = handle.local_endpoint().clone();
        if let Err(e) = handle.stop().await {
            warn_report!(e, "Problem stopping listener on {}", endpoint);
        }
    }
}

/// Inner function, to handle a set of CLI arguments and return a single
/// `Result<()>` for convenient handling.
///
/// # ⚠️ Warning! ⚠️
///
/// If your program needs to call this function, you are setting yourself up for
/// some serious maintenance headaches.  See discussion on [`main`] and please
/// reach out to help us build you a better API.
fn main_main<I, T>(cli_args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    // We don't know how to log until we've read our configuration, so we
    // log to stderr until then.
    //
    // This closure is called to "make" a "Writer" for each message, so it
    // runs at the right time: before each message.
    let pre_config_logging_writer = || {
        // Weirdly, with .without_time(), tracing produces messages with a leading space.
        eprint!("arti-ctlfilter:");
        std::io::stderr()
    };
    let pre_config_logging = tracing_subscriber::fmt()
        .without_time()
        .with_writer(pre_config_logging_writer)
        .finish();
    let pre_config_logging = tracing::Dispatch::new(pre_config_logging);
    let pre_config_logging_ret = tracing::dispatcher::with_default(&pre_config_logging, || {
        let cli = Cli::try_parse_from(cli_args)?;

        let mistrust = if cli.disable_fs_permission_checks {
            Mistrust::new_dangerously_trust_everyone()
        } else {
            fs_mistrust::MistrustBuilder::default()
                .controlled_by_env_var(FS_PERMISSIONS_CHECKS_DISABLE_VAR)
                .build()
                .context("Could not construct default fs-mistrust")?
        };

        let config = cfg::load_config(&cli.config, &mistrust)?;
        let policies = cfg::load_policies(&config, &mistrust)?;

        Ok::<_, anyhow::Error>((cli, mistrust, config, policies))
    })?;
    let (cli, mistrust, config, policies) = pre_config_logging_ret;

    if cli.check {
        logging::check_filters(config.logging(), cli.log_level.as_deref())?;
        println!(
            "{}: configuration OK ({} listeners, {} policies)",
            cli.config.display(),
            config.listeners().len(),
            policies.len()
        );
        return Ok(());
    }

    let _log_guards =
        logging::setup_logging(config.logging(), &mistrust, cli.log_level.as_deref())?;

    info!(
        "Starting arti-ctlfilter {} with {} policies: {}",
        env!("CARGO_PKG_VERSION"),
        policies.len(),
        policies.names().collect::<Vec<_>>().join(", ")
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Unable to create tokio runtime")?;
    runtime.block_on(run(cli, mistrust, config, policies))
}

/// Main program, callable directly from a binary crate's `main`
///
/// This function behaves the same as `main_main()`, except:
///   * It takes command-line arguments from `std::env::args_os` rather than
///     from an argument.
///   * It exits the process with an appropriate error code on error.
///
/// Calling this from inside another program is probably a bad idea: it takes
/// over signal handling and global logging, and it blocks until ctrl-c.
pub fn main() {
    match main_main(std::env::args_os()) {
        Ok(()) => {}
        Err(e) => match e.downcast_ref::<clap::Error>() {
            Some(clap_err) => clap_err.exit(),
            None => with_safe_logging_suppressed(|| tor_error::report_and_exit(e)),
        },
    }
}
