//! Code to reload our policies when the configuration changes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel as std_channel};
use std::time::Duration;

use anyhow::Context as _;
use fs_mistrust::Mistrust;
use notify::Watcher as _;
use tor_config::Reconfigure;
use tor_ctlfilter::PolicyStore;
use tracing::{debug, error, info, warn};

use crate::cfg::{CtlFilterConfig, load_config, load_policies};

/// How long to wait after an event got received, before we try to process it.
const DEBOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Event possibly triggering a configuration reload
#[derive(Debug)]
enum Event {
    /// SIGHUP has been received.
    #[cfg(unix)]
    SigHup,
    /// Some files may have been modified.
    FileChanged,
    /// Some filesystem events may have been missed.
    Rescan,
}

/// Everything we need in order to reload.
struct Reloader {
    /// The configuration file.
    config_path: PathBuf,
    /// Used to check the configuration and policy files.
    mistrust: Mistrust,
    /// The configuration we started with.
    ///
    /// Only policies can change while we run; we compare everything else
    /// against this, and warn if it differs.
    original: CtlFilterConfig,
    /// Where we publish new policies.
    store: Arc<PolicyStore>,
}

/// Launch a thread to reload our policies.
///
/// If the configuration asks for it, watch the configuration file and the
/// policy directory, and reload whenever they change.  On unix, also reload
/// on SIGHUP.
///
/// Must be called from within a tokio runtime.
pub(crate) fn watch_for_config_changes(
    config_path: PathBuf,
    mistrust: Mistrust,
    original: CtlFilterConfig,
    store: Arc<PolicyStore>,
) -> anyhow::Result<()> {
    let (tx, rx) = std_channel();
    let mut watcher = if original.application().watch_configuration {
        Some(FileWatcher::for_config(&config_path, &original, tx.clone())?)
    } else {
        None
    };

    #[cfg(unix)]
    {
        use futures::StreamExt as _;

        let mut sighup_stream = crate::process::sighup_stream()?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(()) = sighup_stream.next().await {
                info!("Received SIGHUP");
                if tx.send(Event::SigHup).is_err() {
                    warn!("Failed to reload configuration");
                    break;
                }
            }
        });
    }

    let reloader = Reloader {
        config_path,
        mistrust,
        original,
        store,
    };

    std::thread::spawn(move || {
        debug!("Entering config reload loop");
        while let Ok(event) = rx.recv() {
            // This is a dedicated thread; sleeping here is fine.
            std::thread::sleep(DEBOUNCE_INTERVAL);
            while let Ok(_ignore) = rx.try_recv() {
                // Coalesce everything that arrived meanwhile into one reload.
            }
            debug!("Config reload event {:?}: reloading policies.", event);

            match reloader.reload() {
                Ok(new_config) => {
                    let watch = new_config.application().watch_configuration;
                    if watch && watcher.is_none() {
                        info!("Starting watching over configuration.");
                        match FileWatcher::for_config(&reloader.config_path, &new_config, tx.clone())
                        {
                            Ok(w) => watcher = Some(w),
                            Err(e) => warn!(
                                "Unable to watch configuration: {}",
                                tor_error::Report(e)
                            ),
                        }
                    } else if !watch && watcher.is_some() {
                        info!("Stopped watching over configuration.");
                        watcher = None;
                    }
                }
                // warn_report! doesn't take an anyhow::Error.
                Err(e) => warn!(
                    "Couldn't reload configuration; keeping the old policies: {}",
                    tor_error::Report(e)
                ),
            }
        }
        error!("Config reload thread exiting");
    });

    Ok(())
}

impl Reloader {
    /// Re-read the configuration and policies, and publish the new policies.
    ///
    /// On success, return the new configuration.  On failure, the old
    /// policies stay in place.
    fn reload(&self) -> anyhow::Result<CtlFilterConfig> {
        let config = load_config(&self.config_path, &self.mistrust)?;
        let policies = load_policies(&config, &self.mistrust)?;
        self.warn_about_unchangeable(&config)?;

        let n = policies.len();
        self.store.replace(policies);
        info!("Successfully reloaded configuration: {} policies.", n);
        Ok(config)
    }

    /// Warn about any changes in `new` that we can't apply while running.
    fn warn_about_unchangeable(&self, new: &CtlFilterConfig) -> anyhow::Result<()> {
        let how = Reconfigure::WarnOnFailures;
        let original = &self.original;
        if new.upstream() != original.upstream() {
            how.cannot_change("upstream")?;
        }
        if new.listeners() != original.listeners() {
            how.cannot_change("listeners")?;
        }
        if new.logging() != original.logging() {
            how.cannot_change("logging")?;
        }
        Ok(())
    }
}

/// A wrapper around `notify::RecommendedWatcher` that watches parent
/// directories in order to learn about changes in some specific files.
///
/// `notify` gives sensible results for directories, but if you watch a
/// plain file it won't notice when that file is replaced, which is how
/// editors and configuration tools usually change files.
struct FileWatcher {
    /// An underlying `notify` watcher that tells us about directory changes.
    // this field is kept only so the watcher is not dropped
    _watcher: notify::RecommendedWatcher,
}

impl FileWatcher {
    /// Start watching the configuration file at `config_path` and the policy
    /// directory named in `config`, sending events to `tx`.
    fn for_config(
        config_path: &Path,
        config: &CtlFilterConfig,
        tx: Sender<Event>,
    ) -> anyhow::Result<Self> {
        let mut builder = FileWatcherBuilder::new();
        builder.watch_file(config_path)?;
        if let Some(dir) = config.policy_dir() {
            builder.watch_dir(dir)?;
        }
        builder
            .start_watching(tx)
            .context("Unable to watch configuration files")
    }
}

/// Builder used to configure a [`FileWatcher`] before it starts watching for changes.
struct FileWatcherBuilder {
    /// The list of directories that we're currently watching.
    watching_dirs: HashSet<PathBuf>,
    /// The list of files we actually care about.
    watching_files: HashSet<PathBuf>,
    /// Directories all of whose files we care about.
    watching_contents: HashSet<PathBuf>,
}

impl FileWatcherBuilder {
    /// Create a `FileWatcherBuilder`
    fn new() -> Self {
        FileWatcherBuilder {
            watching_dirs: HashSet::new(),
            watching_files: HashSet::new(),
            watching_contents: HashSet::new(),
        }
    }

    /// Add a single file (not a directory) to the list of things to watch.
    ///
    /// Idempotent.
    fn watch_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let path = absolute(path)?;
        let parent = path.parent().unwrap_or(&path).to_owned();
        self.watching_dirs.insert(parent);
        self.watching_files.insert(path);
        Ok(())
    }

    /// Add a directory, and every file directly inside it, to the list of
    /// things to watch.
    ///
    /// Idempotent.
    fn watch_dir(&mut self, path: &Path) -> anyhow::Result<()> {
        let path = absolute(path)?;
        // Watch the parent too, so we notice if the directory is replaced.
        self.watch_file(&path)?;
        self.watching_dirs.insert(path.clone());
        self.watching_contents.insert(path);
        Ok(())
    }

    /// Return true if a change to `path` is one we care about.
    fn matches(&self, path: &Path) -> bool {
        self.watching_files.contains(path)
            || path
                .parent()
                .is_some_and(|dir| self.watching_contents.contains(dir))
    }

    /// Build a `FileWatcher` and start sending events to `tx`.
    fn start_watching(self, tx: Sender<Event>) -> anyhow::Result<FileWatcher> {
        let dirs = self.watching_dirs.clone();
        let event_sender = move |event: notify::Result<notify::Event>| {
            let watching = |f: &PathBuf| self.matches(f);
            let event = match event {
                Ok(event) => {
                    if event.need_rescan() {
                        Some(Event::Rescan)
                    } else if event.paths.iter().any(watching) {
                        Some(Event::FileChanged)
                    } else {
                        None
                    }
                }
                Err(error) => {
                    if error.paths.iter().any(watching) {
                        Some(Event::FileChanged)
                    } else {
                        None
                    }
                }
            };
            if let Some(event) = event {
                let _ = tx.send(event);
            };
        };

        let mut watcher = notify::RecommendedWatcher::new(event_sender, notify::Config::default())?;

        for dir in dirs {
            watcher.watch(&dir, notify::RecursiveMode::NonRecursive)?;
        }

        Ok(FileWatcher { _watcher: watcher })
    }
}

/// Make `path` absolute, without necessarily making it canonical.
///
/// `notify` reports events with absolute paths, so we must compare against
/// absolute paths too.
fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    Ok(std::env::current_dir()?.join(path))
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
    use tor_ctlfilter::PolicySet;

    /// Write a configuration file into `dir` with one policy allowing
    /// `allowed`, and return its path.
    fn write_config(dir: &Path, allowed: &str, extra: &str) -> PathBuf {
        let path = dir.join("ctlfilter.toml");
        std::fs::write(
            &path,
            format!(
                r#"
                [[listeners]]
                address = "127.0.0.1:9052"
                policy = "p"
                [policies.p]
                allow_commands = ["{}"]
                {}
                "#,
                allowed, extra
            ),
        )
        .unwrap();
        path
    }

    fn reloader(dir: &Path) -> Reloader {
        let config_path = write_config(dir, "GETINFO", "");
        let mistrust = Mistrust::new_dangerously_trust_everyone();
        let original = load_config(&config_path, &mistrust).unwrap();
        let store = Arc::new(PolicyStore::new(
            load_policies(&original, &mistrust).unwrap(),
        ));
        Reloader {
            config_path,
            mistrust,
            original,
            store,
        }
    }

    fn allowed(set: &PolicySet) -> String {
        format!("{:?}", set.get("p").unwrap())
    }

    #[test]
    fn reload_policies() {
        let dir = tempfile::tempdir().unwrap();
        let r = reloader(dir.path());
        let before = r.store.snapshot();
        assert!(allowed(&before).contains("GETINFO"));

        write_config(dir.path(), "SIGNAL", "");
        r.reload().unwrap();
        let after = r.store.snapshot();
        assert!(allowed(&after).contains("SIGNAL"));
        // Old snapshots are untouched.
        assert!(allowed(&before).contains("GETINFO"));
    }

    #[test]
    fn failed_reload_keeps_policies() {
        let dir = tempfile::tempdir().unwrap();
        let r = reloader(dir.path());

        std::fs::write(&r.config_path, "this is not toml").unwrap();
        assert!(r.reload().is_err());
        assert!(allowed(&r.store.snapshot()).contains("GETINFO"));

        // A policy that doesn't validate is no better.
        write_config(dir.path(), "not a keyword", "");
        assert!(r.reload().is_err());
        assert!(allowed(&r.store.snapshot()).contains("GETINFO"));
    }

    #[test]
    fn unchangeable_settings() {
        let dir = tempfile::tempdir().unwrap();
        let r = reloader(dir.path());

        // Listener changes only get a warning; the policies still change.
        std::fs::write(
            &r.config_path,
            r#"
            [upstream]
            address = "unix:/elsewhere"
            [[listeners]]
            address = "127.0.0.1:9053"
            policy = "p"
            [policies.p]
            allow_commands = ["SIGNAL"]
            "#,
        )
        .unwrap();
        let new = r.reload().unwrap();
        assert_ne!(new.listeners(), r.original.listeners());
        assert!(allowed(&r.store.snapshot()).contains("SIGNAL"));
    }

    #[test]
    fn matching() {
        let mut b = FileWatcherBuilder::new();
        b.watch_file(Path::new("/etc/ctlfilter/ctlfilter.toml")).unwrap();
        b.watch_dir(Path::new("/etc/ctlfilter/policies")).unwrap();

        assert!(b.matches(Path::new("/etc/ctlfilter/ctlfilter.toml")));
        assert!(b.matches(Path::new("/etc/ctlfilter/policies")));
        assert!(b.matches(Path::new("/etc/ctlfilter/policies/onionshare.toml")));
        assert!(!b.matches(Path::new("/etc/ctlfilter/other.toml")));
        assert!(!b.matches(Path::new("/etc/ctlfilter/policies/sub/x.toml")));
        assert_eq!(
            b.watching_dirs,
            [
                PathBuf::from("/etc/ctlfilter"),
                PathBuf::from("/etc/ctlfilter/policies")
            ]
            .into_iter()
            .collect()
        );
    }
}
