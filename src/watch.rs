//! File watching and the restart loop.
//!
//! This module subscribes to the watch set, turns raw notifications into
//! `FsEvent`s and drives the `Orchestrator`, which filters and debounces
//! them and restarts the command chain through the `ProcessManager`.
//! Operator signals cancel the loop, which stops the running chain on its
//! way out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandChain;
use crate::config::Settings;
use crate::debounce::DebounceGate;
use crate::env::EnvComposer;
use crate::filter::{EventFilter, FsEvent};
use crate::paths;
use crate::process::{ChainOutcome, LifecycleState};
use crate::runner::ProcessManager;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Watches the configured directories and restarts commands until an
/// operator signal arrives.
pub async fn run(settings: Settings) -> Result<()> {
    let dirs = paths::resolve_watch_set(&settings)?;
    let (_watcher, events) = subscribe(&dirs)?;
    info!(
        "watching {} directories in {}",
        dirs.len(),
        settings.workdir.display()
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let composer = EnvComposer::new(settings.env_files.clone(), settings.env_variables.clone());
    let manager = Arc::new(ProcessManager::new(settings.shutdown, composer));
    Orchestrator::new(&settings, manager)
        .run(events, cancel)
        .await?;
    Ok(())
}

/// Subscribes to every directory, failing if any of them cannot be watched.
///
/// The returned watcher must be kept alive for events to keep flowing.
pub fn subscribe(dirs: &[PathBuf]) -> Result<(RecommendedWatcher, mpsc::Receiver<FsEvent>)> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for event in FsEvent::from_notify(event) {
                    let _ = tx.blocking_send(event);
                }
            }
            Err(err) => warn!("watch error: {}", err),
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;

    for dir in dirs {
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch directory {}", dir.display()))?;
    }
    Ok((watcher, rx))
}

/// Cancels `cancel` on the first SIGINT or SIGTERM.
pub fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!("failed to listen for SIGTERM: {}", err);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = cancel.cancelled() => return,
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
                _ = cancel.cancelled() => return,
            }
        }
        cancel.cancel();
    });
}

/// Turns filesystem events into command chain restarts.
pub struct Orchestrator {
    filter: EventFilter,
    debounce: DebounceGate,
    manager: Arc<ProcessManager>,
    startup: CommandChain,
    commands: CommandChain,
    workdir: PathBuf,
    current: Option<JoinHandle<ChainOutcome>>,
}

impl Orchestrator {
    pub fn new(settings: &Settings, manager: Arc<ProcessManager>) -> Self {
        Self {
            filter: EventFilter::new(settings.filter.clone()),
            debounce: DebounceGate::new(settings.delay),
            manager,
            startup: settings.startup_chain(),
            commands: settings.commands.clone(),
            workdir: settings.workdir.clone(),
            current: None,
        }
    }

    /// Runs the init and run chains once, then restarts the run chain on
    /// every accepted event until `cancel` fires or the event source closes.
    ///
    /// Returns the outcome of the last chain started.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<FsEvent>,
        cancel: CancellationToken,
    ) -> Result<Option<ChainOutcome>> {
        let startup = std::mem::take(&mut self.startup);
        self.current = Some(self.manager.start(startup).await);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        if self.manager.terminate().await {
            info!("stopped running command");
        }
        match self.current.take() {
            Some(chain) => Ok(Some(chain.await.context("command chain task failed")?)),
            None => Ok(None),
        }
    }

    async fn handle_event(&mut self, event: FsEvent) {
        if !self.filter.accept(&event) {
            return;
        }
        if !self.debounce.try_accept(Instant::now()) {
            return;
        }
        info!("{:?} {}", event.kind, display_path(&self.workdir, &event.path));

        if let LifecycleState::Running { pid } = self.manager.state() {
            debug!("stopping pid {} before restart", pid);
        }
        if self.manager.is_active() {
            self.manager.terminate().await;
        }
        self.current = Some(self.manager.start(self.commands.clone()).await);
    }
}

fn display_path(workdir: &Path, path: &Path) -> String {
    match path.strip_prefix(workdir) {
        Ok(relative) => format!("$WORKDIR/{}", relative.display()),
        Err(_) => path.display().to_string(),
    }
}
