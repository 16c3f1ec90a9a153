//! Process execution and lifecycle management.
//!
//! This module contains the `ProcessManager`, which owns the single command
//! chain in flight. A chain runs its steps one after another with inherited
//! standard streams, and a stop request tears the running step down with an
//! interrupt, a bounded wait and finally a forced kill.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{CommandChain, CommandSpec};
use crate::env::{EnvComposer, Environment};
use crate::process::{ChainOutcome, LifecycleState};

/// Executables that run their command under another user. Signals from an
/// unprivileged parent cannot reach the real child, so the stop request is
/// routed through the wrapper itself.
const PRIVILEGE_WRAPPERS: &[&str] = &["sudo", "doas"];

/// Timing of the graceful stop protocol.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    graceful: bool,
    timeout: Duration,
    poll_interval: Duration,
}

impl ShutdownConfig {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Longest accepted graceful timeout, one day.
    pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

    /// A zero timeout falls back to one second.
    pub fn new(graceful: bool, timeout_secs: u64) -> Self {
        Self::with_timings(
            graceful,
            Duration::from_secs(timeout_secs.clamp(1, Self::MAX_TIMEOUT_SECS)),
            Self::POLL_INTERVAL,
        )
    }

    pub fn with_timings(graceful: bool, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            graceful,
            timeout,
            poll_interval,
        }
    }
}

/// How a running step is asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopStrategy {
    /// Kill right away.
    Kill,
    /// Interrupt the process group, then wait and force-kill.
    Interrupt,
    /// Ask the privilege wrapper to deliver `SIGTERM`, then wait and force-kill.
    Wrapper { program: String },
}

impl StopStrategy {
    /// Picks the strategy from the step's executable and the stop settings.
    pub fn for_command(spec: &CommandSpec, shutdown: &ShutdownConfig) -> Self {
        if !cfg!(unix) {
            return Self::Kill;
        }
        if is_privilege_wrapper(&spec.executable) {
            return Self::Wrapper {
                program: spec.executable.clone(),
            };
        }
        if shutdown.graceful {
            Self::Interrupt
        } else {
            Self::Kill
        }
    }
}

fn is_privilege_wrapper(executable: &str) -> bool {
    Path::new(executable)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| PRIVILEGE_WRAPPERS.contains(&name))
}

/// Bookkeeping for the chain currently holding the run lock.
struct ActiveChain {
    stop: Option<oneshot::Sender<()>>,
    state: LifecycleState,
}

/// Owns the single in-flight command chain.
pub struct ProcessManager {
    shutdown: ShutdownConfig,
    composer: EnvComposer,
    // Held by a chain from registration until its last process is gone.
    run_lock: Arc<Mutex<()>>,
    active: std::sync::Mutex<Option<ActiveChain>>,
}

impl ProcessManager {
    pub fn new(shutdown: ShutdownConfig, composer: EnvComposer) -> Self {
        Self {
            shutdown,
            composer,
            run_lock: Arc::new(Mutex::new(())),
            active: std::sync::Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveChain>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: LifecycleState) {
        if let Some(chain) = self.active().as_mut() {
            if chain.state != LifecycleState::Terminating {
                chain.state = state;
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.active()
            .as_ref()
            .map(|chain| chain.state)
            .unwrap_or(LifecycleState::Idle)
    }

    /// Whether a chain is registered and not yet finished.
    pub fn is_active(&self) -> bool {
        self.active().is_some()
    }

    /// Starts `chain` in a background task.
    ///
    /// Waits until any previous chain has fully stopped, registers the new
    /// chain and returns a handle resolving to its outcome. Once this returns
    /// the chain is visible to [`ProcessManager::terminate`].
    pub async fn start(self: &Arc<Self>, chain: CommandChain) -> JoinHandle<ChainOutcome> {
        let lock = Arc::clone(&self.run_lock).lock_owned().await;
        let (stop_tx, stop_rx) = oneshot::channel();
        *self.active() = Some(ActiveChain {
            stop: Some(stop_tx),
            state: LifecycleState::Starting,
        });
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = manager.run_chain(lock, chain, stop_rx).await;
            debug!("chain {}", outcome);
            outcome
        })
    }

    /// Stops the chain in flight, if any, and waits until it has ended.
    ///
    /// Returns `false` without doing anything when no chain is active.
    pub async fn terminate(&self) -> bool {
        {
            let mut active = self.active();
            let Some(chain) = active.as_mut() else {
                return false;
            };
            chain.state = LifecycleState::Terminating;
            if let Some(stop) = chain.stop.take() {
                let _ = stop.send(());
            }
        }
        drop(self.run_lock.lock().await);
        true
    }

    async fn run_chain(
        &self,
        _lock: OwnedMutexGuard<()>,
        chain: CommandChain,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> ChainOutcome {
        let _clear = ClearOnDrop(self);

        for spec in &chain {
            if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                return ChainOutcome::Terminated;
            }
            self.set_state(LifecycleState::Starting);
            let env = self.composer.compose(spec);
            let mut child = match build_command(spec, &env).spawn() {
                Ok(child) => child,
                Err(err) => {
                    error!("failed to start command: {} - {}", spec, err);
                    ring_bell();
                    return ChainOutcome::SpawnFailed {
                        command: spec.to_string(),
                        error: err.to_string(),
                    };
                }
            };
            info!("running: {}", spec);
            debug!("environment: {:?}", env);
            if let Some(pid) = child.id() {
                self.set_state(LifecycleState::Running { pid });
            }

            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = &mut stop_rx => None,
            };
            match exited {
                Some(Ok(status)) if status.success() => {}
                Some(Ok(status)) => {
                    warn!("failed to execute command: {} - {}", spec, status);
                    ring_bell();
                    return ChainOutcome::Failed {
                        command: spec.to_string(),
                        code: status.code(),
                    };
                }
                Some(Err(err)) => {
                    warn!("failed to execute command: {} - {}", spec, err);
                    ring_bell();
                    return ChainOutcome::Failed {
                        command: spec.to_string(),
                        code: None,
                    };
                }
                None => {
                    self.stop_child(&mut child, spec).await;
                    return ChainOutcome::Terminated;
                }
            }
        }
        ChainOutcome::Completed
    }

    async fn stop_child(&self, child: &mut Child, spec: &CommandSpec) {
        let Some(pid) = child.id() else {
            return;
        };
        match StopStrategy::for_command(spec, &self.shutdown) {
            StopStrategy::Kill => {
                force_kill(child).await;
                return;
            }
            StopStrategy::Interrupt => {
                debug!("interrupting {} (pid {})", spec, pid);
                send_interrupt(pid);
            }
            StopStrategy::Wrapper { program } => {
                debug!("stopping {} (pid {}) through {}", spec, pid, program);
                if let Err(err) = signal_through_wrapper(&program, pid).await {
                    error!("{:#}", err);
                    ring_bell();
                }
            }
        }

        if !self.wait_graceful(child).await {
            info!("failed to stop {} gracefully, killing it", spec);
            force_kill(child).await;
        }
    }

    // Polls for exit until the graceful timeout runs out.
    async fn wait_graceful(&self, child: &mut Child) -> bool {
        // No deadline when the timeout does not fit in an `Instant`.
        let deadline = tokio::time::Instant::now().checked_add(self.shutdown.timeout);
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(err) => {
                    warn!("failed to poll process: {}", err);
                    return false;
                }
            }
            if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                return false;
            }
            tokio::time::sleep(self.shutdown.poll_interval).await;
        }
    }
}

struct ClearOnDrop<'a>(&'a ProcessManager);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        *self.0.active() = None;
    }
}

fn build_command(spec: &CommandSpec, env: &Environment) -> Command {
    let mut command = Command::new(&spec.executable);
    command
        .args(&spec.args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command
}

async fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        send_os_signal(pid, libc::SIGKILL);
    }
    if let Err(err) = child.kill().await {
        warn!("failed to kill process: {}", err);
    }
}

async fn signal_through_wrapper(program: &str, pid: u32) -> Result<()> {
    let target = pid.to_string();
    let status = Command::new(program)
        .args(["kill", "-TERM", target.as_str()])
        .stdin(Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to run {} kill for pid {}", program, pid))?;
    if !status.success() {
        bail!("{} kill for pid {} exited with {}", program, pid, status);
    }
    Ok(())
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    send_os_signal(pid, libc::SIGINT);
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) {}

// Children lead their own process group, so signal the group first.
#[cfg(unix)]
fn send_os_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, signal);
        let _ = libc::kill(pid, signal);
    }
}

/// Emits the terminal bell on standard output.
pub fn ring_bell() {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(b"\x07");
    let _ = stdout.flush();
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::time::Instant;

    use super::*;
    use crate::command::parse;

    fn manager(graceful: bool, timeout: Duration) -> Arc<ProcessManager> {
        Arc::new(ProcessManager::new(
            ShutdownConfig::with_timings(graceful, timeout, ShutdownConfig::POLL_INTERVAL),
            EnvComposer::new(Vec::new(), Vec::new()),
        ))
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            env_assignments: Vec::new(),
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            inherit_env: true,
        }
    }

    fn quoted(path: &std::path::Path) -> String {
        shell_words::quote(&path.to_string_lossy()).into_owned()
    }

    async fn wait_running(manager: &ProcessManager) {
        for _ in 0..200 {
            if matches!(manager.state(), LifecycleState::Running { .. }) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process never reached the running state");
    }

    #[tokio::test]
    async fn terminate_while_idle_is_a_noop() {
        let manager = manager(true, Duration::from_secs(1));
        assert!(!manager.terminate().await);
        assert_eq!(manager.state(), LifecycleState::Idle);
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = quoted(&dir.path().join("out.log"));
        let manager = manager(true, Duration::from_secs(1));
        let chain = vec![
            sh(&format!("echo first >> {}", out)),
            sh(&format!("echo second >> {}", out)),
        ];

        let outcome = manager.start(chain).await.await.unwrap();
        assert_eq!(outcome, ChainOutcome::Completed);
        let log = std::fs::read_to_string(dir.path().join("out.log")).unwrap();
        assert_eq!(log, "first\nsecond\n");
        assert_eq!(manager.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn failing_step_aborts_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("second-ran");
        let manager = manager(true, Duration::from_secs(1));
        let chain = vec![sh("exit 3"), sh(&format!("touch {}", quoted(&marker)))];

        let outcome = manager.start(chain).await.await.unwrap();
        assert!(matches!(outcome, ChainOutcome::Failed { code: Some(3), .. }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn spawn_failure_aborts_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("second-ran");
        let manager = manager(true, Duration::from_secs(1));
        let missing = CommandSpec {
            executable: "/nonexistent/bro-missing-binary".to_string(),
            ..sh("")
        };
        let chain = vec![missing, sh(&format!("touch {}", quoted(&marker)))];

        let outcome = manager.start(chain).await.await.unwrap();
        assert!(matches!(outcome, ChainOutcome::SpawnFailed { .. }));
        assert!(!marker.exists());
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn inline_environment_reaches_the_process() {
        let manager = Arc::new(ProcessManager::new(
            ShutdownConfig::new(true, 1),
            EnvComposer::new(Vec::new(), vec!["X=static".to_string()]),
        ));
        let chain = vec![parse(r#"X=inline sh -c 'test "$X" = inline'"#).unwrap()];
        let outcome = manager.start(chain).await.await.unwrap();
        assert_eq!(outcome, ChainOutcome::Completed);
    }

    #[tokio::test]
    async fn interrupt_stops_a_cooperative_process() {
        let manager = manager(true, Duration::from_secs(5));
        let handle = manager.start(vec![sh("exec sleep 30")]).await;
        wait_running(&manager).await;

        let requested = Instant::now();
        assert!(manager.terminate().await);
        assert!(requested.elapsed() < Duration::from_millis(900));
        assert_eq!(handle.await.unwrap(), ChainOutcome::Terminated);
        assert_eq!(manager.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn ignoring_process_is_killed_after_the_timeout() {
        let manager = manager(true, Duration::from_secs(1));
        let handle = manager.start(vec![sh("trap '' INT; sleep 30")]).await;
        wait_running(&manager).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let requested = Instant::now();
        assert!(manager.terminate().await);
        let elapsed = requested.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1150), "{:?}", elapsed);
        assert_eq!(handle.await.unwrap(), ChainOutcome::Terminated);
    }

    #[tokio::test]
    async fn non_graceful_stop_kills_immediately() {
        let manager = manager(false, Duration::from_secs(5));
        let handle = manager.start(vec![sh("trap '' INT; sleep 30")]).await;
        wait_running(&manager).await;

        let requested = Instant::now();
        assert!(manager.terminate().await);
        assert!(requested.elapsed() < Duration::from_millis(500));
        assert_eq!(handle.await.unwrap(), ChainOutcome::Terminated);
    }

    #[tokio::test]
    async fn terminated_chain_skips_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("second-ran");
        let manager = manager(true, Duration::from_secs(1));
        let chain = vec![
            sh("exec sleep 30"),
            sh(&format!("touch {}", quoted(&marker))),
        ];
        let handle = manager.start(chain).await;
        wait_running(&manager).await;

        assert!(manager.terminate().await);
        assert_eq!(handle.await.unwrap(), ChainOutcome::Terminated);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn chains_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let lock: PathBuf = dir.path().join("lock");
        let lock = quoted(&lock);
        let script = format!(
            "if [ -e {lock} ]; then exit 9; fi; touch {lock}; sleep 0.3; rm {lock}",
            lock = lock
        );
        let manager = manager(true, Duration::from_secs(1));

        let (first, second) = tokio::join!(
            manager.start(vec![sh(&script)]),
            manager.start(vec![sh(&script)])
        );
        assert_eq!(first.await.unwrap(), ChainOutcome::Completed);
        assert_eq!(second.await.unwrap(), ChainOutcome::Completed);
    }

    #[test]
    fn strategy_follows_executable_and_settings() {
        let graceful = ShutdownConfig::new(true, 1);
        let forced = ShutdownConfig::new(false, 1);
        assert_eq!(
            StopStrategy::for_command(&parse("sudo ./server").unwrap(), &forced),
            StopStrategy::Wrapper {
                program: "sudo".to_string()
            }
        );
        assert_eq!(
            StopStrategy::for_command(&parse("/usr/bin/doas ./server").unwrap(), &graceful),
            StopStrategy::Wrapper {
                program: "/usr/bin/doas".to_string()
            }
        );
        assert_eq!(
            StopStrategy::for_command(&parse("./server").unwrap(), &graceful),
            StopStrategy::Interrupt
        );
        assert_eq!(
            StopStrategy::for_command(&parse("./server").unwrap(), &forced),
            StopStrategy::Kill
        );
    }

    #[test]
    fn zero_timeout_falls_back_to_one_second() {
        assert_eq!(ShutdownConfig::new(true, 0).timeout, Duration::from_secs(1));
        assert_eq!(ShutdownConfig::new(true, 3).timeout, Duration::from_secs(3));
    }

    #[test]
    fn huge_timeout_is_clamped() {
        assert_eq!(
            ShutdownConfig::new(true, u64::MAX).timeout,
            Duration::from_secs(ShutdownConfig::MAX_TIMEOUT_SECS)
        );
    }

    #[tokio::test]
    async fn unrepresentable_timeout_still_stops_the_process() {
        let manager = manager(true, Duration::MAX);
        let handle = manager.start(vec![sh("exec sleep 30")]).await;
        wait_running(&manager).await;

        assert!(manager.terminate().await);
        assert_eq!(handle.await.unwrap(), ChainOutcome::Terminated);
        assert_eq!(manager.state(), LifecycleState::Idle);
    }

    // Stand-in for a privilege wrapper: runs its arguments, and for
    // `kill -TERM <pid>` records the call and delivers the signal unless
    // `deny` is set.
    fn wrapper_stub(dir: &std::path::Path, deny: bool) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("sudo");
        let calls = quoted(&dir.join("calls.log"));
        let on_kill = if deny { "exit 1" } else { "kill \"$@\"; exit $?" };
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = kill ]; then\n  shift\n  echo \"kill $*\" >> {}\n  {}\nfi\nexec \"$@\"\n",
            calls, on_kill
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn wrapped(wrapper: &std::path::Path, script: &str) -> CommandSpec {
        CommandSpec {
            env_assignments: Vec::new(),
            executable: wrapper.to_string_lossy().into_owned(),
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            inherit_env: true,
        }
    }

    async fn running_pid(manager: &ProcessManager) -> u32 {
        wait_running(manager).await;
        match manager.state() {
            LifecycleState::Running { pid } => pid,
            state => panic!("unexpected state {:?}", state),
        }
    }

    #[tokio::test]
    async fn wrapper_delivers_the_stop_signal() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper_stub(dir.path(), false);
        // Not graceful: the wrapper is used regardless.
        let manager = manager(false, Duration::from_secs(5));
        let handle = manager
            .start(vec![wrapped(&wrapper, "trap '' INT; exec sleep 30")])
            .await;
        let pid = running_pid(&manager).await;

        let requested = Instant::now();
        assert!(manager.terminate().await);
        assert!(requested.elapsed() < Duration::from_millis(900));
        assert_eq!(handle.await.unwrap(), ChainOutcome::Terminated);

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(calls, format!("kill -TERM {}\n", pid));
    }

    #[tokio::test]
    async fn failed_wrapper_stop_falls_back_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper_stub(dir.path(), true);
        let manager = manager(true, Duration::from_secs(1));
        let handle = manager
            .start(vec![wrapped(&wrapper, "trap '' INT TERM; exec sleep 30")])
            .await;
        let pid = running_pid(&manager).await;

        let requested = Instant::now();
        assert!(manager.terminate().await);
        let elapsed = requested.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
        assert_eq!(handle.await.unwrap(), ChainOutcome::Terminated);

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(calls, format!("kill -TERM {}\n", pid));
        assert_eq!(manager.state(), LifecycleState::Idle);
    }
}
