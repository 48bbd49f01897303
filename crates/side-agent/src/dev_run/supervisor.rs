//! Dev-run process supervision.
//!
//! Children run as session leaders (`setsid`) so they survive a worker
//! restart and can be signalled as a whole session via `kill(-sid, …)`.
//! The monitor tails the run's output file and polls session liveness; the
//! ended event is emitted exactly once no matter which of the natural-exit
//! or explicit-stop paths gets there first. Holding the output file open
//! for the monitor's lifetime keeps the session id from being reassigned
//! before the exit handshake completes.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::dev_run::{DevRunCommandConfig, DevRunEnv, DevRunError, DevRunInstance};
use crate::event_bus::EventBus;
use crate::events::{FlowEventKind, OutputStream};
use crate::flow::GlobalState;

/// Grace period before a fresh child is checked for an immediate exit.
const DEFAULT_WARMUP: Duration = Duration::from_secs(3);
/// Session liveness poll interval.
const LIVENESS_POLL: Duration = Duration::from_millis(500);
/// Escalation poll interval while stopping.
const STOP_POLL: Duration = Duration::from_millis(100);
/// Settle time after SIGKILL.
const KILL_SETTLE: Duration = Duration::from_millis(500);
/// Output is tailed in chunks of this size.
const TAIL_CHUNK: usize = 4096;
/// Liveness heartbeat interval for the monitor.
const HEARTBEAT: Duration = Duration::from_secs(30);
/// Upper bound on one monitored run.
const MONITOR_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// Makes ended-event emission exactly-once across the natural-exit and
/// explicit-stop paths.
#[derive(Default)]
struct EndedTracker {
    ended: AtomicBool,
}

impl EndedTracker {
    /// True exactly once.
    fn claim(&self) -> bool {
        !self.ended.swap(true, Ordering::SeqCst)
    }
}

/// Options for starting one configured command.
pub struct StartOptions {
    pub command_id: String,
    pub config: DevRunCommandConfig,
    pub env: DevRunEnv,
    /// Instance recorded before a worker restart; reattached when its
    /// session is still alive.
    pub existing: Option<DevRunInstance>,
    /// Directory for output files; the system temp dir by default.
    pub output_dir: Option<PathBuf>,
    /// Immediate-exit grace period override.
    pub warmup: Option<Duration>,
}

impl StartOptions {
    pub fn new(command_id: impl Into<String>, config: DevRunCommandConfig) -> Self {
        Self {
            command_id: command_id.into(),
            config,
            env: DevRunEnv::default(),
            existing: None,
            output_dir: None,
            warmup: None,
        }
    }
}

/// Handle on a started run; the monitor task is detached but joinable.
#[derive(Debug)]
pub struct DevRunHandle {
    pub instance: DevRunInstance,
    pub monitor: tokio::task::JoinHandle<()>,
}

pub struct DevRunSupervisor {
    flow_id: String,
    bus: Arc<EventBus>,
    state: Arc<GlobalState>,
    trackers: parking_lot::Mutex<std::collections::HashMap<String, Arc<EndedTracker>>>,
    monitor_cancel: CancellationToken,
}

impl DevRunSupervisor {
    pub fn new(flow_id: impl Into<String>, bus: Arc<EventBus>, state: Arc<GlobalState>) -> Self {
        Self {
            flow_id: flow_id.into(),
            bus,
            state,
            trackers: parking_lot::Mutex::new(std::collections::HashMap::new()),
            monitor_cancel: CancellationToken::new(),
        }
    }

    /// Cancellation root for every monitor this supervisor spawns.
    pub fn shutdown_monitors(&self) {
        self.monitor_cancel.cancel();
    }

    fn tracker(&self, dev_run_id: &str) -> Arc<EndedTracker> {
        self.trackers
            .lock()
            .entry(dev_run_id.to_string())
            .or_default()
            .clone()
    }

    fn emit_ended(
        &self,
        tracker: &EndedTracker,
        dev_run_id: &str,
        exit_status: Option<i32>,
        signal: Option<i32>,
        error: Option<String>,
    ) {
        if !tracker.claim() {
            return;
        }
        self.bus.publish(
            &self.flow_id,
            FlowEventKind::DevRunEnded {
                dev_run_id: dev_run_id.to_string(),
                exit_status,
                signal,
                error,
            },
        );
        self.bus.publish(
            &self.flow_id,
            FlowEventKind::EndStream {
                dev_run_id: dev_run_id.to_string(),
            },
        );
    }

    /// Start (or reattach) the configured command.
    ///
    /// With a recorded instance whose session is still alive no process is
    /// created; the monitor reattaches to the session and output file. A
    /// dead recorded session falls through to a fresh spawn with a fresh
    /// dev-run id.
    pub async fn start(&self, options: StartOptions) -> Result<DevRunHandle, DevRunError> {
        let existing = options
            .existing
            .clone()
            .or_else(|| self.state.dev_run(&options.command_id));
        if let Some(instance) = existing
            && session_alive(instance.session_id)
        {
            log::info!(
                "dev run {} ({}): reattaching to live session {}",
                instance.dev_run_id,
                options.command_id,
                instance.session_id
            );
            self.state.insert_dev_run(instance.clone());
            let monitor = self.spawn_monitor(None, instance.clone());
            return Ok(DevRunHandle { instance, monitor });
        }

        let dev_run_id = uuid::Uuid::now_v7().to_string();
        let output_dir = options
            .output_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let output_file_path = output_dir.join(format!("dev-run-{dev_run_id}.out"));

        let working_dir = options
            .config
            .working_dir
            .clone()
            .unwrap_or_else(|| ".".to_string());

        let mut child = spawn_session_leader(
            &options.config.start,
            &working_dir,
            &output_file_path,
            &options.env.vars(&dev_run_id),
        )?;
        let pid = child
            .id()
            .ok_or_else(|| DevRunError::Spawn("child has no pid".into()))? as i32;
        // The child is its session's leader, so pid and session id agree.
        let session_id = pid;

        let instance = DevRunInstance {
            dev_run_id: dev_run_id.clone(),
            command_id: options.command_id.clone(),
            session_id,
            output_file_path: output_file_path.display().to_string(),
        };

        let mut summary = options.config.start.clone();
        if summary.chars().count() > 100 {
            summary = summary.chars().take(100).collect();
        }
        self.bus.publish(
            &self.flow_id,
            FlowEventKind::DevRunStarted {
                instance: instance.clone(),
                pid: pid as u32,
                command_summary: summary,
                working_dir,
            },
        );

        // Warm-up: a command that dies right away is a configuration
        // problem, not a run.
        let warmup = options.warmup.unwrap_or(DEFAULT_WARMUP);
        match tokio::time::timeout(warmup, child.wait()).await {
            Ok(Ok(status)) => {
                let tracker = self.tracker(&dev_run_id);
                self.drain_output(&instance, &AtomicU64::new(0)).await;
                self.emit_ended(
                    &tracker,
                    &dev_run_id,
                    status.code(),
                    status_signal(&status),
                    Some("exited immediately".to_string()),
                );
                return Err(DevRunError::ExitedImmediately {
                    status: status.code(),
                });
            }
            Ok(Err(e)) => {
                return Err(DevRunError::Spawn(format!("wait failed: {e}")));
            }
            Err(_) => {} // still running after warm-up
        }

        self.state.insert_dev_run(instance.clone());
        let monitor = self.spawn_monitor(Some(child), instance.clone());
        log::info!(
            "dev run {} ({}): started session {} -> {}",
            dev_run_id,
            options.command_id,
            session_id,
            instance.output_file_path
        );
        Ok(DevRunHandle { instance, monitor })
    }

    /// Stop the run for `command_id`. A missing entry is a successful
    /// no-op. Escalates SIGINT → SIGKILL against the whole session.
    pub async fn stop(&self, command_id: &str, timeout_override: Option<Duration>) -> Result<(), DevRunError> {
        let Some(instance) = self.state.remove_dev_run(command_id) else {
            return Ok(());
        };
        let timeout = timeout_override.unwrap_or(Duration::from_secs(10));

        signal_session(instance.session_id, libc_signal::SIGINT);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut alive = session_alive(instance.session_id);
        while alive && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL).await;
            alive = session_alive(instance.session_id);
        }

        let mut signal = libc_signal::SIGINT;
        if alive {
            signal_session(instance.session_id, libc_signal::SIGKILL);
            signal = libc_signal::SIGKILL;
            tokio::time::sleep(KILL_SETTLE).await;
        }

        let tracker = self.tracker(&instance.dev_run_id);
        self.drain_output(&instance, &AtomicU64::new(u64::MAX)).await;
        self.emit_ended(&tracker, &instance.dev_run_id, None, Some(signal), None);
        log::info!(
            "dev run {} ({}): stopped session {} with signal {}",
            instance.dev_run_id,
            command_id,
            instance.session_id,
            signal
        );
        Ok(())
    }

    fn spawn_monitor(
        &self,
        child: Option<tokio::process::Child>,
        instance: DevRunInstance,
    ) -> tokio::task::JoinHandle<()> {
        let bus = self.bus.clone();
        let flow_id = self.flow_id.clone();
        let tracker = self.tracker(&instance.dev_run_id);
        let cancel = self.monitor_cancel.clone();
        tokio::spawn(async move {
            monitor_run(child, instance, bus, flow_id, tracker, cancel).await;
        })
    }

    /// Emit any unseen output as chunk events. `offset == u64::MAX` means
    /// "from wherever the monitor left off is unknown, emit nothing" — the
    /// stop path only flushes when no monitor ever ran.
    async fn drain_output(&self, instance: &DevRunInstance, offset: &AtomicU64) {
        let start = offset.load(Ordering::SeqCst);
        if start == u64::MAX {
            return;
        }
        let sequence = AtomicU64::new(0);
        tail_chunks(
            &instance.output_file_path,
            offset,
            &sequence,
            &self.bus,
            &self.flow_id,
            &instance.dev_run_id,
        )
        .await;
    }
}

/// One monitor: tail output, poll liveness, emit the ended event on
/// natural exit. Cancellation stops monitoring without ending the run.
async fn monitor_run(
    mut child: Option<tokio::process::Child>,
    instance: DevRunInstance,
    bus: Arc<EventBus>,
    flow_id: String,
    tracker: Arc<EndedTracker>,
    cancel: CancellationToken,
) {
    let offset = AtomicU64::new(0);
    let sequence = AtomicU64::new(0);
    let started = tokio::time::Instant::now();
    let mut last_heartbeat = started;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("dev run {}: monitor cancelled", instance.dev_run_id);
                return;
            }
            _ = tokio::time::sleep(LIVENESS_POLL) => {}
        }

        tail_chunks(
            &instance.output_file_path,
            &offset,
            &sequence,
            &bus,
            &flow_id,
            &instance.dev_run_id,
        )
        .await;

        if last_heartbeat.elapsed() >= HEARTBEAT {
            log::trace!(
                "dev run {}: monitor heartbeat, session {}",
                instance.dev_run_id,
                instance.session_id
            );
            last_heartbeat = tokio::time::Instant::now();
        }

        let exited: Option<(Option<i32>, Option<i32>)> = match child.as_mut() {
            Some(c) => match c.try_wait() {
                Ok(Some(status)) => Some((status.code(), status_signal(&status))),
                Ok(None) => None,
                Err(e) => {
                    log::warn!("dev run {}: wait failed: {e}", instance.dev_run_id);
                    Some((None, None))
                }
            },
            None => {
                if session_alive(instance.session_id) {
                    None
                } else {
                    Some((None, None))
                }
            }
        };

        if let Some((exit_status, signal)) = exited {
            // Final drain before the ended event closes the sub-stream.
            tail_chunks(
                &instance.output_file_path,
                &offset,
                &sequence,
                &bus,
                &flow_id,
                &instance.dev_run_id,
            )
            .await;
            if tracker.claim() {
                bus.publish(
                    &flow_id,
                    FlowEventKind::DevRunEnded {
                        dev_run_id: instance.dev_run_id.clone(),
                        exit_status,
                        signal,
                        error: None,
                    },
                );
                bus.publish(
                    &flow_id,
                    FlowEventKind::EndStream {
                        dev_run_id: instance.dev_run_id.clone(),
                    },
                );
            }
            return;
        }

        if started.elapsed() >= MONITOR_DEADLINE {
            log::warn!("dev run {}: monitor deadline reached", instance.dev_run_id);
            return;
        }
    }
}

/// Read and publish any bytes past `offset` in 4 KiB chunks.
async fn tail_chunks(
    path: &str,
    offset: &AtomicU64,
    sequence: &AtomicU64,
    bus: &EventBus,
    flow_id: &str,
    dev_run_id: &str,
) {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return;
    };
    let start = offset.load(Ordering::SeqCst);
    if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
        return;
    }
    let mut buf = vec![0u8; TAIL_CHUNK];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                offset.fetch_add(n as u64, Ordering::SeqCst);
                let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                if chunk.is_empty() {
                    continue;
                }
                bus.publish(
                    flow_id,
                    FlowEventKind::DevRunOutput {
                        dev_run_id: dev_run_id.to_string(),
                        stream: OutputStream::Combined,
                        chunk,
                        sequence: sequence.fetch_add(1, Ordering::SeqCst),
                    },
                );
            }
            Err(_) => return,
        }
    }
}

// ── Platform plumbing ────────────────────────────────────────────────────

mod libc_signal {
    #[cfg(unix)]
    pub const SIGINT: i32 = libc::SIGINT;
    #[cfg(unix)]
    pub const SIGKILL: i32 = libc::SIGKILL;
    #[cfg(not(unix))]
    pub const SIGINT: i32 = 2;
    #[cfg(not(unix))]
    pub const SIGKILL: i32 = 9;
}

/// `kill -0` against the session leader. EPERM still means alive.
#[cfg(unix)]
pub fn session_alive(session_id: i32) -> bool {
    let rc = unsafe { libc::kill(session_id, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn session_alive(_session_id: i32) -> bool {
    false
}

/// Signal the whole session: the negative pid reaches every process in the
/// session leader's process group.
#[cfg(unix)]
fn signal_session(session_id: i32, signal: i32) {
    unsafe {
        libc::kill(-session_id, signal);
    }
}

#[cfg(not(unix))]
fn signal_session(_session_id: i32, _signal: i32) {}

#[cfg(unix)]
fn status_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn status_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Fork the command through `sh -c` in a new session, stdout and stderr
/// both redirected to the output file.
#[cfg(unix)]
fn spawn_session_leader(
    command: &str,
    working_dir: &str,
    output_file_path: &std::path::Path,
    env: &[(&'static str, String)],
) -> Result<tokio::process::Child, DevRunError> {
    let output = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_file_path)?;
    let stderr = output.try_clone()?;

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(output))
        .stderr(Stdio::from(stderr));
    for (key, value) in env {
        cmd.env(key, value);
    }
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn()
        .map_err(|e| DevRunError::Spawn(format!("sh -c failed: {e}")))
}

#[cfg(not(unix))]
fn spawn_session_leader(
    _command: &str,
    _working_dir: &str,
    _output_file_path: &std::path::Path,
    _env: &[(&'static str, String)],
) -> Result<tokio::process::Child, DevRunError> {
    Err(DevRunError::Spawn(
        "dev runs require a unix platform".into(),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::FlowEvent;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn supervisor() -> (DevRunSupervisor, broadcast::Receiver<FlowEvent>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let sup = DevRunSupervisor::new("flow-dev", bus, Arc::new(GlobalState::new()));
        (sup, rx)
    }

    fn options(dir: &TempDir, command_id: &str, start: &str) -> StartOptions {
        let mut opts = StartOptions::new(
            command_id,
            DevRunCommandConfig {
                start: start.to_string(),
                stop: None,
                working_dir: Some(dir.path().display().to_string()),
                stop_timeout_seconds: 10,
            },
        );
        opts.output_dir = Some(dir.path().to_path_buf());
        opts.warmup = Some(Duration::from_millis(400));
        opts
    }

    async fn collect_events(
        rx: &mut broadcast::Receiver<FlowEvent>,
        window: Duration,
    ) -> Vec<FlowEventKind> {
        let mut kinds = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return kinds;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => kinds.push(event.kind),
                _ => return kinds,
            }
        }
    }

    #[tokio::test]
    async fn immediate_failure_emits_started_then_ended() {
        let dir = TempDir::new().unwrap();
        let (sup, mut rx) = supervisor();

        let err = sup
            .start(options(&dir, "fail", "exit 1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited immediately"));
        assert!(sup.state.dev_run("fail").is_none());

        let kinds = collect_events(&mut rx, Duration::from_millis(300)).await;
        assert!(matches!(kinds[0], FlowEventKind::DevRunStarted { .. }));
        assert!(kinds.iter().any(|k| matches!(
            k,
            FlowEventKind::DevRunEnded {
                exit_status: Some(1),
                ..
            }
        )));
        assert!(
            kinds
                .iter()
                .any(|k| matches!(k, FlowEventKind::EndStream { .. }))
        );
    }

    #[tokio::test]
    async fn output_is_streamed_and_run_ends_naturally() {
        let dir = TempDir::new().unwrap();
        let (sup, mut rx) = supervisor();

        let handle = sup
            .start(options(&dir, "echoer", "echo hello-from-run; sleep 1"))
            .await
            .unwrap();
        assert!(sup.state.dev_run("echoer").is_some());

        let kinds = collect_events(&mut rx, Duration::from_secs(3)).await;
        let output: String = kinds
            .iter()
            .filter_map(|k| match k {
                FlowEventKind::DevRunOutput { chunk, .. } => Some(chunk.clone()),
                _ => None,
            })
            .collect();
        assert!(output.contains("hello-from-run"));
        let ended = kinds
            .iter()
            .filter(|k| matches!(k, FlowEventKind::DevRunEnded { .. }))
            .count();
        assert_eq!(ended, 1);
        handle.monitor.await.unwrap();
    }

    #[tokio::test]
    async fn stop_on_empty_registry_is_a_successful_noop() {
        let (sup, _rx) = supervisor();
        sup.stop("nothing-here", None).await.unwrap();
    }

    #[tokio::test]
    async fn stop_escalates_past_a_sigint_trap() {
        let dir = TempDir::new().unwrap();
        let (sup, mut rx) = supervisor();

        let handle = sup
            .start(options(
                &dir,
                "stubborn",
                "trap '' INT; while true; do sleep 1; done",
            ))
            .await
            .unwrap();
        let session_id = handle.instance.session_id;

        let started = std::time::Instant::now();
        sup.stop("stubborn", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "stopped too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "stopped too slow: {elapsed:?}");

        // The leader may linger as a zombie until the monitor reaps it.
        let mut dead = false;
        for _ in 0..20 {
            if !session_alive(session_id) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(dead, "session {session_id} still alive after stop");

        let kinds = collect_events(&mut rx, Duration::from_secs(1)).await;
        let ended = kinds
            .iter()
            .filter(|k| matches!(k, FlowEventKind::DevRunEnded { .. }))
            .count();
        assert_eq!(ended, 1, "ended event must be exactly-once");
        assert!(sup.state.dev_run("stubborn").is_none());
    }

    #[tokio::test]
    async fn starting_over_a_live_instance_reattaches() {
        let dir = TempDir::new().unwrap();
        let (sup, _rx) = supervisor();

        let first = sup
            .start(options(&dir, "web", "sleep 5"))
            .await
            .unwrap();
        let second = sup
            .start(options(&dir, "web", "sleep 5"))
            .await
            .unwrap();
        assert_eq!(first.instance.dev_run_id, second.instance.dev_run_id);
        assert_eq!(first.instance.session_id, second.instance.session_id);

        sup.stop("web", Some(Duration::from_secs(2))).await.unwrap();
    }

    #[tokio::test]
    async fn dead_recorded_instance_gets_a_fresh_run() {
        let dir = TempDir::new().unwrap();
        let (sup, _rx) = supervisor();

        let mut opts = options(&dir, "web", "sleep 5");
        opts.existing = Some(DevRunInstance {
            dev_run_id: "stale-run".into(),
            command_id: "web".into(),
            // A pid that cannot be a live session on any test host.
            session_id: i32::MAX - 1,
            output_file_path: dir.path().join("stale.out").display().to_string(),
        });
        let handle = sup.start(opts).await.unwrap();
        assert_ne!(handle.instance.dev_run_id, "stale-run");

        sup.stop("web", Some(Duration::from_secs(2))).await.unwrap();
    }
}
