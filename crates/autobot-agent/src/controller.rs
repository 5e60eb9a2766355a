use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use autobot_process::{FailureReason, Notification, RunId, RunState, RunStatus};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{Mutex, watch},
    task::{AbortHandle, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ControllerConfig,
    console::ConsoleBuffer,
    controller_support::{KILL_CONFIRM_SLACK, READER_DRAIN_TIMEOUT, decode_line},
    discovery::{self, LaunchSpec},
    listener::RunListener,
    process_tree::{self, TreeSignal},
};

/// Fail-fast reasons for [`ProcessController::start`].
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("automation is already running")]
    AlreadyRunning,
    #[error("previous run is still finishing; try again shortly")]
    Finishing,
    #[error("script not found at: {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("failed to start {exec}: {source}")]
    Spawn {
        exec: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type SharedConsole = Arc<std::sync::Mutex<ConsoleBuffer>>;

fn deliver(listener: &dyn RunListener, console: &SharedConsole, n: Notification) {
    match &n {
        Notification::Output { line } => listener.on_output_line(line),
        Notification::Error { line } => listener.on_error_line(line),
        Notification::Completed { success } => listener.on_completed(*success),
    }
    console
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(n);
}

/// Per-run emitter. Once the completion is delivered nothing else gets through.
#[derive(Clone)]
struct RunSink {
    sealed: Arc<std::sync::Mutex<bool>>,
    listener: Arc<dyn RunListener>,
    console: SharedConsole,
}

impl RunSink {
    fn emit(&self, n: Notification) -> bool {
        let mut sealed = self
            .sealed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *sealed {
            return false;
        }
        if n.is_completion() {
            *sealed = true;
        }
        deliver(self.listener.as_ref(), &self.console, n);
        true
    }

    fn line(&self, stream: Stream, line: String) {
        let n = match stream {
            Stream::Stdout => Notification::Output { line },
            Stream::Stderr => Notification::Error { line },
        };
        self.emit(n);
    }

    fn error(&self, line: impl Into<String>) {
        self.emit(Notification::Error { line: line.into() });
    }

    fn complete(&self, success: bool) -> bool {
        self.emit(Notification::Completed { success })
    }
}

/// Everything owned by the single in-flight run.
struct ActiveRun {
    id: RunId,
    pid: Option<u32>,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
    outcome_tx: watch::Sender<Option<bool>>,
    outcome_rx: watch::Receiver<Option<bool>>,
    supervisor: AbortHandle,
    sink: RunSink,
}

struct Slot {
    run: Option<ActiveRun>,
    status: RunStatus,
}

struct Inner {
    spec: LaunchSpec,
    log_name: String,
    grace: Duration,
    listener: Arc<dyn RunListener>,
    console: SharedConsole,
    slot: Mutex<Slot>,
}

impl Inner {
    fn emit(&self, n: Notification) {
        deliver(self.listener.as_ref(), &self.console, n);
    }

    fn notice(&self, line: impl Into<String>) {
        self.emit(Notification::Output { line: line.into() });
    }

    fn error(&self, line: impl Into<String>) {
        self.emit(Notification::Error { line: line.into() });
    }
}

/// Single-slot owner of the automation child process.
#[derive(Clone)]
pub struct ProcessController {
    inner: Arc<Inner>,
}

impl ProcessController {
    pub fn new(spec: LaunchSpec, cfg: &ControllerConfig, listener: Arc<dyn RunListener>) -> Self {
        Self {
            inner: Arc::new(Inner {
                spec,
                log_name: cfg.log_name.clone(),
                grace: cfg.grace_period(),
                listener,
                console: Arc::new(std::sync::Mutex::new(ConsoleBuffer::new(
                    cfg.console_max_lines,
                ))),
                slot: Mutex::new(Slot {
                    run: None,
                    status: RunStatus::idle(),
                }),
            }),
        }
    }

    /// Resolves script and interpreter from `cfg`, then builds the controller.
    ///
    /// Never fails: an unresolved script surfaces on start().
    pub async fn discover(cfg: &ControllerConfig, listener: Arc<dyn RunListener>) -> Self {
        let (spec, interpreter) = discovery::discover(cfg).await;
        match &interpreter.version {
            Some(v) => info!(interpreter = %interpreter.name, version = %v, "interpreter resolved"),
            None => warn!(
                interpreter = %interpreter.name,
                "no interpreter candidate answered the version probe; using default"
            ),
        }
        if !spec.script.is_file() {
            warn!(script = %spec.script.display(), "script not found; start will fail until configuration is fixed");
        }
        Self::new(spec, cfg, listener)
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.inner.spec
    }

    /// Launches the script and resolves once it has exited.
    ///
    /// Returns the same success flag the completion notification carries.
    /// Fail-fast cases emit an error notification and return `false`.
    pub async fn start(&self) -> bool {
        let mut outcome = match self.begin().await {
            Ok(rx) => rx,
            Err(err) => {
                self.inner.error(err.to_string());
                return false;
            }
        };

        match outcome.wait_for(Option::is_some).await {
            Ok(v) => (*v).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn begin(&self) -> Result<watch::Receiver<Option<bool>>, StartError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;

        if let Some(run) = &slot.run {
            // Exited but still draining output: is_running() already says false.
            if run.exited.load(Ordering::Acquire) {
                debug!(run_id = %run.id, "start rejected: previous run finishing");
                return Err(StartError::Finishing);
            }
            debug!(run_id = %run.id, "start rejected: run in progress");
            return Err(StartError::AlreadyRunning);
        }

        let spec = &inner.spec;
        if !spec.script.is_file() {
            warn!(script = %spec.script.display(), "start rejected: script not found");
            return Err(StartError::ScriptNotFound(spec.script.clone()));
        }

        let id = RunId::new();
        slot.status = RunStatus {
            id: Some(id.clone()),
            state: RunState::Starting,
            pid: None,
            exit_code: None,
            message: Some("starting".to_string()),
        };

        let cwd = spec.working_dir();
        info!(
            run_id = %id,
            exec = %spec.exec,
            script = %spec.script.display(),
            cwd = %cwd.display(),
            "starting automation"
        );

        let mut cmd = Command::new(&spec.exec);
        cmd.args(spec.command_args())
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        process_tree::isolate(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(source) => {
                let err = StartError::Spawn {
                    exec: spec.exec.clone(),
                    source,
                };
                warn!(run_id = %id, error = %err, "spawn failed");
                slot.status.state = RunState::Failed(FailureReason::Spawn);
                slot.status.message = Some(err.to_string());
                return Err(err);
            }
        };
        let pid = child.id();

        let sink = RunSink {
            sealed: Arc::new(std::sync::Mutex::new(false)),
            listener: inner.listener.clone(),
            console: inner.console.clone(),
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Stream::Stdout, sink.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Stream::Stderr, sink.clone()));
        }

        let cancel = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let supervisor = tokio::spawn(supervise(
            self.inner.clone(),
            id.clone(),
            child,
            pid,
            cancel.clone(),
            exited.clone(),
            readers,
            sink.clone(),
        ));

        slot.status.state = RunState::Running;
        slot.status.pid = pid;
        slot.status.message = Some("running".to_string());
        slot.run = Some(ActiveRun {
            id,
            pid,
            cancel,
            exited,
            outcome_tx,
            outcome_rx: outcome_rx.clone(),
            supervisor: supervisor.abort_handle(),
            sink,
        });

        Ok(outcome_rx)
    }

    /// Stops the current run: graceful request, forced kill of the whole tree
    /// after the grace period, then cleanup. A no-op notice when idle.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let (id, pid, cancel, mut outcome) = {
            let mut guard = inner.slot.lock().await;
            let slot = &mut *guard;
            let Some(run) = slot.run.as_ref() else {
                inner.notice("No run is currently active.");
                return;
            };
            let handles = (
                run.id.clone(),
                run.pid,
                run.cancel.clone(),
                run.outcome_rx.clone(),
            );
            if slot.status.state == RunState::Running {
                slot.status.state = RunState::Stopping;
                slot.status.message = Some("stopping".to_string());
                run.sink.emit(Notification::Output {
                    line: "Stopping run...".to_string(),
                });
                info!(run_id = %run.id, pid = ?run.pid, "stop requested");
            }
            handles
        };

        cancel.cancel();

        let confirm = inner.grace + READER_DRAIN_TIMEOUT + KILL_CONFIRM_SLACK;
        if tokio::time::timeout(confirm, outcome.wait_for(Option::is_some))
            .await
            .is_ok()
        {
            return;
        }

        // The supervisor never confirmed; release the run ourselves.
        warn!(run_id = %id, pid = ?pid, "process did not confirm exit; forcing cleanup");
        if let Some(pid) = pid
            && let Err(err) = process_tree::signal_tree(pid, TreeSignal::Force).await
        {
            warn!(run_id = %id, error = %err, "forced kill failed");
        }
        finish_run(
            inner,
            &id,
            RunState::Failed(FailureReason::Terminated),
            None,
            "released after stop timeout".to_string(),
            Some("process did not confirm exit after stop; resources released".to_string()),
        )
        .await;
    }

    /// True while a child exists and has not been reported as exited.
    pub async fn is_running(&self) -> bool {
        let slot = self.inner.slot.lock().await;
        slot.run
            .as_ref()
            .is_some_and(|r| !r.exited.load(Ordering::Acquire))
    }

    pub async fn status(&self) -> RunStatus {
        self.inner.slot.lock().await.status.clone()
    }

    /// Returns a finished controller to `Idle`. False while a run is live.
    pub async fn reset(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        if slot.run.is_some() {
            return false;
        }
        if slot.status.state.can_transition(RunState::Idle) {
            slot.status = RunStatus::idle();
        }
        slot.status.state == RunState::Idle
    }

    /// Where the script is expected to write its log. Existence is not checked.
    pub fn resolve_log_path(&self) -> PathBuf {
        discovery::log_path_for(&self.inner.spec.script, &self.inner.log_name)
    }

    /// Console history after `cursor`; see [`ConsoleBuffer::tail_after`].
    pub fn tail_console(&self, cursor: u64, limit: usize) -> (Vec<Notification>, u64) {
        self.inner
            .console
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .tail_after(cursor, limit)
    }

    pub fn clear_console(&self) {
        self.inner
            .console
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

fn spawn_reader<R>(stream: R, kind: Stream, sink: RunSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    if line.trim().is_empty() {
                        continue;
                    }
                    sink.line(kind, line);
                }
                Err(err) => {
                    debug!(stream = ?kind, error = %err, "reader stopped");
                    break;
                }
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    inner: Arc<Inner>,
    id: RunId,
    mut child: Child,
    pid: Option<u32>,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
    sink: RunSink,
) {
    let started = tokio::time::Instant::now();
    let mut forced = false;
    let mut strays = Vec::new();

    let waited = tokio::select! {
        res = child.wait() => res,
        _ = cancel.cancelled() => {
            if let Some(pid) = pid {
                // Descendants that left the group must be found while their parent lives.
                strays = process_tree::strays(pid);
                if let Err(err) = process_tree::signal_tree(pid, TreeSignal::Graceful).await {
                    warn!(run_id = %id, error = %err, "graceful termination request failed");
                    sink.error(format!("Error stopping automation: {err}"));
                }
                process_tree::signal_strays(&strays, TreeSignal::Graceful);
            }
            match tokio::time::timeout(inner.grace, child.wait()).await {
                Ok(res) => res,
                Err(_) => {
                    forced = true;
                    warn!(
                        run_id = %id,
                        grace_ms = inner.grace.as_millis() as u64,
                        "grace period elapsed; killing process tree"
                    );
                    force_kill(&id, pid, &mut child, &sink).await;
                    child.wait().await
                }
            }
        }
    };
    exited.store(true, Ordering::Release);

    // Descendants must not outlive the run.
    if let Some(pid) = pid
        && process_tree::tree_alive(pid)
    {
        debug!(run_id = %id, pid, "sweeping leftover process group members");
        if let Err(err) = process_tree::signal_tree(pid, TreeSignal::Force).await {
            warn!(run_id = %id, error = %err, "failed to sweep process group");
        }
    }

    if !strays.is_empty() {
        let killed = process_tree::signal_strays(&strays, TreeSignal::Force);
        if killed > 0 {
            debug!(run_id = %id, killed, "killed descendants outside the process group");
        }
    }

    // One deadline for both streams.
    let drain_deadline = tokio::time::Instant::now() + READER_DRAIN_TIMEOUT;
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout_at(drain_deadline, reader).await.is_err() {
            debug!(run_id = %id, "output still open after exit; abandoning reader");
            abort.abort();
        }
    }

    let runtime_ms = started.elapsed().as_millis() as u64;
    let (state, exit_code, message, error_line) = match waited {
        Ok(status) if forced => (
            RunState::Failed(FailureReason::Terminated),
            status.code(),
            "killed after grace period".to_string(),
            None,
        ),
        Ok(status) if status.success() => {
            (RunState::Completed, status.code(), "exited".to_string(), None)
        }
        Ok(status) => {
            let message = match status.code() {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            };
            (
                RunState::Failed(FailureReason::ExitStatus),
                status.code(),
                message,
                None,
            )
        }
        Err(err) => (
            RunState::Failed(FailureReason::Wait),
            None,
            format!("wait failed: {err}"),
            Some(format!("Failed to wait for automation: {err}")),
        ),
    };

    info!(run_id = %id, state = ?state, exit_code = ?exit_code, runtime_ms, "run finished");
    finish_run(&inner, &id, state, exit_code, message, error_line).await;
}

async fn force_kill(id: &RunId, pid: Option<u32>, child: &mut Child, sink: &RunSink) {
    let Some(pid) = pid else {
        if let Err(err) = child.start_kill() {
            warn!(run_id = %id, error = %err, "kill failed");
            sink.error(format!("Error stopping automation: {err}"));
        }
        return;
    };
    if let Err(err) = process_tree::signal_tree(pid, TreeSignal::Force).await {
        warn!(run_id = %id, error = %err, "process tree kill failed; killing child only");
        sink.error(format!("Error stopping automation: {err}"));
        if let Err(err) = child.start_kill() {
            warn!(run_id = %id, error = %err, "child kill failed");
        }
    }
}

/// Releases the run and delivers its single completion.
///
/// Only the first caller for a given run does anything.
async fn finish_run(
    inner: &Inner,
    id: &RunId,
    state: RunState,
    exit_code: Option<i32>,
    message: String,
    error_line: Option<String>,
) -> bool {
    let mut slot = inner.slot.lock().await;
    if slot.run.as_ref().is_none_or(|r| &r.id != id) {
        return false;
    }
    let Some(run) = slot.run.take() else {
        return false;
    };

    slot.status.state = state;
    slot.status.exit_code = exit_code;
    slot.status.message = Some(message);

    run.cancel.cancel();
    // Still blocked on wait(): only the forced stop path gets here.
    if !run.exited.load(Ordering::Acquire) {
        run.supervisor.abort();
    }

    if let Some(line) = error_line {
        run.sink.error(line);
    }
    run.sink.complete(state.success());
    let _ = run.outcome_tx.send(Some(state.success()));
    true
}
