use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout as tokio_timeout};
use tracing::{debug, info, warn};

use crate::agent::config::CommandConfig;
use crate::commands::timeout::{TimeoutPhase, TimeoutStrategy, TimeoutTracker};
use crate::commands::validator::{CommandValidator, ValidatorConfig};
use crate::commands::CommandError;
use crate::security::AuditLogger;
use crate::transport::{CommandRequest, RunResponse};

const EMPTY_SUCCESS_MESSAGE: &str = "Command executed successfully (no output)";
const TRUNCATION_MARKER: &str = "\n[output truncated]";
const READ_CHUNK: usize = 4096;

/// How an allowed command line is turned into a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// `sh -c <line>`; pipes and redirection work, metacharacters are live
    #[default]
    Shell,
    /// verb spawned directly with whitespace-split arguments
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Rejected,
    Timeout,
    Fault,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Rejected => "rejected",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Fault => "fault",
        }
    }
}

/// Outcome of a single `execute` call. `output` is never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub output: String,
    pub elapsed_seconds: f64,
    pub succeeded: bool,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Why the command did not complete normally
    #[serde(skip)]
    pub error: Option<CommandError>,
}

impl CommandResult {
    fn rejected(err: &CommandError) -> Self {
        Self {
            output: format!("Error: {err}"),
            elapsed_seconds: 0.0,
            succeeded: false,
            status: ExecutionStatus::Rejected,
            exit_code: None,
            error: Some(err.clone()),
        }
    }

    fn completed(status: ExitStatus, output: String, elapsed: Duration) -> Self {
        let succeeded = status.success();
        let output = if succeeded {
            if output.trim().is_empty() {
                EMPTY_SUCCESS_MESSAGE.to_string()
            } else {
                output
            }
        } else {
            match status.code() {
                Some(code) => format!("Error (exit code {code}):\n{output}"),
                None => format!("Error (terminated by signal):\n{output}"),
            }
        };

        Self {
            output,
            elapsed_seconds: round_millis(elapsed),
            succeeded,
            status: if succeeded {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            },
            exit_code: status.code(),
            error: None,
        }
    }

    fn timed_out(err: &CommandError, partial: String, elapsed: Duration) -> Self {
        let mut output = format!("Error: {err}");
        if !partial.trim().is_empty() {
            output.push('\n');
            output.push_str(&partial);
        }
        Self {
            output,
            elapsed_seconds: round_millis(elapsed),
            succeeded: false,
            status: ExecutionStatus::Timeout,
            exit_code: None,
            error: Some(err.clone()),
        }
    }

    fn fault(err: &CommandError, elapsed: Duration) -> Self {
        Self {
            output: format!("Error: {err}"),
            elapsed_seconds: round_millis(elapsed),
            succeeded: false,
            status: ExecutionStatus::Fault,
            exit_code: None,
            error: Some(err.clone()),
        }
    }

    pub fn to_response(&self) -> RunResponse {
        RunResponse {
            output: self.output.clone(),
            time: self.elapsed_seconds,
            succeeded: self.succeeded,
            status: self.status.as_str().to_string(),
        }
    }
}

fn round_millis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

/// Progress callback for command execution
pub type ProgressCallback = Box<dyn Fn(TimeoutPhase, Duration) + Send + Sync>;

/// Policy-gated command runner with an absolute wall-clock timeout.
pub struct CommandExecutor {
    validator: CommandValidator,
    strategy: TimeoutStrategy,
    mode: ExecMode,
    max_output_bytes: usize,
    audit: AuditLogger,
    progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("validator", &self.validator)
            .field("strategy", &self.strategy)
            .field("mode", &self.mode)
            .field("max_output_bytes", &self.max_output_bytes)
            .finish_non_exhaustive()
    }
}

impl CommandExecutor {
    pub fn new(validator: CommandValidator) -> Self {
        Self {
            validator,
            strategy: TimeoutStrategy::default(),
            mode: ExecMode::default(),
            max_output_bytes: 1024 * 1024,
            audit: AuditLogger::new(),
            progress_callback: None,
        }
    }

    pub fn from_config(config: &CommandConfig) -> Self {
        let validator = CommandValidator::new(
            ValidatorConfig::default().with_extra_allowed(config.extra_allowed.iter().cloned()),
        );
        Self::new(validator)
            .with_strategy(TimeoutStrategy::from_duration(config.timeout()))
            .with_mode(config.exec_mode)
            .with_max_output_bytes(config.max_output_bytes)
    }

    pub fn with_strategy(mut self, strategy: TimeoutStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Set progress callback, fired on every timeout phase transition
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(TimeoutPhase, Duration) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    /// Validate and run a command line. Never fails: every error is folded
    /// into the returned result.
    pub async fn execute(&self, request: &CommandRequest) -> CommandResult {
        let verb = match self.validator.validate(&request.cmd, request.safe_mode) {
            Ok(verb) => verb,
            Err(err) => {
                self.audit
                    .command_rejected(&request.cmd, request.safe_mode, &err);
                return CommandResult::rejected(&err);
            }
        };

        info!(verb, safe_mode = request.safe_mode, mode = ?self.mode, "executing command");
        let result = self.run(&request.cmd, verb).await;
        match result.status {
            ExecutionStatus::Success | ExecutionStatus::Failed => self.audit.command_executed(
                verb,
                request.safe_mode,
                result.exit_code,
                (result.elapsed_seconds * 1000.0) as u64,
            ),
            _ => {}
        }
        result
    }

    async fn run(&self, line: &str, verb: &str) -> CommandResult {
        let mut command = self.build_command(line, verb);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let tracker = TimeoutTracker::new(self.strategy.clone());
        let start = Instant::now();

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = CommandError::ExecutionFault(format!("failed to spawn command: {e}"));
                self.audit.command_fault(verb, &err.to_string());
                return CommandResult::fault(&err, start.elapsed());
            }
        };

        let pid = child.id();
        debug!("Spawned process with PID: {:?}", pid);

        let output = OutputBuffer::new(self.max_output_bytes);
        let mut readers = vec![
            spawn_reader(child.stdout.take(), output.clone()),
            spawn_reader(child.stderr.take(), output.clone()),
        ];

        let mut last_phase = TimeoutPhase::Normal;
        let waited = loop {
            let Some(next) = tracker.next_phase_at() else {
                self.report_phase(&tracker, &mut last_phase);
                break None;
            };

            tokio::select! {
                status = child.wait() => break Some(status),
                _ = sleep_until(next.into()) => self.report_phase(&tracker, &mut last_phase),
            }
        };

        match waited {
            Some(Ok(status)) => {
                let elapsed = start.elapsed();
                let remaining = tracker
                    .deadline()
                    .saturating_duration_since(Instant::now())
                    .max(self.strategy.reap_grace());
                if !join_readers(&mut readers, remaining).await {
                    // Leader exited but something in its group still holds the pipes.
                    warn!(verb, "output pipes still open after exit, killing process group");
                    kill_process_group(&mut child, pid);
                    join_readers(&mut readers, self.strategy.reap_grace()).await;
                }
                CommandResult::completed(status, output.take_string(), elapsed)
            }
            Some(Err(e)) => {
                let elapsed = start.elapsed();
                kill_process_group(&mut child, pid);
                join_readers(&mut readers, self.strategy.reap_grace()).await;
                let err = CommandError::ExecutionFault(format!("failed to wait for child: {e}"));
                self.audit.command_fault(verb, &err.to_string());
                CommandResult::fault(&err, elapsed)
            }
            None => {
                warn!(verb, pid = ?pid, "command reached its deadline, force terminating");
                kill_process_group(&mut child, pid);
                if tokio_timeout(self.strategy.reap_grace(), child.wait())
                    .await
                    .is_err()
                {
                    warn!(verb, pid = ?pid, "killed process was not reaped in time");
                }
                let elapsed = start.elapsed();
                join_readers(&mut readers, self.strategy.reap_grace()).await;

                let err = CommandError::ExecutionTimeout {
                    after: self.strategy.kill_timeout(),
                };
                self.audit
                    .command_timed_out(verb, pid, elapsed.as_millis() as u64);
                CommandResult::timed_out(&err, output.take_string(), elapsed)
            }
        }
    }

    fn report_phase(&self, tracker: &TimeoutTracker, last_phase: &mut TimeoutPhase) {
        let phase = tracker.current_phase();
        if phase == *last_phase {
            return;
        }
        let elapsed = tracker.elapsed();
        if phase == TimeoutPhase::Warning {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                deadline_ms = tracker.strategy().base_timeout_ms,
                "command is approaching its deadline"
            );
        }
        if let Some(ref callback) = self.progress_callback {
            callback(phase, elapsed);
        }
        *last_phase = phase;
    }

    fn build_command(&self, line: &str, verb: &str) -> Command {
        match self.mode {
            ExecMode::Shell => shell_command(line),
            ExecMode::Direct => {
                let mut command = Command::new(verb);
                command.args(line.split_whitespace().skip(1));
                command
            }
        }
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(CommandValidator::default_secure())
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

/// SIGKILL the child's whole process group so shell grandchildren die with it.
#[cfg(unix)]
fn kill_process_group(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGKILL to process group {}", pid);
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }
}

/// Combined stdout/stderr capture, in arrival order, capped at `limit` bytes.
#[derive(Debug, Clone)]
struct OutputBuffer {
    inner: Arc<Mutex<CapturedOutput>>,
    limit: usize,
}

#[derive(Debug, Default)]
struct CapturedOutput {
    bytes: Vec<u8>,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CapturedOutput::default())),
            limit,
        }
    }

    fn push(&self, chunk: &[u8]) {
        let mut captured = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let room = self.limit.saturating_sub(captured.bytes.len());
        if chunk.len() > room {
            captured.truncated = true;
        }
        let take = chunk.len().min(room);
        captured.bytes.extend_from_slice(&chunk[..take]);
    }

    fn take_string(&self) -> String {
        let mut captured = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = std::mem::take(&mut captured.bytes);
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if captured.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

fn spawn_reader<R>(stream: Option<R>, sink: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink.push(&chunk[..n]),
                Err(e) => {
                    debug!("output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

/// Wait for the pipe readers; aborts them and returns false if they outlive `limit`.
async fn join_readers(readers: &mut [JoinHandle<()>], limit: Duration) -> bool {
    let joined = tokio_timeout(limit, futures::future::join_all(readers.iter_mut())).await;
    if joined.is_err() {
        for reader in readers.iter() {
            reader.abort();
        }
        return false;
    }
    true
}
