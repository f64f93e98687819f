use tracing::{error, info, warn};

use crate::commands::CommandError;

/// Structured audit trail for command decisions, emitted under the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn command_rejected(&self, line: &str, safe_mode: bool, reason: &CommandError) {
        let kind = match reason {
            CommandError::EmptyCommand => "empty_command",
            CommandError::DangerousCommandBlocked { .. } => "dangerous_command_blocked",
            CommandError::CommandNotAllowed { .. } => "command_not_allowed",
            CommandError::ExecutionTimeout { .. } => "execution_timeout",
            CommandError::ExecutionFault(_) => "execution_fault",
        };
        warn!(target: "audit", event = "command_rejected", kind, command = line, safe_mode, reason = %reason);
    }

    pub fn command_executed(&self, verb: &str, safe_mode: bool, exit_code: Option<i32>, elapsed_ms: u64) {
        info!(target: "audit", event = "command_executed", verb, safe_mode, exit_code = ?exit_code, elapsed_ms);
    }

    pub fn command_timed_out(&self, verb: &str, pid: Option<u32>, elapsed_ms: u64) {
        warn!(target: "audit", event = "command_timed_out", verb, pid = ?pid, elapsed_ms);
    }

    pub fn command_fault(&self, verb: &str, error_msg: &str) {
        error!(target: "audit", event = "command_fault", verb, error = error_msg);
    }
}
