pub mod executor;
pub mod timeout;
pub mod validator;

use std::time::Duration;
use thiserror::Error;

pub use executor::{CommandExecutor, CommandResult, ExecMode, ExecutionStatus};
pub use timeout::{TimeoutPhase, TimeoutStrategy, TimeoutTracker};
pub use validator::{CommandValidator, ValidatorConfig};

/// Everything that can stop a command from producing normal output.
///
/// Never escapes [`CommandExecutor::execute`]; each variant is folded into a
/// [`CommandResult`] with a readable message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("No command provided")]
    EmptyCommand,
    #[error("Command '{verb}' is blocked in safe mode")]
    DangerousCommandBlocked { verb: String },
    #[error("Command '{verb}' is not allowed")]
    CommandNotAllowed { verb: String },
    #[error("command timed out after {}s", format_secs(.after))]
    ExecutionTimeout { after: Duration },
    #[error("{0}")]
    ExecutionFault(String),
}

impl CommandError {
    /// Policy rejections happen before anything is spawned.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CommandError::EmptyCommand
                | CommandError::DangerousCommandBlocked { .. }
                | CommandError::CommandNotAllowed { .. }
        )
    }
}

fn format_secs(d: &Duration) -> String {
    let secs = d.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{:.3}", secs)
    }
}
