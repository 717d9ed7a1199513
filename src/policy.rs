//! Auto-checkpoint policy
//!
//! A pure decision function: given the session's configured strategy, an
//! incoming event, and two small per-session counters, decide whether the
//! manager should create a checkpoint now. The policy owns no other state
//! and performs no I/O; the manager updates the counters after every
//! checkpoint it creates.

use crate::types::CheckpointStrategy;
use chrono::{DateTime, Utc};

/// An external event observed by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A user/assistant exchange completed
    PromptCompleted,
    /// A tool was invoked
    ToolUse {
        /// Whether the tool modified files in the working tree
        mutates_files: bool,
    },
    /// A wall-clock tick from the event source
    Tick {
        /// Current time carried by the tick
        now: DateTime<Utc>,
    },
}

/// Per-session counters the policy reads
#[derive(Debug, Clone, Copy)]
pub struct PolicyCounters {
    /// When the session last checkpointed
    pub last_checkpoint_at: DateTime<Utc>,
    /// Message index recorded at the last checkpoint
    pub last_checkpoint_message_index: u64,
}

impl PolicyCounters {
    /// Counters for a session that has just checkpointed (or just started)
    pub fn reset(message_index: u64) -> Self {
        Self {
            last_checkpoint_at: Utc::now(),
            last_checkpoint_message_index: message_index,
        }
    }
}

/// Decide whether a checkpoint should be created now
///
/// `Manual` never fires. `PerPrompt` fires on every completed exchange,
/// `PerToolUse` on every file-modifying tool invocation, and
/// `TimeInterval` once the configured duration has elapsed since the last
/// checkpoint. Events a strategy does not care about never fire.
pub fn should_checkpoint(
    strategy: &CheckpointStrategy,
    event: &SessionEvent,
    counters: &PolicyCounters,
) -> bool {
    match (strategy, event) {
        (CheckpointStrategy::Manual, _) => false,
        (CheckpointStrategy::PerPrompt, SessionEvent::PromptCompleted) => true,
        (CheckpointStrategy::PerToolUse, SessionEvent::ToolUse { mutates_files }) => {
            *mutates_files
        }
        (CheckpointStrategy::TimeInterval(interval), SessionEvent::Tick { now }) => {
            let elapsed = now.signed_duration_since(counters.last_checkpoint_at);
            elapsed.to_std().map(|e| e >= *interval).unwrap_or(false)
        }
        _ => false,
    }
}
