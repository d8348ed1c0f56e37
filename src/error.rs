//! Typed failure kinds.
//!
//! Most APIs return `anyhow::Result`. The kinds below are the ones a caller
//! has to tell apart (stream teardown vs. producer timeout, fatal annotator
//! failure vs. a restartable pipeline fault), so they travel inside
//! `anyhow::Error` and are recovered with `downcast_ref`.

use thiserror::Error;

use crate::registry::ChannelId;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Channel id outside `[0, N)`.
    #[error("channel {id} out of range (channels: {count})")]
    ChannelOutOfRange { id: ChannelId, count: usize },

    /// The producer delivered nothing within the consumer's bound.
    #[error("unable to receive frames from pipeline on channel(s) {channels:?} within {waited_ms} ms")]
    ProducerUnreachable {
        channels: Vec<ChannelId>,
        waited_ms: u128,
    },

    /// The tracking collaborator reported an unrecoverable failure.
    #[error("tracking failed on channel {channel}: {reason}")]
    AnnotatorFatal { channel: ChannelId, reason: String },

    /// A fault reported on the pipeline control bus.
    #[error("pipeline fault: {message}")]
    PipelineFault { message: String },

    /// Restart limit configured on the supervisor was reached.
    #[error("pipeline restarted {restarts} times, giving up")]
    RestartLimit { restarts: u32 },
}

impl RelayError {
    /// Returns true when the error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::AnnotatorFatal { .. } | RelayError::RestartLimit { .. }
        )
    }
}
