//! Error types for Tether core.

/// Errors raised while bringing up or talking to an [`IoThread`](crate::IoThread).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoThreadError {
    /// The OS thread or its runtime could not be created.
    #[error("failed to create I/O thread: {0}")]
    CreationFailed(String),
    /// A blocking call was made from the I/O thread itself.
    #[error("blocking call issued from the I/O thread would deadlock")]
    WouldDeadlock,
    /// The I/O thread stopped before the posted task reported back.
    #[error("I/O thread is no longer running")]
    Disconnected,
}

/// A specialized Result type for Tether core operations.
pub type Result<T> = std::result::Result<T, IoThreadError>;
