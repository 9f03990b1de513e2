use thiserror::Error;

/// Errors that occur while running the gossip engine.
#[derive(Debug, Error)]
pub enum GossipError {
    /// Underlying network I/O failure.
    #[error("gossip transport error: {0}")]
    Io(#[from] std::io::Error),
    /// A message could not be encoded or decoded.
    #[error("gossip codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// Payload exceeded the configured datagram budget.
    #[error("gossip message too large: {0} bytes")]
    MessageTooLarge(usize),
}
