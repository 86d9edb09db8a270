//! Error taxonomy shared by every ChainLedger component.

use thiserror::Error;

use crate::types::{BlockNumber, ChainId};

/// Errors that can occur while scanning, publishing, routing or applying.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Transient I/O failure (provider hiccup, bus unavailable). Retried with backoff.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A chain query or publish exceeded its deadline.
    #[error("timed out after {ms}ms: {operation}")]
    Timeout { operation: String, ms: u64 },

    /// Chain RPC returned a non-transient error.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Caller is not allowed to perform the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No registered bridge adapter supports the destination chain.
    #[error("unsupported destination chain {0}")]
    UnsupportedChain(ChainId),

    /// A protocol name did not match any registered adapter.
    #[error("unknown bridge protocol '{0}'")]
    UnknownProtocol(String),

    /// A bridge adapter rejected a send.
    #[error("bridge adapter '{protocol}' failed: {reason}")]
    Adapter { protocol: String, reason: String },

    /// An outbound message exhausted its retry budget.
    #[error("message {message_id} failed permanently after {attempts} attempts")]
    PermanentDeliveryFailure { message_id: String, attempts: u32 },

    /// A state machine transition was requested from the wrong state.
    #[error("invalid transition for {message_id}: {from} -> {to}")]
    InvalidTransition {
        message_id: String,
        from: String,
        to: String,
    },

    /// Message id is not tracked.
    #[error("unknown message {0}")]
    UnknownMessage(String),

    /// A checkpoint advance would move the cursor backwards.
    #[error("checkpoint regression on chain {chain_id}: {current} -> {requested}")]
    CheckpointRegression {
        chain_id: ChainId,
        current: BlockNumber,
        requested: BlockNumber,
    },

    /// A local mutation would push the global credit line below zero.
    #[error("credit line exceeded for '{account}': available {available}, requested {requested}")]
    CreditLineExceeded {
        account: String,
        available: i128,
        requested: u128,
    },

    /// Arithmetic on a ledger field left its valid range.
    #[error("ledger field '{field}' out of range for '{account}'")]
    LedgerOverflow { account: String, field: &'static str },

    /// A legacy INCREMENT message arrived while only absolute updates are accepted.
    #[error("legacy increment update rejected for message {0}")]
    LegacyUpdateRejected(String),

    /// Payload or configuration could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LedgerError {
    /// Returns `true` for transient errors that are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Timeout { .. })
    }

    /// Returns `true` if a failed operation may be attempted again later.
    ///
    /// Authorization and routing errors surface immediately and are never retried.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, Self::Adapter { .. } | Self::Rpc(_))
    }

    /// Returns `true` if the error is terminal for an outbound message.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_)
                | Self::UnsupportedChain(_)
                | Self::UnknownProtocol(_)
                | Self::PermanentDeliveryFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(LedgerError::TransientIo("bus down".into()).is_transient());
        assert!(LedgerError::Timeout { operation: "getLogs".into(), ms: 10 }.is_retryable());
        assert!(!LedgerError::UnsupportedChain(9).is_retryable());
        assert!(LedgerError::UnsupportedChain(9).is_permanent());
        assert!(!LedgerError::Unauthorized("bad secret".into()).is_retryable());
    }
}
