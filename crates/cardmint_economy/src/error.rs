//! # Economy Error Types
//!
//! All errors that can occur in the economy engine and its ledger.
//!
//! Every error is scoped to the single operation that produced it. None of them
//! leave partial state behind: a failing transaction is rolled back before the
//! error reaches the caller.

use chrono::Duration;
use thiserror::Error;

use crate::card::{CardId, UserId};

/// Errors that can occur in the economy engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EconomyError {
    /// The free pack was opened too recently.
    #[error("free pack on cooldown, {} seconds remaining", .remaining.num_seconds())]
    CooldownActive {
        /// Time left until the next free pack can be opened.
        remaining: Duration,
    },

    /// The user cannot afford the requested debit.
    #[error("insufficient funds: balance {balance}, need {cost}")]
    InsufficientFunds {
        /// Balance at the time of the check.
        balance: u64,
        /// Amount that was required.
        cost: u64,
    },

    /// The pack identifier does not name a purchasable pack.
    #[error("unknown pack: {0}")]
    UnknownPack(String),

    /// No card with this id exists.
    #[error("card not found: {0}")]
    CardNotFound(CardId),

    /// The card belongs to someone other than the claimed owner.
    #[error("card {card_id} is owned by {owner}, not {claimed}")]
    NotOwner {
        /// The card being transferred.
        card_id: CardId,
        /// Actual owner.
        owner: UserId,
        /// Owner named by the caller.
        claimed: UserId,
    },

    /// A ledger row was addressed before the user was created.
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    /// The ledger failed or timed out; the transaction was rolled back.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Arithmetic overflow in a coin or income calculation.
    #[error("arithmetic overflow in economic calculation")]
    ArithmeticOverflow,

    /// Invalid configuration or unreadable ledger file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EconomyError {
    /// Returns true if retrying the same request later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CooldownActive { .. } | Self::StoreUnavailable(_))
    }
}

/// Result type for economy operations.
pub type EconomyResult<T> = Result<T, EconomyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_message_shows_seconds() {
        let err = EconomyError::CooldownActive {
            remaining: Duration::seconds(90),
        };
        assert_eq!(err.to_string(), "free pack on cooldown, 90 seconds remaining");
        assert!(err.is_transient());
    }

    #[test]
    fn test_user_errors_are_not_transient() {
        assert!(!EconomyError::CardNotFound(7).is_transient());
        assert!(!EconomyError::InsufficientFunds { balance: 0, cost: 50 }.is_transient());
        assert!(EconomyError::StoreUnavailable("timeout".to_string()).is_transient());
    }
}
