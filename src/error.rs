use crate::{
    amount::AmountError,
    model::Currency,
    wallet::WalletError,
};
use alloy::primitives::Address;
use std::fmt;

/// Every failure an operation of this crate can surface to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    NoWalletProvider,
    /// Signature, chain switch or chain addition declined in the wallet.
    UserRejected,
    NetworkMismatch {
        observed: u64,
        expected: u64,
        expected_name: String,
    },
    NetworkSwitchTimeout {
        expected: u64,
        expected_name: String,
    },
    ContractNotDeployed {
        contract: String,
        address: Address,
    },
    ApprovalRejected {
        symbol: String,
    },
    ApprovalFailed {
        symbol: String,
        reason: String,
    },
    InsufficientBalance {
        symbol: String,
        have: String,
        need: String,
        shortfall: String,
    },
    InvalidEntryFee {
        minimum: String,
        given: String,
    },
    InvalidPlayerCount {
        min: u32,
        max: u32,
        given: u32,
    },
    InvalidAmount(String),
    RoundExpired,
    ChoiceAlreadyMade,
    InsufficientGasFunds,
    NotAPlayer {
        game_id: u64,
    },
    StakeLocked {
        active_games: u64,
    },
    GameNotFound(u64),
    RoundNotFound {
        game_id: u64,
        round: u32,
    },
    UnsupportedCurrency(Currency),
    /// Generic revert or confirmation failure.
    TransactionFailed(String),
    Decode(String),
    Config(String),
    /// Provider error that matches nothing above; carries the raw message.
    Provider(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWalletProvider => {
                write!(f, "no wallet provider available; connect a wallet first")
            }
            Self::UserRejected => write!(f, "request was rejected in the wallet"),
            Self::NetworkMismatch {
                observed,
                expected,
                expected_name,
            } => write!(
                f,
                "wallet is on chain {observed}; switch to {expected_name} (chain {expected})"
            ),
            Self::NetworkSwitchTimeout {
                expected,
                expected_name,
            } => write!(
                f,
                "timed out waiting for the wallet to switch to {expected_name} (chain {expected})"
            ),
            Self::ContractNotDeployed { contract, address } => write!(
                f,
                "no {contract} contract deployed at {address}; check the selected network"
            ),
            Self::ApprovalRejected { symbol } => {
                write!(f, "approval of {symbol} was rejected; approve token {symbol} to continue")
            }
            Self::ApprovalFailed { symbol, reason } => {
                write!(f, "approval of {symbol} failed: {reason}")
            }
            Self::InsufficientBalance {
                symbol,
                have,
                need,
                shortfall,
            } => write!(
                f,
                "insufficient balance: have {have} {symbol} need {need} {symbol} (short {shortfall})"
            ),
            Self::InvalidEntryFee { minimum, given } => {
                write!(f, "entry fee {given} is below the minimum of {minimum}")
            }
            Self::InvalidPlayerCount { min, max, given } => write!(
                f,
                "max players must be between {min} and {max}, got {given}"
            ),
            Self::InvalidAmount(reason) => write!(f, "invalid amount: {reason}"),
            Self::RoundExpired => write!(f, "the round deadline has passed"),
            Self::ChoiceAlreadyMade => {
                write!(f, "a choice has already been made for this round")
            }
            Self::InsufficientGasFunds => {
                write!(f, "not enough native balance to pay for gas")
            }
            Self::NotAPlayer { game_id } => {
                write!(f, "this account is not playing in game {game_id}")
            }
            Self::StakeLocked { active_games } => write!(
                f,
                "stake is locked by {active_games} active game(s); wait until they finish"
            ),
            Self::GameNotFound(id) => write!(f, "game {id} not found"),
            Self::RoundNotFound { game_id, round } => {
                write!(f, "round {round} of game {game_id} not found")
            }
            Self::UnsupportedCurrency(currency) => {
                write!(f, "currency {currency} is not configured for this deployment")
            }
            Self::TransactionFailed(reason) => write!(f, "transaction failed: {reason}"),
            Self::Decode(reason) => write!(f, "could not decode contract data: {reason}"),
            Self::Config(reason) => write!(f, "configuration error: {reason}"),
            Self::Provider(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<AmountError> for ClientError {
    fn from(err: AmountError) -> Self {
        Self::InvalidAmount(err.to_string())
    }
}

/// Generic mapping for wallet failures that have no operation-specific meaning.
impl From<WalletError> for ClientError {
    fn from(err: WalletError) -> Self {
        if err.is_user_rejected() {
            return Self::UserRejected;
        }
        match err {
            WalletError::Unavailable(_) => Self::NoWalletProvider,
            WalletError::Encoding(message) => Self::Decode(message),
            other => {
                let lowered = other.message().to_ascii_lowercase();
                if lowered.contains("insufficient funds") {
                    Self::InsufficientGasFunds
                } else {
                    Self::Provider(other.message().to_string())
                }
            }
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
