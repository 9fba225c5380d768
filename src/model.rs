use crate::{
    amount::TokenAmount,
    error::ClientError,
};
use alloy::primitives::Address;
use std::{
    fmt,
    str::FromStr,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum GameMode {
    QuickPlay,
    Scheduled,
    Private,
}

impl GameMode {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::QuickPlay),
            1 => Some(Self::Scheduled),
            2 => Some(Self::Private),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match normalize(name).as_str() {
            "quickplay" | "quick" => Some(Self::QuickPlay),
            "scheduled" => Some(Self::Scheduled),
            "private" => Some(Self::Private),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Currency {
    Native,
    StableYield,
    StakedAsset,
}

impl Currency {
    pub const ALL: [Currency; 3] = [
        Currency::Native,
        Currency::StableYield,
        Currency::StakedAsset,
    ];

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Native),
            1 => Some(Self::StableYield),
            2 => Some(Self::StakedAsset),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match normalize(name).as_str() {
            "native" | "eth" => Some(Self::Native),
            "stableyield" | "stable" | "usdc" => Some(Self::StableYield),
            "stakedasset" | "staked" => Some(Self::StakedAsset),
            _ => None,
        }
    }

    pub fn is_native(self) -> bool {
        matches!(self, Currency::Native)
    }

    /// Key used for this currency in deployment records.
    pub fn config_key(self) -> &'static str {
        match self {
            Currency::Native => "native",
            Currency::StableYield => "stable_yield",
            Currency::StakedAsset => "staked_asset",
        }
    }

    pub fn default_decimals(self) -> u8 {
        match self {
            Currency::Native => 18,
            Currency::StableYield => 6,
            Currency::StakedAsset => 18,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Currency::Native => "Native",
            Currency::StableYield => "StableYield",
            Currency::StakedAsset => "StakedAsset",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Currency {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
            .ok_or_else(|| ClientError::Config(format!("unknown currency '{s}'")))
    }
}

/// Lifecycle reported by the contract. The client only mirrors it and never infers a
/// transition on its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum GameStatus {
    Waiting,
    Countdown,
    InProgress,
    Completed,
    Cancelled,
}

impl GameStatus {
    pub const ALL: [GameStatus; 5] = [
        GameStatus::Waiting,
        GameStatus::Countdown,
        GameStatus::InProgress,
        GameStatus::Completed,
        GameStatus::Cancelled,
    ];

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Waiting),
            1 => Some(Self::Countdown),
            2 => Some(Self::InProgress),
            3 => Some(Self::Completed),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match normalize(name).as_str() {
            "waiting" => Some(Self::Waiting),
            "countdown" => Some(Self::Countdown),
            "inprogress" | "active" => Some(Self::InProgress),
            "completed" | "finished" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn can_join(self) -> bool {
        matches!(self, GameStatus::Waiting | GameStatus::Countdown)
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameStatus::Waiting => "Waiting",
            GameStatus::Countdown => "Countdown",
            GameStatus::InProgress => "InProgress",
            GameStatus::Completed => "Completed",
            GameStatus::Cancelled => "Cancelled",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Choice {
    Head,
    Tail,
}

impl Choice {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Head),
            1 => Some(Self::Tail),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match normalize(name).as_str() {
            "head" | "heads" => Some(Self::Head),
            "tail" | "tails" => Some(Self::Tail),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Choice::Head => 0,
            Choice::Tail => 1,
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Head => write!(f, "Head"),
            Choice::Tail => write!(f, "Tail"),
        }
    }
}

impl FromStr for Choice {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
            .ok_or_else(|| ClientError::Config(format!("choice must be head or tail, got '{s}'")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameRecord {
    pub game_id: u64,
    pub name: Option<String>,
    pub mode: GameMode,
    pub currency: Currency,
    pub status: GameStatus,
    pub entry_fee: TokenAmount,
    pub total_prize_pool: TokenAmount,
    pub yield_accumulated: TokenAmount,
    pub max_players: u32,
    pub min_players: u32,
    pub current_player_count: u32,
    pub current_round: u32,
    /// Unix seconds, 0 when unset.
    pub start_time: u64,
    /// Unix seconds; only set while `status == Countdown`.
    pub countdown_deadline: Option<u64>,
    pub creator: Address,
    pub winner: Option<Address>,
    pub player_list: Vec<Address>,
    pub can_join: bool,
    pub is_player: bool,
    pub is_creator: bool,
}

impl GameRecord {
    /// Recompute the caller-relative flags. Addresses compare on their bytes, so the
    /// check is insensitive to the hex casing they were decoded from.
    pub fn apply_caller(&mut self, caller: Option<Address>) {
        self.can_join = self.status.can_join();
        match caller {
            Some(caller) => {
                self.is_player = self.player_list.contains(&caller);
                self.is_creator = self.creator == caller;
            }
            None => {
                self.is_player = false;
                self.is_creator = false;
            }
        }
    }

    pub fn seconds_until_countdown_ends(&self, now: u64) -> Option<u64> {
        self.countdown_deadline
            .map(|deadline| deadline.saturating_sub(now))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerInfo {
    pub is_playing: bool,
    pub has_made_choice: bool,
    pub choice: Option<Choice>,
    pub eliminated: bool,
    pub round_eliminated: Option<u32>,
    pub entry_amount: TokenAmount,
}

impl PlayerInfo {
    pub fn has_joined(&self) -> bool {
        self.is_playing || self.eliminated || !self.entry_amount.is_zero()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundInfo {
    pub round: u32,
    pub deadline: u64,
    pub processed: bool,
    pub winning_choice: Option<Choice>,
}

impl RoundInfo {
    pub fn is_open(&self, now: u64) -> bool {
        !self.processed && now < self.deadline
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatorStakeInfo {
    pub staked_amount: TokenAmount,
    pub yield_accumulated: TokenAmount,
    pub timestamp: u64,
    pub active_games_count: u64,
    pub has_staked: bool,
}

impl CreatorStakeInfo {
    /// Unstaking while games are active incurs a penalty, so callers must block it.
    pub fn unstake_gate(&self) -> Result<(), ClientError> {
        if self.active_games_count > 0 {
            return Err(ClientError::StakeLocked {
                active_games: self.active_games_count,
            });
        }
        Ok(())
    }
}

/// One watched game together with the caller's standing in its current round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedGame {
    pub game: GameRecord,
    /// Only while the game is in progress.
    pub round: Option<RoundInfo>,
    /// Only when a caller is known and has joined.
    pub player: Option<PlayerInfo>,
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
