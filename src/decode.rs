//! Typed decoders for contract return values.
//!
//! The same call can come back as a positional tuple (`["17", "0x..", 0, ...]`) or as
//! an object keyed by output name (`{"gameId": "17", ...}`) depending on how the ABI
//! names its outputs. Every field below is resolved by name first and by position
//! second, using the per-call mapping tables in [`game_fields`], [`player_fields`],
//! [`round_fields`] and [`stake_fields`].

use crate::{
    amount::TokenAmount,
    error::ClientError,
    model::{
        Choice,
        CreatorStakeInfo,
        Currency,
        GameMode,
        GameRecord,
        GameStatus,
        PlayerInfo,
        RoundInfo,
    },
};
use alloy::primitives::{
    Address,
    U256,
};
use itertools::Itertools;
use serde_json::Value;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub index: usize,
}

impl Field {
    pub const fn new(name: &'static str, index: usize) -> Self {
        Self { name, index }
    }
}

/// `getGame(gameId)`
///
/// | field | name | index |
/// |---|---|---|
/// | game id | `gameId` | 0 |
/// | creator | `creator` | 1 |
/// | mode | `mode` | 2 |
/// | currency | `currency` | 3 |
/// | status | `status` | 4 |
/// | entry fee | `entryFee` | 5 |
/// | max players | `maxPlayers` | 6 |
/// | min players | `minPlayers` | 7 |
/// | current players | `currentPlayers` | 8 |
/// | prize pool | `totalPrizePool` | 9 |
/// | yield | `yieldAccumulated` | 10 |
/// | start time | `startTime` | 11 |
/// | winner | `winner` | 12 |
/// | name | `name` | 13 (optional) |
/// | current round | `currentRound` | 14 (optional) |
pub mod game_fields {
    use super::Field;

    pub const GAME_ID: Field = Field::new("gameId", 0);
    pub const CREATOR: Field = Field::new("creator", 1);
    pub const MODE: Field = Field::new("mode", 2);
    pub const CURRENCY: Field = Field::new("currency", 3);
    pub const STATUS: Field = Field::new("status", 4);
    pub const ENTRY_FEE: Field = Field::new("entryFee", 5);
    pub const MAX_PLAYERS: Field = Field::new("maxPlayers", 6);
    pub const MIN_PLAYERS: Field = Field::new("minPlayers", 7);
    pub const CURRENT_PLAYERS: Field = Field::new("currentPlayers", 8);
    pub const TOTAL_PRIZE_POOL: Field = Field::new("totalPrizePool", 9);
    pub const YIELD_ACCUMULATED: Field = Field::new("yieldAccumulated", 10);
    pub const START_TIME: Field = Field::new("startTime", 11);
    pub const WINNER: Field = Field::new("winner", 12);
    pub const NAME: Field = Field::new("name", 13);
    pub const CURRENT_ROUND: Field = Field::new("currentRound", 14);
}

/// `getPlayerInfo(gameId, player)`
///
/// | field | name | index |
/// |---|---|---|
/// | playing | `isPlaying` | 0 |
/// | chose | `hasMadeChoice` | 1 |
/// | choice | `choice` | 2 |
/// | eliminated | `eliminated` | 3 |
/// | round eliminated | `roundEliminated` | 4 |
/// | entry amount | `entryAmount` | 5 |
pub mod player_fields {
    use super::Field;

    pub const IS_PLAYING: Field = Field::new("isPlaying", 0);
    pub const HAS_MADE_CHOICE: Field = Field::new("hasMadeChoice", 1);
    pub const CHOICE: Field = Field::new("choice", 2);
    pub const ELIMINATED: Field = Field::new("eliminated", 3);
    pub const ROUND_ELIMINATED: Field = Field::new("roundEliminated", 4);
    pub const ENTRY_AMOUNT: Field = Field::new("entryAmount", 5);
}

/// `getRoundInfo(gameId, round)`
///
/// | field | name | index |
/// |---|---|---|
/// | deadline | `deadline` | 0 |
/// | processed | `processed` | 1 |
/// | winning choice | `winningChoice` | 2 |
pub mod round_fields {
    use super::Field;

    pub const DEADLINE: Field = Field::new("deadline", 0);
    pub const PROCESSED: Field = Field::new("processed", 1);
    pub const WINNING_CHOICE: Field = Field::new("winningChoice", 2);
}

/// `getCreatorStake(creator)`
///
/// | field | name | index |
/// |---|---|---|
/// | staked | `stakedAmount` | 0 |
/// | yield | `yieldAccumulated` | 1 |
/// | since | `timestamp` | 2 |
/// | active games | `activeGamesCount` | 3 |
/// | staked flag | `hasStaked` | 4 |
pub mod stake_fields {
    use super::Field;

    pub const STAKED_AMOUNT: Field = Field::new("stakedAmount", 0);
    pub const YIELD_ACCUMULATED: Field = Field::new("yieldAccumulated", 1);
    pub const TIMESTAMP: Field = Field::new("timestamp", 2);
    pub const ACTIVE_GAMES_COUNT: Field = Field::new("activeGamesCount", 3);
    pub const HAS_STAKED: Field = Field::new("hasStaked", 4);
}

/// One contract return value viewed through the name-then-index resolution.
#[derive(Clone, Copy, Debug)]
pub struct RawRecord<'a> {
    value: &'a Value,
    shape: &'static str,
}

impl<'a> RawRecord<'a> {
    pub fn new(value: &'a Value, shape: &'static str) -> Self {
        // a struct returned as the only output sometimes arrives wrapped once more
        let value = match value {
            Value::Array(items) if items.len() == 1 && is_composite(&items[0]) => {
                &items[0]
            }
            other => other,
        };
        Self { value, shape }
    }

    pub fn get(&self, field: Field) -> Option<&'a Value> {
        match self.value {
            Value::Object(map) => map
                .get(field.name)
                .or_else(|| map.get(&field.index.to_string())),
            Value::Array(items) => items.get(field.index),
            _ => None,
        }
        .filter(|value| !value.is_null())
    }

    fn required(&self, field: Field) -> Result<&'a Value, ClientError> {
        self.get(field).ok_or_else(|| {
            ClientError::Decode(format!(
                "{} is missing `{}` (position {})",
                self.shape, field.name, field.index
            ))
        })
    }

    fn invalid(&self, field: Field, value: &Value) -> ClientError {
        ClientError::Decode(format!(
            "{} has an unreadable `{}`: {value}",
            self.shape, field.name
        ))
    }

    pub fn u256(&self, field: Field) -> Result<U256, ClientError> {
        let value = self.required(field)?;
        parse_u256(value).ok_or_else(|| self.invalid(field, value))
    }

    pub fn u64(&self, field: Field) -> Result<u64, ClientError> {
        let value = self.required(field)?;
        parse_u256(value)
            .and_then(|number| u64::try_from(number).ok())
            .ok_or_else(|| self.invalid(field, value))
    }

    pub fn u32(&self, field: Field) -> Result<u32, ClientError> {
        let value = self.required(field)?;
        parse_u256(value)
            .and_then(|number| u32::try_from(number).ok())
            .ok_or_else(|| self.invalid(field, value))
    }

    pub fn optional_u32(&self, field: Field) -> Result<Option<u32>, ClientError> {
        match self.get(field) {
            None => Ok(None),
            Some(_) => self.u32(field).map(Some),
        }
    }

    pub fn bool(&self, field: Field) -> Result<bool, ClientError> {
        let value = self.required(field)?;
        parse_bool(value).ok_or_else(|| self.invalid(field, value))
    }

    pub fn address(&self, field: Field) -> Result<Address, ClientError> {
        let value = self.required(field)?;
        parse_address(value).ok_or_else(|| self.invalid(field, value))
    }

    pub fn optional_text(&self, field: Field) -> Option<String> {
        self.get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }

    /// Enums arrive either as their numeric code or as their variant name.
    pub fn enumeration<T>(
        &self,
        field: Field,
        from_code: impl Fn(u64) -> Option<T>,
        from_name: impl Fn(&str) -> Option<T>,
    ) -> Result<T, ClientError> {
        let value = self.required(field)?;
        let by_code = parse_u256(value)
            .and_then(|code| u64::try_from(code).ok())
            .and_then(&from_code);
        by_code
            .or_else(|| value.as_str().and_then(&from_name))
            .ok_or_else(|| self.invalid(field, value))
    }
}

fn is_composite(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::Object(_))
}

/// Accepts JSON numbers, decimal strings, `0x` hex strings and `{"hex": ..}` wrappers.
pub fn parse_u256(value: &Value) -> Option<U256> {
    match value {
        Value::Number(number) => number.as_u64().map(U256::from),
        Value::String(text) => {
            let text = text.trim();
            match text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
            {
                Some(hex) if hex.is_empty() => Some(U256::ZERO),
                Some(hex) => U256::from_str_radix(hex, 16).ok(),
                None => U256::from_str_radix(text, 10).ok(),
            }
        }
        Value::Object(map) => map
            .get("hex")
            .or_else(|| map.get("_hex"))
            .and_then(parse_u256),
        Value::Bool(_) | Value::Array(_) | Value::Null => None,
    }
}

pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Hex casing is ignored; checksums are not enforced on data the contract returned.
pub fn parse_address(value: &Value) -> Option<Address> {
    let text = value.as_str()?.trim().to_ascii_lowercase();
    Address::from_str(&text).ok()
}

/// Scalar returns (`gameCounter()`, `balanceOf(..)`) unwrapped from any single-slot
/// array or object they may be packed in.
pub fn decode_scalar(value: &Value, shape: &'static str) -> Result<U256, ClientError> {
    let inner = match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        Value::Object(map) if map.len() == 1 => map.values().next().unwrap_or(value),
        other => other,
    };
    parse_u256(inner)
        .ok_or_else(|| ClientError::Decode(format!("{shape} is not a number: {value}")))
}

/// `getGamePlayers(gameId)`: addresses in join order, duplicates removed.
pub fn decode_address_list(value: &Value) -> Result<Vec<Address>, ClientError> {
    let items = match value {
        Value::Array(items) => match items.as_slice() {
            [Value::Array(inner)] => inner,
            _ => items,
        },
        Value::Object(map) if map.len() == 1 => match map.values().next() {
            Some(Value::Array(inner)) => inner,
            _ => {
                return Err(ClientError::Decode(format!(
                    "player list is not an array: {value}"
                )));
            }
        },
        _ => {
            return Err(ClientError::Decode(format!(
                "player list is not an array: {value}"
            )));
        }
    };
    let parsed = items.iter().map(|item| {
        parse_address(item).ok_or_else(|| {
            ClientError::Decode(format!("player list holds a non-address: {item}"))
        })
    });
    itertools::process_results(parsed, |addresses| addresses.unique().collect())
}

/// Decodes the contract's game record. Player list and caller-relative flags are left
/// for the reader to fill; `current_player_count` holds the contract's own counter.
pub fn decode_game(
    value: &Value,
    decimals_for: impl Fn(Currency) -> u8,
) -> Result<GameRecord, ClientError> {
    use game_fields::*;

    let raw = RawRecord::new(value, "game");
    let currency = raw.enumeration(CURRENCY, Currency::from_code, Currency::from_name)?;
    let status = raw.enumeration(STATUS, GameStatus::from_code, GameStatus::from_name)?;
    let decimals = decimals_for(currency);
    let winner = raw
        .get(WINNER)
        .and_then(parse_address)
        .filter(|winner| !winner.is_zero() && status == GameStatus::Completed);

    Ok(GameRecord {
        game_id: raw.u64(GAME_ID)?,
        name: raw.optional_text(NAME),
        mode: raw.enumeration(MODE, GameMode::from_code, GameMode::from_name)?,
        currency,
        status,
        entry_fee: TokenAmount::from_raw(raw.u256(ENTRY_FEE)?, decimals),
        total_prize_pool: TokenAmount::from_raw(raw.u256(TOTAL_PRIZE_POOL)?, decimals),
        yield_accumulated: TokenAmount::from_raw(raw.u256(YIELD_ACCUMULATED)?, decimals),
        max_players: raw.u32(MAX_PLAYERS)?,
        min_players: raw.u32(MIN_PLAYERS)?,
        current_player_count: raw.u32(CURRENT_PLAYERS)?,
        current_round: raw.optional_u32(CURRENT_ROUND)?.unwrap_or(0),
        start_time: raw.u64(START_TIME)?,
        countdown_deadline: None,
        creator: raw.address(CREATOR)?,
        winner,
        player_list: Vec::new(),
        can_join: status.can_join(),
        is_player: false,
        is_creator: false,
    })
}

pub fn decode_player_info(value: &Value, decimals: u8) -> Result<PlayerInfo, ClientError> {
    use player_fields::*;

    let raw = RawRecord::new(value, "player info");
    let has_made_choice = raw.bool(HAS_MADE_CHOICE)?;
    let eliminated = raw.bool(ELIMINATED)?;
    let choice = if has_made_choice {
        Some(raw.enumeration(CHOICE, Choice::from_code, Choice::from_name)?)
    } else {
        None
    };
    let round_eliminated = if eliminated {
        raw.optional_u32(ROUND_ELIMINATED)?
    } else {
        None
    };
    Ok(PlayerInfo {
        is_playing: raw.bool(IS_PLAYING)?,
        has_made_choice,
        choice,
        eliminated,
        round_eliminated,
        entry_amount: TokenAmount::from_raw(raw.u256(ENTRY_AMOUNT)?, decimals),
    })
}

pub fn decode_round_info(value: &Value, round: u32) -> Result<RoundInfo, ClientError> {
    use round_fields::*;

    let raw = RawRecord::new(value, "round info");
    let processed = raw.bool(PROCESSED)?;
    let winning_choice = if processed {
        Some(raw.enumeration(WINNING_CHOICE, Choice::from_code, Choice::from_name)?)
    } else {
        None
    };
    Ok(RoundInfo {
        round,
        deadline: raw.u64(DEADLINE)?,
        processed,
        winning_choice,
    })
}

pub fn decode_stake_info(
    value: &Value,
    decimals: u8,
) -> Result<CreatorStakeInfo, ClientError> {
    use stake_fields::*;

    let raw = RawRecord::new(value, "creator stake");
    Ok(CreatorStakeInfo {
        staked_amount: TokenAmount::from_raw(raw.u256(STAKED_AMOUNT)?, decimals),
        yield_accumulated: TokenAmount::from_raw(raw.u256(YIELD_ACCUMULATED)?, decimals),
        timestamp: raw.u64(TIMESTAMP)?,
        active_games_count: raw.u64(ACTIVE_GAMES_COUNT)?,
        has_staked: raw.bool(HAS_STAKED)?,
    })
}
