//! Read side of the game contract.
//!
//! Listing reads the game counter and fetches only the newest window of ids, a bounded
//! number at a time. Records that fail to load are logged and left out; the rest come
//! back newest first.

use crate::{
    deployment::AddressBook,
    decode::{
        decode_address_list,
        decode_game,
        decode_player_info,
        decode_round_info,
        decode_scalar,
        decode_stake_info,
    },
    error::{
        ClientError,
        Result,
    },
    model::{
        CreatorStakeInfo,
        Currency,
        GameRecord,
        GameStatus,
        ObservedGame,
        PlayerInfo,
        RoundInfo,
    },
    wallet::{
        CallArg,
        ContractCall,
        ContractName,
        ContractReader,
        WalletError,
    },
};
use alloy::primitives::Address;
use futures::{
    StreamExt,
    stream,
};
use std::{
    collections::HashMap,
    ops::Range,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{
    debug,
    info,
    warn,
};

#[cfg(test)]
mod tests;

pub const LIST_BATCH_SIZE: u64 = 10;
pub const LIST_BATCHES: u64 = 2;

/// Wall clock in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
    }
}

/// Ids `[counter - batch_size * batches, counter)`, clamped at zero.
pub fn list_window(counter: u64, batch_size: u64, batches: u64) -> Range<u64> {
    let span = batch_size.saturating_mul(batches);
    counter.saturating_sub(span)..counter
}

pub struct GameReadClient<R> {
    reader: R,
    book: Arc<AddressBook>,
    caller: Option<Address>,
    clock: Arc<dyn Clock>,
    batch_size: u64,
    batches: u64,
    currencies: Mutex<HashMap<u64, Currency>>,
}

impl<R: ContractReader> GameReadClient<R> {
    pub fn new(reader: R, book: Arc<AddressBook>) -> Self {
        Self {
            reader,
            book,
            caller: None,
            clock: Arc::new(SystemClock),
            batch_size: LIST_BATCH_SIZE,
            batches: LIST_BATCHES,
            currencies: Mutex::new(HashMap::new()),
        }
    }

    /// Account the `is_player` and `is_creator` flags are computed for.
    pub fn with_caller(mut self, caller: Option<Address>) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_window(mut self, batch_size: u64, batches: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self.batches = batches;
        self
    }

    pub fn caller(&self) -> Option<Address> {
        self.caller
    }

    pub fn book(&self) -> &Arc<AddressBook> {
        &self.book
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub async fn game_counter(&self) -> Result<u64> {
        let value = self.reader.call(&self.game_call("gameCounter")).await?;
        let counter = decode_scalar(&value, "gameCounter")?;
        u64::try_from(counter)
            .map_err(|_| ClientError::Decode(format!("game counter {counter} overflows u64")))
    }

    pub async fn list_games(&self) -> Result<Vec<GameRecord>> {
        let counter = self.game_counter().await?;
        let window = list_window(counter, self.batch_size, self.batches);
        debug!(counter, from = window.start, to = window.end, "listing games");

        let fetched = stream::iter(window)
            .map(|game_id| async move { (game_id, self.get_game(game_id).await) })
            .buffer_unordered(self.batch_size as usize)
            .collect::<Vec<_>>()
            .await;
        let mut games = fetched
            .into_iter()
            .filter_map(|(game_id, result)| match result {
                Ok(game) => Some(game),
                Err(err) => {
                    warn!(game_id, error = %err, "skipping game that failed to load");
                    None
                }
            })
            .collect::<Vec<_>>();
        games.sort_by(|a, b| b.game_id.cmp(&a.game_id));
        info!(counter, listed = games.len(), "games listed");
        Ok(games)
    }

    /// Full record including the player list and caller-relative flags. A game with a
    /// zero creator, or a read that reverts, is reported as not found.
    pub async fn get_game(&self, game_id: u64) -> Result<GameRecord> {
        let call = self.game_call("getGame").arg(CallArg::uint(game_id));
        let value = self
            .reader
            .call(&call)
            .await
            .map_err(|err| revert_as(err, ClientError::GameNotFound(game_id)))?;
        let mut game = decode_game(&value, |currency| self.book.decimals(currency))?;
        if game.creator.is_zero() {
            return Err(ClientError::GameNotFound(game_id));
        }
        self.currencies.lock().await.insert(game_id, game.currency);

        let players = self.player_list(game_id).await?;
        let count = u32::try_from(players.len()).unwrap_or(u32::MAX);
        if count > game.max_players {
            return Err(ClientError::Decode(format!(
                "game {game_id} lists {count} players but allows {}",
                game.max_players
            )));
        }
        if count != game.current_player_count {
            debug!(
                game_id,
                counter = game.current_player_count,
                listed = count,
                "player counter disagrees with player list"
            );
        }
        game.current_player_count = count;
        game.player_list = players;
        game.apply_caller(self.caller);

        if game.status == GameStatus::Countdown {
            game.countdown_deadline = self.countdown_deadline(game_id).await;
        }
        Ok(game)
    }

    pub async fn player_list(&self, game_id: u64) -> Result<Vec<Address>> {
        let call = self.game_call("getGamePlayers").arg(CallArg::uint(game_id));
        let value = self
            .reader
            .call(&call)
            .await
            .map_err(|err| revert_as(err, ClientError::GameNotFound(game_id)))?;
        decode_address_list(&value)
    }

    /// Amounts carry the decimals of the game's currency. An address that never joined
    /// is reported as [`ClientError::NotAPlayer`].
    pub async fn get_player_info(&self, game_id: u64, player: Address) -> Result<PlayerInfo> {
        let currency = self.currency_of(game_id).await?;
        let call = self
            .game_call("getPlayerInfo")
            .arg(CallArg::uint(game_id))
            .arg(CallArg::Address(player));
        let value = self
            .reader
            .call(&call)
            .await
            .map_err(|err| revert_as(err, ClientError::NotAPlayer { game_id }))?;
        let info = decode_player_info(&value, self.book.decimals(currency))?;
        if !info.has_joined() {
            return Err(ClientError::NotAPlayer { game_id });
        }
        Ok(info)
    }

    pub async fn get_round_info(&self, game_id: u64, round: u32) -> Result<RoundInfo> {
        let not_found = ClientError::RoundNotFound { game_id, round };
        let call = self
            .game_call("getRoundInfo")
            .arg(CallArg::uint(game_id))
            .arg(CallArg::uint(round));
        let value = self
            .reader
            .call(&call)
            .await
            .map_err(|err| revert_as(err, not_found.clone()))?;
        let info = decode_round_info(&value, round)?;
        if info.deadline == 0 {
            return Err(not_found);
        }
        Ok(info)
    }

    /// `None` when the address has never staked.
    pub async fn get_creator_stake(&self, creator: Address) -> Result<Option<CreatorStakeInfo>> {
        let currency = self.book.stake_currency();
        let call = self
            .game_call("getCreatorStake")
            .arg(CallArg::Address(creator));
        let value = match self.reader.call(&call).await {
            Ok(value) => value,
            Err(err) if err.is_revert() => {
                debug!(%creator, error = %err, "no creator stake record");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let stake = decode_stake_info(&value, self.book.decimals(currency))?;
        let empty = !stake.has_staked
            && stake.staked_amount.is_zero()
            && stake.active_games_count == 0;
        Ok((!empty).then_some(stake))
    }

    /// One refresh of a watched game: the record, the open round while in progress and
    /// the caller's own standing.
    pub async fn observe_game(&self, game_id: u64) -> Result<ObservedGame> {
        let game = self.get_game(game_id).await?;
        let round = if game.status == GameStatus::InProgress {
            match self.get_round_info(game_id, game.current_round).await {
                Ok(round) => Some(round),
                Err(err) => {
                    warn!(game_id, round = game.current_round, error = %err, "round info unavailable");
                    None
                }
            }
        } else {
            None
        };
        let player = match self.caller {
            Some(caller) if game.is_player => match self.get_player_info(game_id, caller).await {
                Ok(info) => Some(info),
                Err(ClientError::NotAPlayer { .. }) => None,
                Err(err) => return Err(err),
            },
            _ => None,
        };
        Ok(ObservedGame {
            game,
            round,
            player,
        })
    }

    async fn countdown_deadline(&self, game_id: u64) -> Option<u64> {
        let call = self
            .game_call("getCountdownRemaining")
            .arg(CallArg::uint(game_id));
        let remaining = match self.reader.call(&call).await {
            Ok(value) => decode_scalar(&value, "getCountdownRemaining"),
            Err(err) => Err(err.into()),
        };
        match remaining {
            Ok(remaining) => {
                let remaining = u64::try_from(remaining).unwrap_or(u64::MAX);
                Some(self.clock.now().saturating_add(remaining))
            }
            Err(err) => {
                warn!(game_id, error = %err, "countdown remaining unavailable");
                None
            }
        }
    }

    async fn currency_of(&self, game_id: u64) -> Result<Currency> {
        if let Some(currency) = self.currencies.lock().await.get(&game_id) {
            return Ok(*currency);
        }
        let call = self.game_call("getGame").arg(CallArg::uint(game_id));
        let value = self
            .reader
            .call(&call)
            .await
            .map_err(|err| revert_as(err, ClientError::GameNotFound(game_id)))?;
        let game = decode_game(&value, |currency| self.book.decimals(currency))?;
        self.currencies.lock().await.insert(game_id, game.currency);
        Ok(game.currency)
    }

    fn game_call(&self, function: &'static str) -> ContractCall {
        ContractCall::new(ContractName::Game, self.book.game_contract(), function)
    }
}

fn revert_as(err: WalletError, not_found: ClientError) -> ClientError {
    if err.is_revert() {
        not_found
    } else {
        err.into()
    }
}
