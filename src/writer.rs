//! State-changing calls against the game contract.
//!
//! Every call first goes through the [`NetworkGuard`] and uses the fresh connection it
//! returns. Local validation runs before the guard, so invalid input never reaches the
//! wallet.

use crate::{
    amount::TokenAmount,
    decode::parse_u256,
    deployment::AddressBook,
    error::{
        ClientError,
        Result,
    },
    model::{
        Choice,
        CreatorStakeInfo,
        Currency,
        GameStatus,
    },
    network::NetworkGuard,
    reader::GameReadClient,
    scheduler::{
        GameStore,
        RefreshTrigger,
    },
    token::TokenLedgerClient,
    wallet::{
        CallArg,
        Connection,
        ContractCall,
        ContractName,
        TxReceipt,
        WalletError,
        WalletProvider,
    },
};
use alloy::primitives::{
    Address,
    B256,
};
use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{
    debug,
    info,
    warn,
};


const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(u64),
    /// Confirmed, but no creation event could be read from the receipt. The game will
    /// show up on the next list refresh.
    Pending { tx_hash: B256 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Someone else advanced the game first.
    AlreadyStarted,
}

pub struct GameWriteClient<W: WalletProvider> {
    guard: Arc<NetworkGuard<W>>,
    tokens: Arc<TokenLedgerClient>,
    book: Arc<AddressBook>,
    store: GameStore,
    refresh: Option<RefreshTrigger>,
    receipt_timeout: Duration,
    submitted_choices: Mutex<HashSet<(u64, Address, u32)>>,
}

impl<W: WalletProvider> GameWriteClient<W> {
    pub fn new(
        guard: Arc<NetworkGuard<W>>,
        tokens: Arc<TokenLedgerClient>,
        book: Arc<AddressBook>,
        store: GameStore,
    ) -> Self {
        Self {
            guard,
            tokens,
            book,
            store,
            refresh: None,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            submitted_choices: Mutex::new(HashSet::new()),
        }
    }

    /// List refresh requested after joins, creations and start attempts.
    pub fn with_refresh(mut self, refresh: RefreshTrigger) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn with_receipt_timeout(mut self, receipt_timeout: Duration) -> Self {
        self.receipt_timeout = receipt_timeout;
        self
    }

    pub async fn create_game(
        &self,
        currency: Currency,
        entry_fee: &str,
        max_players: u32,
        name: Option<&str>,
    ) -> Result<CreateOutcome> {
        let fee = self.validate_creation(currency, entry_fee, max_players)?;
        let conn = self.guard.ensure_network().await?;
        let game_contract = self.book.game_contract();

        if !currency.is_native() {
            self.tokens
                .ensure_approval(&conn, currency, game_contract)
                .await?;
            self.check_balance(&conn, currency, &fee).await?;
        }

        let call = self
            .game_call(entry_point(currency))
            .arg(CallArg::Uint(fee.raw()))
            .arg(CallArg::uint(max_players))
            .arg(CallArg::Text(name.unwrap_or_default().to_string()));
        let call = if currency.is_native() {
            call.value(fee.raw())
        } else {
            call
        };
        let receipt = self.submit(&conn, &call, classify_failure).await?;
        self.request_refresh();

        match self.created_game_id(&receipt) {
            Some(game_id) => {
                info!(game_id, %currency, fee = %fee, "game created");
                Ok(CreateOutcome::Created(game_id))
            }
            None => {
                warn!(tx_hash = %receipt.tx_hash, "game created but no creation event decoded");
                Ok(CreateOutcome::Pending {
                    tx_hash: receipt.tx_hash,
                })
            }
        }
    }

    /// Joins with `entry_fee`. Token games only approve when the current allowance does
    /// not already cover the fee.
    pub async fn join_game(&self, game_id: u64, entry_fee: &TokenAmount) -> Result<()> {
        let conn = Arc::new(self.guard.ensure_network().await?);
        let game = match self.store.game(game_id) {
            Some(game) => game,
            None => {
                debug!(game_id, "game not in local state; reading it");
                self.reader(&conn).get_game(game_id).await?
            }
        };
        let currency = game.currency;
        let decimals = self.book.decimals(currency);
        if entry_fee.decimals() != decimals {
            return Err(ClientError::InvalidAmount(format!(
                "{currency} amounts use {decimals} decimals, got {}",
                entry_fee.decimals()
            )));
        }
        if *entry_fee != game.entry_fee {
            return Err(ClientError::InvalidAmount(format!(
                "game {game_id} requires an entry fee of {}, got {entry_fee}",
                game.entry_fee
            )));
        }
        let game_contract = self.book.game_contract();
        self.tokens
            .ensure_allowance(conn.as_ref(), currency, game_contract, entry_fee)
            .await?;

        let call = self.game_call("joinGame").arg(CallArg::uint(game_id));
        let call = if currency.is_native() {
            call.value(entry_fee.raw())
        } else {
            call
        };
        self.submit(conn.as_ref(), &call, classify_failure).await?;
        info!(game_id, %currency, fee = %entry_fee, "joined game");
        self.request_refresh();
        Ok(())
    }

    /// Submits a choice for the game's current round. A second choice for the same
    /// round is refused locally without a transaction.
    pub async fn make_choice(&self, game_id: u64, choice: Choice) -> Result<()> {
        let conn = Arc::new(self.guard.ensure_network().await?);
        let account = conn.account();
        let reader = self.reader(&conn);
        let round = reader.get_game(game_id).await?.current_round;
        let key = (game_id, account, round);

        if self.submitted_choices.lock().await.contains(&key) {
            debug!(game_id, round, "choice already submitted from this client");
            return Err(ClientError::ChoiceAlreadyMade);
        }
        match reader.get_player_info(game_id, account).await {
            Ok(info) if info.has_made_choice => {
                self.submitted_choices.lock().await.insert(key);
                return Err(ClientError::ChoiceAlreadyMade);
            }
            Ok(_) => {}
            Err(err @ ClientError::NotAPlayer { .. }) => return Err(err),
            Err(err) => warn!(game_id, error = %err, "player info unavailable; submitting anyway"),
        }

        let call = self
            .game_call("makeChoice")
            .arg(CallArg::uint(game_id))
            .arg(CallArg::uint(choice.code()));
        self.submit(conn.as_ref(), &call, classify_choice_failure)
            .await?;
        self.submitted_choices.lock().await.insert(key);
        info!(game_id, round, %choice, "choice submitted");
        Ok(())
    }

    /// Advances a game whose countdown has elapsed. Losing the race to another caller is
    /// reported as [`StartOutcome::AlreadyStarted`]; a list refresh follows either way.
    pub async fn start_game_after_countdown(&self, game_id: u64) -> Result<StartOutcome> {
        let result = self.try_start(game_id).await;
        self.request_refresh();
        result
    }

    async fn try_start(&self, game_id: u64) -> Result<StartOutcome> {
        let conn = Arc::new(self.guard.ensure_network().await?);
        let call = self
            .game_call("startGameAfterCountdown")
            .arg(CallArg::uint(game_id));
        let err = match self.submit(conn.as_ref(), &call, classify_failure).await {
            Ok(_) => {
                info!(game_id, "game started");
                return Ok(StartOutcome::Started);
            }
            Err(err) => err,
        };
        let ClientError::TransactionFailed(reason) = &err else {
            return Err(err);
        };
        let lowered = reason.to_ascii_lowercase();
        if lowered.contains("already started") || lowered.contains("not in countdown") {
            info!(game_id, "game was already started");
            return Ok(StartOutcome::AlreadyStarted);
        }
        match self.reader(&conn).get_game(game_id).await {
            Ok(game) if matches!(game.status, GameStatus::InProgress | GameStatus::Completed) => {
                info!(game_id, status = %game.status, "game was already started");
                Ok(StartOutcome::AlreadyStarted)
            }
            _ => Err(err),
        }
    }

    /// Stakes `amount` of the deployment's stake currency as creator collateral.
    pub async fn stake_as_creator(&self, amount: &str) -> Result<()> {
        let currency = self.book.stake_currency();
        let amount = TokenAmount::parse(amount, self.book.decimals(currency))?;
        if amount.is_zero() {
            return Err(ClientError::InvalidAmount(
                "stake amount must be positive".to_string(),
            ));
        }
        let conn = self.guard.ensure_network().await?;
        let game_contract = self.book.game_contract();
        if !currency.is_native() {
            self.tokens
                .ensure_approval(&conn, currency, game_contract)
                .await?;
            self.check_balance(&conn, currency, &amount).await?;
        }
        let call = self
            .game_call("stakeAsCreator")
            .arg(CallArg::Uint(amount.raw()));
        let call = if currency.is_native() {
            call.value(amount.raw())
        } else {
            call
        };
        self.submit(&conn, &call, classify_failure).await?;
        info!(%amount, symbol = %self.book.symbol(currency), "creator stake added");
        Ok(())
    }

    /// Submits the unstake as is. Callers gate it on
    /// [`CreatorStakeInfo::unstake_gate`] first.
    pub async fn unstake_creator(&self) -> Result<()> {
        let conn = self.guard.ensure_network().await?;
        let call = self.game_call("unstakeCreator");
        self.submit(&conn, &call, classify_failure).await?;
        info!("creator stake withdrawn");
        Ok(())
    }

    pub async fn get_creator_stake(&self, creator: Address) -> Result<Option<CreatorStakeInfo>> {
        let conn = Arc::new(self.guard.ensure_network().await?);
        self.reader(&conn).get_creator_stake(creator).await
    }

    fn validate_creation(
        &self,
        currency: Currency,
        entry_fee: &str,
        max_players: u32,
    ) -> Result<TokenAmount> {
        self.book.currency(currency)?;
        let limits = self.book.limits();
        let decimals = self.book.decimals(currency);
        let fee = TokenAmount::parse(entry_fee, decimals)?;
        let minimum = TokenAmount::parse(&limits.min_entry_fee, decimals)?;
        if fee < minimum {
            return Err(ClientError::InvalidEntryFee {
                minimum: limits.min_entry_fee.clone(),
                given: entry_fee.trim().to_string(),
            });
        }
        if !(limits.min_players..=limits.max_players).contains(&max_players) {
            return Err(ClientError::InvalidPlayerCount {
                min: limits.min_players,
                max: limits.max_players,
                given: max_players,
            });
        }
        Ok(fee)
    }

    async fn check_balance<C: Connection + ?Sized>(
        &self,
        conn: &C,
        currency: Currency,
        needed: &TokenAmount,
    ) -> Result<()> {
        let balance = self
            .tokens
            .get_balance(conn, conn.account(), currency)
            .await?;
        if balance >= *needed {
            return Ok(());
        }
        let shortfall = needed.checked_sub(&balance).unwrap_or(*needed);
        Err(ClientError::InsufficientBalance {
            symbol: self.book.symbol(currency),
            have: balance.to_string(),
            need: needed.to_string(),
            shortfall: shortfall.to_string(),
        })
    }

    async fn submit<C: Connection + ?Sized>(
        &self,
        conn: &C,
        call: &ContractCall,
        classify: fn(WalletError) -> ClientError,
    ) -> Result<TxReceipt> {
        info!(call = %call.signature(), value = %call.value, "submitting transaction");
        let tx_hash = conn.send_transaction(call).await.map_err(classify)?;
        debug!(%tx_hash, "waiting for confirmation");
        let receipt = conn
            .wait_for_receipt(tx_hash, self.receipt_timeout)
            .await
            .map_err(|err| {
                ClientError::TransactionFailed(format!(
                    "{} was not confirmed: {err}",
                    call.function
                ))
            })?;
        if !receipt.success {
            return Err(ClientError::TransactionFailed(format!(
                "{} reverted in {tx_hash}",
                call.function
            )));
        }
        Ok(receipt)
    }

    fn created_game_id(&self, receipt: &TxReceipt) -> Option<u64> {
        let abi = &self.book.abis().game;
        receipt
            .logs
            .iter()
            .filter(|log| log.address == self.book.game_contract())
            .filter_map(|log| abi.decode_event("GameCreated", log))
            .find_map(|event| {
                let id = event.get("gameId").or_else(|| event.get("0"))?;
                parse_u256(id).and_then(|id| u64::try_from(id).ok())
            })
    }

    fn reader(&self, conn: &Arc<W::Connection>) -> GameReadClient<Arc<W::Connection>> {
        GameReadClient::new(Arc::clone(conn), Arc::clone(&self.book))
            .with_caller(Some(conn.account()))
    }

    fn game_call(&self, function: &'static str) -> ContractCall {
        ContractCall::new(ContractName::Game, self.book.game_contract(), function)
    }

    fn request_refresh(&self) {
        if let Some(refresh) = &self.refresh {
            refresh.refresh();
        }
    }
}

fn entry_point(currency: Currency) -> &'static str {
    match currency {
        Currency::Native => "createGameNative",
        Currency::StableYield => "createGameStable",
        Currency::StakedAsset => "createGameStaked",
    }
}

fn classify_failure(err: WalletError) -> ClientError {
    if err.is_user_rejected() {
        return ClientError::UserRejected;
    }
    if err.is_revert() {
        return ClientError::TransactionFailed(err.message().to_string());
    }
    err.into()
}

fn classify_choice_failure(err: WalletError) -> ClientError {
    if err.is_user_rejected() {
        return ClientError::UserRejected;
    }
    let message = err.message().to_ascii_lowercase();
    if message.contains("expired") || message.contains("deadline") {
        ClientError::RoundExpired
    } else if message.contains("already")
        && (message.contains("choice") || message.contains("chose"))
    {
        ClientError::ChoiceAlreadyMade
    } else {
        classify_failure(err)
    }
}
