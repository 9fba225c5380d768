//! In-memory wallet and chain fakes for exercising the clients without a node.

use crate::{
    abi::ContractAbi,
    deployment::{
        AddressBook,
        CurrencyRecord,
        DeploymentRecord,
    },
    model::{
        Currency,
        GameStatus,
    },
    reader::Clock,
    wallet::{
        ChainParams,
        Connection,
        ContractCall,
        ContractReader,
        LogEntry,
        NativeCurrency,
        TxReceipt,
        WalletError,
        WalletProvider,
    },
};
use alloy::{
    dyn_abi::DynSolValue,
    json_abi::JsonAbi,
    primitives::{
        Address,
        B256,
        Bytes,
        U256,
        address,
    },
};
use async_trait::async_trait;
use serde_json::{
    Value,
    json,
};
use std::{
    collections::{
        HashMap,
        HashSet,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::sync::broadcast;

pub const GAME_ABI: &str = include_str!("../abi/GameManager.json");
pub const TARGET_CHAIN: u64 = 84532;
pub const OTHER_CHAIN: u64 = 1;
pub const GAME_CONTRACT: Address = address!("0x1000000000000000000000000000000000000001");
pub const STABLE_TOKEN: Address = address!("0x2000000000000000000000000000000000000002");
pub const STAKED_TOKEN: Address = address!("0x3000000000000000000000000000000000000003");
pub const PLAYER: Address = address!("0x00000000000000000000000000000000000000a1");
pub const CREATOR: Address = address!("0x00000000000000000000000000000000000000c1");

pub fn sample_record() -> DeploymentRecord {
    let network = ChainParams {
        chain_id: TARGET_CHAIN,
        chain_name: "Base Sepolia".to_string(),
        native_currency: NativeCurrency {
            name: "Ether".to_string(),
            symbol: "ETH".to_string(),
            decimals: 18,
        },
        rpc_url: "https://sepolia.base.org".to_string(),
        explorer_url: "https://sepolia.basescan.org".to_string(),
    };
    let mut record =
        DeploymentRecord::new(network, GAME_CONTRACT.to_string(), "abi/GameManager.json");
    record.currencies.insert(
        "native".to_string(),
        CurrencyRecord {
            symbol: "ETH".to_string(),
            decimals: 18,
            token: None,
        },
    );
    record.currencies.insert(
        "stable_yield".to_string(),
        CurrencyRecord {
            symbol: "USDC".to_string(),
            decimals: 6,
            token: Some(STABLE_TOKEN.to_string()),
        },
    );
    record.currencies.insert(
        "staked_asset".to_string(),
        CurrencyRecord {
            symbol: "stETH".to_string(),
            decimals: 18,
            token: Some(STAKED_TOKEN.to_string()),
        },
    );
    record
}

pub fn test_book() -> Arc<AddressBook> {
    let abi = ContractAbi::parse(GAME_ABI).unwrap();
    Arc::new(AddressBook::from_record(&sample_record(), abi).unwrap())
}

pub fn player(n: u8) -> Address {
    Address::with_last_byte(n)
}

/// Contract-side view of one game, rendered in either return shape.
#[derive(Clone, Debug)]
pub struct GameFixture {
    pub id: u64,
    pub status: GameStatus,
    pub currency: Currency,
    pub entry_fee: U256,
    pub max_players: u32,
    pub players: Vec<Address>,
    pub creator: Address,
    pub current_round: u32,
}

impl GameFixture {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            status: GameStatus::Waiting,
            currency: Currency::Native,
            entry_fee: U256::from(1_000_000_000_000_000u64),
            max_players: 10,
            players: Vec::new(),
            creator: CREATOR,
            current_round: 0,
        }
    }

    pub fn status(mut self, status: GameStatus) -> Self {
        self.status = status;
        self
    }

    pub fn currency(mut self, currency: Currency, entry_fee: U256) -> Self {
        self.currency = currency;
        self.entry_fee = entry_fee;
        self
    }

    pub fn players(mut self, players: Vec<Address>) -> Self {
        self.players = players;
        self
    }

    pub fn round(mut self, round: u32) -> Self {
        self.current_round = round;
        self
    }

    fn status_code(&self) -> u64 {
        GameStatus::ALL
            .iter()
            .position(|status| *status == self.status)
            .unwrap() as u64
    }

    fn currency_code(&self) -> u64 {
        Currency::ALL
            .iter()
            .position(|currency| *currency == self.currency)
            .unwrap() as u64
    }

    fn prize_pool(&self) -> U256 {
        self.entry_fee * U256::from(self.players.len())
    }

    pub fn tuple(&self) -> Value {
        json!([
            self.id.to_string(),
            self.creator.to_string(),
            0,
            self.currency_code(),
            self.status_code(),
            self.entry_fee.to_string(),
            self.max_players,
            2,
            self.players.len(),
            self.prize_pool().to_string(),
            "0",
            "1700000000",
            Address::ZERO.to_string(),
            format!("Game {}", self.id),
            self.current_round
        ])
    }

    pub fn named(&self) -> Value {
        json!({
            "gameId": self.id.to_string(),
            "creator": self.creator.to_string().to_lowercase(),
            "mode": "QuickPlay",
            "currency": self.currency.to_string(),
            "status": self.status.to_string(),
            "entryFee": self.entry_fee.to_string(),
            "maxPlayers": self.max_players.to_string(),
            "minPlayers": "2",
            "currentPlayers": self.players.len().to_string(),
            "totalPrizePool": self.prize_pool().to_string(),
            "yieldAccumulated": "0",
            "startTime": "1700000000",
            "winner": Address::ZERO.to_string(),
            "currentRound": self.current_round.to_string()
        })
    }

    pub fn player_list(&self) -> Value {
        Value::Array(
            self.players
                .iter()
                .map(|player| Value::String(player.to_string()))
                .collect(),
        )
    }
}

#[derive(Clone, Debug)]
pub enum TxOutcome {
    Confirm,
    ConfirmWithLogs(Vec<LogEntry>),
    /// Confirms, but the receipt only shows up after the delay.
    ConfirmAfter(Duration),
    /// Included but reverted.
    Revert,
    RejectSignature,
    /// Refused at submission, e.g. a revert surfaced during gas estimation.
    SendError(WalletError),
    NeverConfirm,
}

#[derive(Default)]
struct FakeChainState {
    responses: HashMap<String, Result<Value, WalletError>>,
    delays: HashMap<String, Duration>,
    code: HashSet<Address>,
    code_missing: HashMap<Address, u32>,
    native_balances: HashMap<Address, U256>,
    outcomes: HashMap<String, VecDeque<TxOutcome>>,
    receipts: HashMap<B256, Option<TxReceipt>>,
    receipt_delays: HashMap<B256, Duration>,
    calls: Vec<String>,
    sent: Vec<ContractCall>,
    next_tx: u64,
}

/// Contract state shared by every connection a [`FakeWallet`] hands out. Reads are
/// answered by `ContractCall::signature()`; anything unregistered reverts.
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<FakeChainState>,
}

impl FakeChain {
    pub fn respond(&self, signature: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.responses.insert(signature.to_string(), Ok(value));
    }

    pub fn revert(&self, signature: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.responses.insert(
            signature.to_string(),
            Err(WalletError::rpc(3, format!("execution reverted: {message}"))),
        );
    }

    pub fn delay(&self, signature: &str, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        state.delays.insert(signature.to_string(), delay);
    }

    pub fn add_game(&self, game: &GameFixture) {
        self.respond(&format!("getGame({})", game.id), game.tuple());
        self.respond(&format!("getGamePlayers({})", game.id), game.player_list());
    }

    pub fn set_code(&self, address: Address) {
        self.state.lock().unwrap().code.insert(address);
    }

    /// The next `times` code lookups for `address` come back empty.
    pub fn code_missing_for(&self, address: Address, times: u32) {
        self.state
            .lock()
            .unwrap()
            .code_missing
            .insert(address, times);
    }

    pub fn set_native_balance(&self, address: Address, balance: U256) {
        self.state
            .lock()
            .unwrap()
            .native_balances
            .insert(address, balance);
    }

    /// Queues the outcome of the next transaction calling `function`. Unqueued
    /// transactions confirm without logs.
    pub fn on_send(&self, function: &str, outcome: TxOutcome) {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .entry(function.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, function: &str) -> usize {
        let prefix = format!("{function}(");
        self.calls()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    pub fn sent(&self) -> Vec<ContractCall> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn game_created_log(game_id: u64) -> LogEntry {
        let abi = serde_json::from_str::<JsonAbi>(GAME_ABI).unwrap();
        let event = &abi.event("GameCreated").unwrap()[0];
        LogEntry {
            address: GAME_CONTRACT,
            topics: vec![
                event.selector(),
                B256::from(U256::from(game_id).to_be_bytes::<32>()),
                CREATOR.into_word(),
            ],
            data: Bytes::from(
                DynSolValue::Tuple(vec![
                    DynSolValue::Uint(U256::ZERO, 8),
                    DynSolValue::Uint(U256::from(1_000u64), 256),
                    DynSolValue::Uint(U256::from(10u64), 256),
                ])
                .abi_encode_params(),
            ),
        }
    }
}

#[async_trait]
impl ContractReader for FakeChain {
    async fn call(&self, call: &ContractCall) -> Result<Value, WalletError> {
        let signature = call.signature();
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(signature.clone());
            state.delays.get(&signature).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        state.responses.get(&signature).cloned().unwrap_or_else(|| {
            Err(WalletError::rpc(3, format!("execution reverted: no data for {signature}")))
        })
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, WalletError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("code_at({address})"));
        if let Some(remaining) = state.code_missing.get_mut(&address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(Bytes::new());
            }
        }
        if state.code.contains(&address) {
            Ok(Bytes::from(vec![0x60, 0x80, 0x60, 0x40]))
        } else {
            Ok(Bytes::new())
        }
    }

    async fn native_balance(&self, address: Address) -> Result<U256, WalletError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("native_balance({address})"));
        Ok(state
            .native_balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Clone)]
pub struct FakeConnection {
    chain: Arc<FakeChain>,
    account: Address,
    chain_id: u64,
}

#[async_trait]
impl ContractReader for FakeConnection {
    async fn call(&self, call: &ContractCall) -> Result<Value, WalletError> {
        self.chain.call(call).await
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, WalletError> {
        self.chain.code_at(address).await
    }

    async fn native_balance(&self, address: Address) -> Result<U256, WalletError> {
        self.chain.native_balance(address).await
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn account(&self) -> Address {
        self.account
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_transaction(&self, call: &ContractCall) -> Result<B256, WalletError> {
        let mut state = self.chain.state.lock().unwrap();
        state.sent.push(call.clone());
        let outcome = state
            .outcomes
            .get_mut(call.function)
            .and_then(VecDeque::pop_front)
            .unwrap_or(TxOutcome::Confirm);
        state.next_tx += 1;
        let tx_hash = B256::from(U256::from(state.next_tx).to_be_bytes::<32>());
        let receipt = |success: bool, logs: Vec<LogEntry>| TxReceipt {
            tx_hash,
            success,
            block_number: Some(100),
            logs,
        };
        let receipt = match outcome {
            TxOutcome::Confirm => Some(receipt(true, Vec::new())),
            TxOutcome::ConfirmWithLogs(logs) => Some(receipt(true, logs)),
            TxOutcome::ConfirmAfter(delay) => {
                state.receipt_delays.insert(tx_hash, delay);
                Some(receipt(true, Vec::new()))
            }
            TxOutcome::Revert => Some(receipt(false, Vec::new())),
            TxOutcome::NeverConfirm => None,
            TxOutcome::RejectSignature => {
                return Err(WalletError::rpc(4001, "User rejected the request."));
            }
            TxOutcome::SendError(err) => return Err(err),
        };
        state.receipts.insert(tx_hash, receipt);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<TxReceipt, WalletError> {
        let (receipt, delay) = {
            let state = self.chain.state.lock().unwrap();
            (
                state.receipts.get(&tx_hash).cloned(),
                state.receipt_delays.get(&tx_hash).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match receipt {
            Some(Some(receipt)) => Ok(receipt),
            Some(None) => {
                tokio::time::sleep(timeout).await;
                Err(WalletError::Transport(format!(
                    "no receipt for {tx_hash} after {}s",
                    timeout.as_secs()
                )))
            }
            None => Err(WalletError::Transport(format!("unknown transaction {tx_hash}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchBehavior {
    /// Switches and emits a chain-changed notification.
    Accept,
    /// Switches without any notification.
    AcceptSilently,
    Reject,
    /// Answers 4902 until the chain has been added.
    UnknownChain,
    Fail,
    /// Claims success but stays on the old chain.
    NeverSwitch,
}

struct FakeWalletState {
    chain_id: u64,
    behavior: SwitchBehavior,
    known_chains: HashSet<u64>,
    switch_delay: Duration,
    switch_calls: u32,
    add_calls: u32,
    connect_calls: u32,
}

pub struct FakeWallet {
    chain: Arc<FakeChain>,
    account: Address,
    state: Mutex<FakeWalletState>,
    chain_changed: broadcast::Sender<u64>,
}

impl FakeWallet {
    pub fn new(chain_id: u64, behavior: SwitchBehavior) -> Self {
        let (chain_changed, _) = broadcast::channel(8);
        Self {
            chain: Arc::new(FakeChain::default()),
            account: PLAYER,
            state: Mutex::new(FakeWalletState {
                chain_id,
                behavior,
                known_chains: HashSet::from([chain_id]),
                switch_delay: Duration::ZERO,
                switch_calls: 0,
                add_calls: 0,
                connect_calls: 0,
            }),
            chain_changed,
        }
    }

    pub fn with_account(mut self, account: Address) -> Self {
        self.account = account;
        self
    }

    pub fn chain(&self) -> &Arc<FakeChain> {
        &self.chain
    }

    pub fn set_switch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().switch_delay = delay;
    }

    pub fn switch_calls(&self) -> u32 {
        self.state.lock().unwrap().switch_calls
    }

    pub fn add_calls(&self) -> u32 {
        self.state.lock().unwrap().add_calls
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().unwrap().connect_calls
    }
}

#[async_trait]
impl WalletProvider for FakeWallet {
    type Connection = FakeConnection;

    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        Ok(vec![self.account])
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        Ok(self.state.lock().unwrap().chain_id)
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), WalletError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.switch_calls += 1;
            state.switch_delay
        };
        tokio::time::sleep(delay).await;
        let mut state = self.state.lock().unwrap();
        match state.behavior {
            SwitchBehavior::Reject => {
                Err(WalletError::rpc(4001, "User rejected the request."))
            }
            SwitchBehavior::Fail => Err(WalletError::rpc(-32000, "wallet is busy")),
            SwitchBehavior::UnknownChain if !state.known_chains.contains(&chain_id) => Err(
                WalletError::rpc(4902, format!("Unrecognized chain ID {chain_id:#x}")),
            ),
            SwitchBehavior::NeverSwitch => Ok(()),
            SwitchBehavior::AcceptSilently => {
                state.chain_id = chain_id;
                Ok(())
            }
            SwitchBehavior::Accept | SwitchBehavior::UnknownChain => {
                state.chain_id = chain_id;
                let _ = self.chain_changed.send(chain_id);
                Ok(())
            }
        }
    }

    async fn add_chain(&self, params: &ChainParams) -> Result<(), WalletError> {
        let mut state = self.state.lock().unwrap();
        state.add_calls += 1;
        if state.behavior == SwitchBehavior::Reject {
            return Err(WalletError::rpc(4001, "User rejected the request."));
        }
        state.known_chains.insert(params.chain_id);
        Ok(())
    }

    fn subscribe_chain_changed(&self) -> broadcast::Receiver<u64> {
        self.chain_changed.subscribe()
    }

    async fn connect(&self) -> Result<FakeConnection, WalletError> {
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        Ok(FakeConnection {
            chain: Arc::clone(&self.chain),
            account: self.account,
            chain_id: state.chain_id,
        })
    }
}

pub struct FixedClock(AtomicU64);

impl FixedClock {
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
