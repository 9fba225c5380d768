use crate::{
    abi::{
        AbiSet,
        ContractAbi,
    },
    error::ClientError,
    model::Currency,
    wallet::ChainParams,
};
use alloy::primitives::Address;
use chrono::Utc;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use serde::{
    Deserialize,
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
    time::Duration,
};
use tracing::{
    info,
    warn,
};
use url::Url;

pub const DEPLOYMENTS_ROOT: &str = ".deployments";
const DEPLOYMENTS_FILE: &str = "deployments.json";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentEnv {
    Dev,
    Test,
    Local,
}

impl DeploymentEnv {
    pub fn dir_name(self) -> &'static str {
        match self {
            DeploymentEnv::Dev => "dev",
            DeploymentEnv::Test => "test",
            DeploymentEnv::Local => "local",
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentEnv::Dev => "Devnet",
            DeploymentEnv::Test => "Testnet",
            DeploymentEnv::Local => "Local",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyRecord {
    pub symbol: String,
    pub decimals: u8,
    /// Token contract; absent for the chain's native currency.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLimits {
    /// Human units of whichever currency the game is created in.
    pub min_entry_fee: String,
    pub min_players: u32,
    pub max_players: u32,
}

impl Default for GameLimits {
    fn default() -> Self {
        Self {
            min_entry_fee: "0.001".to_string(),
            min_players: 2,
            max_players: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPeriods {
    pub list_secs: u64,
    pub watch_secs: u64,
}

impl RefreshPeriods {
    pub fn list(&self) -> Duration {
        Duration::from_secs(self.list_secs.max(1))
    }

    pub fn watch(&self) -> Duration {
        Duration::from_secs(self.watch_secs.max(1))
    }
}

impl Default for RefreshPeriods {
    fn default() -> Self {
        Self {
            list_secs: 8,
            watch_secs: 4,
        }
    }
}

fn default_stake_currency() -> String {
    Currency::StableYield.config_key().to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployed_at: String,
    pub network: ChainParams,
    pub game_contract: String,
    pub game_abi_path: String,
    #[serde(default)]
    pub abi_hash: Option<String>,
    #[serde(default)]
    pub deployment_block: Option<u64>,
    /// Keyed by [`Currency::config_key`].
    #[serde(default)]
    pub currencies: BTreeMap<String, CurrencyRecord>,
    #[serde(default = "default_stake_currency")]
    pub stake_currency: String,
    #[serde(default)]
    pub limits: GameLimits,
    #[serde(default)]
    pub refresh: RefreshPeriods,
}

impl DeploymentRecord {
    pub fn new(
        network: ChainParams,
        game_contract: impl Into<String>,
        game_abi_path: impl Into<String>,
    ) -> Self {
        Self {
            deployed_at: Utc::now().to_rfc3339(),
            network,
            game_contract: game_contract.into(),
            game_abi_path: game_abi_path.into(),
            abi_hash: None,
            deployment_block: None,
            currencies: BTreeMap::new(),
            stake_currency: default_stake_currency(),
            limits: GameLimits::default(),
            refresh: RefreshPeriods::default(),
        }
    }

    /// Records without a hash predate hash tracking and are accepted as is.
    pub fn is_compatible_with_hash(&self, hash: &str) -> bool {
        self.abi_hash
            .as_deref()
            .is_none_or(|recorded| recorded.eq_ignore_ascii_case(hash))
    }
}

#[derive(Debug)]
pub struct DeploymentStore {
    path: PathBuf,
}

impl DeploymentStore {
    pub fn new(env: DeploymentEnv) -> Result<Self> {
        Self::at(DEPLOYMENTS_ROOT, env)
    }

    pub fn at(root: impl AsRef<Path>, env: DeploymentEnv) -> Result<Self> {
        let path = ensure_store(root.as_ref(), env)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<DeploymentRecord>> {
        read_record(&self.path)
    }

    pub fn save(&self, record: &DeploymentRecord) -> Result<()> {
        write_record(&self.path, record)
    }
}

pub fn compute_abi_hash(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .wrap_err_with(|| format!("Failed to read ABI for hashing: {}", path.display()))?;
    Ok(hash_bytes(&bytes))
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn ensure_store(root: &Path, env: DeploymentEnv) -> Result<PathBuf> {
    let env_dir = root.join(env.dir_name());
    if !env_dir.exists() {
        fs::create_dir_all(&env_dir).wrap_err_with(|| {
            format!("Failed to create {} directory", env_dir.display())
        })?;
    }

    let file_path = env_dir.join(DEPLOYMENTS_FILE);
    if !file_path.exists() {
        fs::write(&file_path, b"").wrap_err_with(|| {
            format!(
                "Failed to create deployment record file for {} at {:?}",
                env, file_path
            )
        })?;
    }

    Ok(file_path)
}

fn read_record(path: impl AsRef<Path>) -> Result<Option<DeploymentRecord>> {
    let data = fs::read(path.as_ref()).wrap_err("Failed to read deployment records")?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    if let Ok(record) = serde_json::from_slice::<DeploymentRecord>(&data) {
        return Ok(Some(record));
    }
    if let Ok(mut records) = serde_json::from_slice::<Vec<DeploymentRecord>>(&data) {
        return Ok(records.pop());
    }
    Err(eyre!(
        "Failed to parse deployment record JSON; expected a single deployment object"
    ))
}

fn write_record(path: impl AsRef<Path>, record: &DeploymentRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)
        .wrap_err("Failed to serialize deployment record")?;
    fs::write(path.as_ref(), json).wrap_err("Failed to write deployment record")?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrencyConfig {
    pub currency: Currency,
    pub symbol: String,
    pub decimals: u8,
    pub token: Option<Address>,
}

/// Resolved view of one deployment: where every contract lives, how each currency is
/// denominated and which chain the wallet has to be on.
#[derive(Clone, Debug)]
pub struct AddressBook {
    chain: ChainParams,
    game_contract: Address,
    currencies: BTreeMap<Currency, CurrencyConfig>,
    stake_currency: Currency,
    limits: GameLimits,
    refresh: RefreshPeriods,
    abis: AbiSet,
}

impl AddressBook {
    pub fn from_record(
        record: &DeploymentRecord,
        game_abi: ContractAbi,
    ) -> Result<Self, ClientError> {
        let game_contract = parse_config_address("game contract", &record.game_contract)?;
        let mut currencies = BTreeMap::new();
        for (key, entry) in &record.currencies {
            let currency = Currency::from_name(key)
                .ok_or_else(|| ClientError::Config(format!("unknown currency key '{key}'")))?;
            let token = entry
                .token
                .as_deref()
                .map(|token| parse_config_address(&entry.symbol, token))
                .transpose()?;
            if token.is_none() && !currency.is_native() {
                return Err(ClientError::Config(format!(
                    "currency '{key}' has no token address"
                )));
            }
            currencies.insert(
                currency,
                CurrencyConfig {
                    currency,
                    symbol: entry.symbol.clone(),
                    decimals: entry.decimals,
                    token,
                },
            );
        }
        currencies
            .entry(Currency::Native)
            .or_insert_with(|| CurrencyConfig {
                currency: Currency::Native,
                symbol: record.network.native_currency.symbol.clone(),
                decimals: record.network.native_currency.decimals,
                token: None,
            });
        let stake_currency = Currency::from_name(&record.stake_currency).ok_or_else(|| {
            ClientError::Config(format!(
                "unknown stake currency '{}'",
                record.stake_currency
            ))
        })?;
        parse_config_url("RPC URL", &record.network.rpc_url)?;
        if !record.network.explorer_url.is_empty() {
            parse_config_url("explorer URL", &record.network.explorer_url)?;
        }
        if record.limits.min_players > record.limits.max_players {
            return Err(ClientError::Config(format!(
                "min players {} exceeds max players {}",
                record.limits.min_players, record.limits.max_players
            )));
        }

        Ok(Self {
            chain: record.network.clone(),
            game_contract,
            currencies,
            stake_currency,
            limits: record.limits.clone(),
            refresh: record.refresh.clone(),
            abis: AbiSet::new(game_abi)?,
        })
    }

    /// Loads the recorded deployment for `env`, refusing it when the ABI on disk no
    /// longer matches the one it was recorded with.
    pub fn load(store: &DeploymentStore, env: DeploymentEnv) -> Result<Self> {
        let record = store.load()?.ok_or_else(|| {
            eyre!(
                "No deployment recorded for {env}; expected one at {}",
                store.path().display()
            )
        })?;
        let abi_path = Path::new(&record.game_abi_path);
        let abi_json = fs::read_to_string(abi_path)
            .wrap_err_with(|| format!("Failed to read game ABI at {}", abi_path.display()))?;
        let abi_hash = hash_bytes(abi_json.as_bytes());
        if !record.is_compatible_with_hash(&abi_hash) {
            return Err(eyre!(
                "Deployment for {env} was recorded with ABI hash {} but {} hashes to {abi_hash}; \
                 redeploy or update the record",
                record.abi_hash.as_deref().unwrap_or("(none)"),
                abi_path.display()
            ));
        }
        let game_abi = ContractAbi::parse(&abi_json)?;
        let book = Self::from_record(&record, game_abi)?;
        info!(
            env = %env,
            chain_id = book.chain.chain_id,
            game_contract = %book.game_contract,
            deployed_at = %record.deployed_at,
            "Loaded deployment"
        );
        Ok(book)
    }

    pub fn with_rpc_url(mut self, rpc_url: Url) -> Self {
        let rpc_url = rpc_url.to_string();
        warn!(
            recorded = %self.chain.rpc_url,
            override_url = %rpc_url,
            "Overriding recorded RPC URL"
        );
        self.chain.rpc_url = rpc_url;
        self
    }

    pub fn chain(&self) -> &ChainParams {
        &self.chain
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id
    }

    pub fn game_contract(&self) -> Address {
        self.game_contract
    }

    pub fn currency(&self, currency: Currency) -> Result<&CurrencyConfig, ClientError> {
        self.currencies
            .get(&currency)
            .ok_or(ClientError::UnsupportedCurrency(currency))
    }

    pub fn token_address(&self, currency: Currency) -> Result<Address, ClientError> {
        self.currency(currency)?
            .token
            .ok_or(ClientError::UnsupportedCurrency(currency))
    }

    /// Configured precision, falling back to the currency's usual one.
    pub fn decimals(&self, currency: Currency) -> u8 {
        self.currencies
            .get(&currency)
            .map(|config| config.decimals)
            .unwrap_or_else(|| currency.default_decimals())
    }

    pub fn symbol(&self, currency: Currency) -> String {
        self.currencies
            .get(&currency)
            .map(|config| config.symbol.clone())
            .unwrap_or_else(|| currency.to_string())
    }

    pub fn stake_currency(&self) -> Currency {
        self.stake_currency
    }

    pub fn limits(&self) -> &GameLimits {
        &self.limits
    }

    pub fn refresh(&self) -> &RefreshPeriods {
        &self.refresh
    }

    pub fn abis(&self) -> &AbiSet {
        &self.abis
    }
}

fn parse_config_address(label: &str, raw: &str) -> Result<Address, ClientError> {
    Address::from_str(raw.trim())
        .map_err(|e| ClientError::Config(format!("invalid {label} address '{raw}': {e}")))
}

fn parse_config_url(label: &str, raw: &str) -> Result<Url, ClientError> {
    Url::parse(raw.trim())
        .map_err(|e| ClientError::Config(format!("invalid {label} '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        GAME_ABI,
        sample_record,
    };
    use tempdir::TempDir;

    #[test]
    fn store__saves_and_loads_record() {
        // given
        let dir = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::at(dir.path(), DeploymentEnv::Local).unwrap();
        assert_eq!(store.load().unwrap(), None);

        // when
        let record = sample_record();
        store.save(&record).unwrap();

        // then
        assert_eq!(store.load().unwrap(), Some(record));
        assert!(store.path().ends_with("local/deployments.json"));
    }

    #[test]
    fn from_record__resolves_currencies_and_implicit_native() {
        // given
        let mut record = sample_record();
        record.currencies.remove("native");

        // when
        let book = AddressBook::from_record(&record, ContractAbi::parse(GAME_ABI).unwrap())
            .unwrap();

        // then
        assert_eq!(book.decimals(Currency::StableYield), 6);
        assert_eq!(book.symbol(Currency::Native), "ETH");
        assert_eq!(book.decimals(Currency::Native), 18);
        assert_eq!(
            book.token_address(Currency::Native),
            Err(ClientError::UnsupportedCurrency(Currency::Native))
        );
        assert!(book.token_address(Currency::StableYield).is_ok());
        assert_eq!(book.stake_currency(), Currency::StableYield);
    }

    #[test]
    fn from_record__rejects_token_currency_without_address() {
        let mut record = sample_record();
        if let Some(entry) = record.currencies.get_mut("staked_asset") {
            entry.token = None;
        }

        let err = AddressBook::from_record(&record, ContractAbi::parse(GAME_ABI).unwrap())
            .unwrap_err();

        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn from_record__rejects_malformed_rpc_url() {
        let mut record = sample_record();
        record.network.rpc_url = "not a url".into();

        let err = AddressBook::from_record(&record, ContractAbi::parse(GAME_ABI).unwrap())
            .unwrap_err();

        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn with_rpc_url__replaces_recorded_endpoint() {
        let abi = ContractAbi::parse(GAME_ABI).unwrap();
        let book = AddressBook::from_record(&sample_record(), abi)
            .unwrap()
            .with_rpc_url(Url::parse("http://localhost:8545").unwrap());

        assert_eq!(book.chain().rpc_url, "http://localhost:8545/");
    }

    #[test]
    fn load__refuses_record_with_stale_abi_hash() {
        // given
        let dir = TempDir::new("deployments").unwrap();
        let abi_path = dir.path().join("GameManager.json");
        fs::write(&abi_path, GAME_ABI).unwrap();
        let store = DeploymentStore::at(dir.path(), DeploymentEnv::Dev).unwrap();
        let mut record = sample_record();
        record.game_abi_path = abi_path.display().to_string();
        record.abi_hash = Some("deadbeef".to_string());
        store.save(&record).unwrap();

        // when
        let stale = AddressBook::load(&store, DeploymentEnv::Dev);
        record.abi_hash = Some(compute_abi_hash(&abi_path).unwrap());
        store.save(&record).unwrap();
        let fresh = AddressBook::load(&store, DeploymentEnv::Dev);

        // then
        assert!(stale.is_err());
        assert_eq!(fresh.unwrap().chain_id(), record.network.chain_id);
    }

    #[test]
    fn refresh_periods__default_to_list_8s_and_watch_4s() {
        let periods = RefreshPeriods::default();
        assert_eq!(periods.list(), Duration::from_secs(8));
        assert_eq!(periods.watch(), Duration::from_secs(4));
    }
}
