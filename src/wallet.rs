use crate::model::Currency;
use alloy::primitives::{
    Address,
    B256,
    Bytes,
    U256,
};
use async_trait::async_trait;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;
use std::{
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::sync::broadcast;

pub const USER_REJECTED_CODE: i64 = 4001;
pub const UNRECOGNIZED_CHAIN_CODE: i64 = 4902;
const EXECUTION_REVERTED_CODE: i64 = 3;
const RESOURCE_UNAVAILABLE_CODE: i64 = -32002;
const INTERNAL_ERROR_CODE: i64 = -32603;
const LIMIT_EXCEEDED_CODE: i64 = -32005;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletError {
    /// Nothing is listening at the configured wallet endpoint.
    Unavailable(String),
    /// Error object returned by the wallet or node.
    Rpc { code: i64, message: String },
    /// Connection dropped, timed out or answered with something unparseable.
    Transport(String),
    /// The call could not be encoded or its result decoded against the ABI.
    Encoding(String),
}

impl WalletError {
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unavailable(message)
            | Self::Transport(message)
            | Self::Encoding(message)
            | Self::Rpc { message, .. } => message,
        }
    }

    pub fn is_user_rejected(&self) -> bool {
        if self.code() == Some(USER_REJECTED_CODE) {
            return true;
        }
        let message = self.message().to_ascii_lowercase();
        message.contains("user rejected")
            || message.contains("user denied")
            || message.contains("action_rejected")
    }

    pub fn is_unrecognized_chain(&self) -> bool {
        if self.code() == Some(UNRECOGNIZED_CHAIN_CODE) {
            return true;
        }
        let message = self.message().to_ascii_lowercase();
        message.contains("unrecognized chain") || message.contains("unknown chain")
    }

    /// The contract itself refused the call, as opposed to the transport failing.
    pub fn is_revert(&self) -> bool {
        self.code() == Some(EXECUTION_REVERTED_CODE)
            || self.message().to_ascii_lowercase().contains("revert")
    }

    /// Failures worth retrying: the node or wallet was briefly unable to answer.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Unavailable(_) | Self::Encoding(_) => false,
            Self::Rpc { code, message } => {
                matches!(
                    *code,
                    RESOURCE_UNAVAILABLE_CODE | INTERNAL_ERROR_CODE | LIMIT_EXCEEDED_CODE
                ) || {
                    let message = message.to_ascii_lowercase();
                    message.contains("header not found")
                        || message.contains("timeout")
                        || message.contains("rate limit")
                }
            }
        }
    }
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "wallet unavailable: {message}"),
            Self::Rpc { code, message } => write!(f, "{message} (code {code})"),
            Self::Transport(message) => write!(f, "transport error: {message}"),
            Self::Encoding(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for WalletError {}

/// Argument to a contract function, coerced to the ABI parameter type on encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallArg {
    Uint(U256),
    Address(Address),
    Bool(bool),
    Text(String),
}

impl CallArg {
    pub fn uint(value: impl Into<u64>) -> Self {
        Self::Uint(U256::from(value.into()))
    }
}

impl fmt::Display for CallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallArg::Uint(value) => write!(f, "{value}"),
            CallArg::Address(address) => write!(f, "{address}"),
            CallArg::Bool(flag) => write!(f, "{flag}"),
            CallArg::Text(text) => write!(f, "{text}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContractName {
    Game,
    Token(Currency),
}

impl fmt::Display for ContractName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractName::Game => write!(f, "game"),
            ContractName::Token(currency) => write!(f, "{currency} token"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractCall {
    pub contract: ContractName,
    pub address: Address,
    pub function: &'static str,
    pub args: Vec<CallArg>,
    pub value: U256,
}

impl ContractCall {
    pub fn new(contract: ContractName, address: Address, function: &'static str) -> Self {
        Self {
            contract,
            address,
            function,
            args: Vec::new(),
            value: U256::ZERO,
        }
    }

    pub fn arg(mut self, arg: CallArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    /// `function(arg, ...)`, used as a log field and as a lookup key in test fakes.
    pub fn signature(&self) -> String {
        let args = self
            .args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({})", self.function, args)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub success: bool,
    pub block_number: Option<u64>,
    pub logs: Vec<LogEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Everything a wallet needs to add an unknown chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub chain_id: u64,
    pub chain_name: String,
    pub native_currency: NativeCurrency,
    pub rpc_url: String,
    pub explorer_url: String,
}

/// Read access to contracts on the chain a handle was created for.
///
/// `call` returns the decoded outputs as JSON: an object when the contract names its
/// outputs, an array when it does not. Decoders must accept either.
#[async_trait]
pub trait ContractReader: Send + Sync {
    async fn call(&self, call: &ContractCall) -> Result<Value, WalletError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, WalletError>;

    async fn native_balance(&self, address: Address) -> Result<U256, WalletError>;
}

/// A handle bound to one account on one chain. Handles are not reused across a chain
/// switch; a fresh one is obtained from the provider afterwards.
#[async_trait]
pub trait Connection: ContractReader {
    fn account(&self) -> Address;

    /// Chain the handle was created on.
    fn chain_id(&self) -> u64;

    async fn send_transaction(&self, call: &ContractCall) -> Result<B256, WalletError>;

    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<TxReceipt, WalletError>;
}

/// The wallet surface: account access, chain negotiation and connection handles.
#[async_trait]
pub trait WalletProvider: Send + Sync + 'static {
    type Connection: Connection + 'static;

    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError>;

    async fn chain_id(&self) -> Result<u64, WalletError>;

    async fn switch_chain(&self, chain_id: u64) -> Result<(), WalletError>;

    async fn add_chain(&self, params: &ChainParams) -> Result<(), WalletError>;

    /// Chain-changed notifications. Delivery is best effort; a notification may be missed.
    fn subscribe_chain_changed(&self) -> broadcast::Receiver<u64>;

    async fn connect(&self) -> Result<Self::Connection, WalletError>;
}

#[async_trait]
impl<T: ContractReader + ?Sized> ContractReader for Arc<T> {
    async fn call(&self, call: &ContractCall) -> Result<Value, WalletError> {
        (**self).call(call).await
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, WalletError> {
        (**self).code_at(address).await
    }

    async fn native_balance(&self, address: Address) -> Result<U256, WalletError> {
        (**self).native_balance(address).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn is_user_rejected__matches_code_and_message() {
        assert!(WalletError::rpc(4001, "User rejected the request.").is_user_rejected());
        assert!(
            WalletError::rpc(-32000, "ethers-user-denied: User denied transaction")
                .is_user_rejected()
        );
        assert!(!WalletError::rpc(-32000, "execution reverted").is_user_rejected());
    }

    #[test]
    fn is_transient__only_for_recoverable_failures() {
        assert!(WalletError::Transport("connection reset".into()).is_transient());
        assert!(WalletError::rpc(-32603, "Internal JSON-RPC error").is_transient());
        assert!(!WalletError::rpc(3, "execution reverted: Game full").is_transient());
        assert!(!WalletError::Unavailable("refused".into()).is_transient());
    }

    #[test]
    fn is_revert__matches_execution_reverted() {
        assert!(WalletError::rpc(3, "execution reverted").is_revert());
        assert!(WalletError::rpc(-32000, "VM Exception: revert Game full").is_revert());
        assert!(!WalletError::Transport("connection reset".into()).is_revert());
    }

    #[test]
    fn uint__widens_ids_rounds_and_choice_codes() {
        assert_eq!(CallArg::uint(7u8), CallArg::Uint(U256::from(7u64)));
        assert_eq!(CallArg::uint(3u32), CallArg::Uint(U256::from(3u64)));
        assert_eq!(CallArg::uint(u64::MAX), CallArg::Uint(U256::from(u64::MAX)));
    }

    #[test]
    fn signature__renders_function_and_arguments() {
        let call = ContractCall::new(ContractName::Game, Address::ZERO, "getGame")
            .arg(CallArg::uint(17u64));
        assert_eq!(call.signature(), "getGame(17)");
    }
}
