//! Wallet provider speaking EIP-1193 methods as JSON-RPC 2.0 over HTTP, e.g. a local
//! signer daemon or a development node with unlocked accounts.

use crate::{
    abi::AbiSet,
    wallet::{
        ChainParams,
        Connection,
        ContractCall,
        ContractReader,
        LogEntry,
        TxReceipt,
        WalletError,
        WalletProvider,
    },
};
use alloy::{
    dyn_abi::{
        DynSolType,
        DynSolValue,
    },
    primitives::{
        Address,
        B256,
        Bytes,
        U256,
    },
};
use async_trait::async_trait;
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{
    debug,
    info,
};
use url::Url;

const DEFAULT_RECEIPT_POLL: Duration = Duration::from_secs(1);
/// `Error(string)`
const REVERT_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

#[derive(Clone)]
pub struct RpcWallet {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    url: Url,
    http: reqwest::Client,
    next_id: AtomicU64,
    abis: AbiSet,
    chain_changed: broadcast::Sender<u64>,
    receipt_poll: Duration,
}

impl RpcWallet {
    pub fn new(url: Url, abis: AbiSet) -> Result<Self, WalletError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                WalletError::Unavailable(format!("failed to build HTTP client: {e}"))
            })?;
        let (chain_changed, _) = broadcast::channel(16);
        Ok(Self {
            inner: Arc::new(RpcInner {
                url,
                http,
                next_id: AtomicU64::new(1),
                abis,
                chain_changed,
                receipt_poll: DEFAULT_RECEIPT_POLL,
            }),
        })
    }
}

impl RpcInner {
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, WalletError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, "wallet request");
        let res = self
            .http
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    WalletError::Unavailable(format!("{}: {e}", self.url))
                } else {
                    WalletError::Transport(format!("{method} request failed: {e}"))
                }
            })?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(|e| {
            WalletError::Transport(format!("failed to read {method} response: {e}"))
        })?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(WalletError::Transport(format!(
                "wallet responded with {status} to {method}: {body}"
            )));
        }
        let envelope: RpcResponseDto = serde_json::from_slice(&bytes).map_err(|e| {
            WalletError::Transport(format!("invalid {method} response: {e}"))
        })?;
        if let Some(error) = envelope.error {
            return Err(error.into());
        }
        serde_json::from_value(envelope.result.unwrap_or(Value::Null)).map_err(|e| {
            WalletError::Transport(format!("unexpected {method} result: {e}"))
        })
    }
}

#[derive(Deserialize)]
struct RpcResponseDto {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorDto>,
}

#[derive(Deserialize)]
struct RpcErrorDto {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl From<RpcErrorDto> for WalletError {
    fn from(dto: RpcErrorDto) -> Self {
        let reason = dto.data.as_ref().and_then(|data| match data {
            Value::String(raw) => revert_reason(raw),
            Value::Object(map) => map
                .get("data")
                .and_then(Value::as_str)
                .and_then(revert_reason),
            _ => None,
        });
        let message = match reason {
            Some(reason) if !dto.message.contains(&reason) => {
                format!("{}: {reason}", dto.message)
            }
            _ => dto.message,
        };
        WalletError::rpc(dto.code, message)
    }
}

/// Decodes `Error(string)` revert data.
fn revert_reason(raw: &str) -> Option<String> {
    let bytes = hex::decode(raw.trim().trim_start_matches("0x")).ok()?;
    let payload = bytes.strip_prefix(&REVERT_SELECTOR)?;
    match DynSolType::String.abi_decode(payload).ok()? {
        DynSolValue::String(reason) => Some(reason),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptDto {
    transaction_hash: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    logs: Vec<LogDto>,
}

#[derive(Deserialize)]
struct LogDto {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
}

impl TryFrom<ReceiptDto> for TxReceipt {
    type Error = WalletError;

    fn try_from(dto: ReceiptDto) -> Result<Self, Self::Error> {
        let logs = dto
            .logs
            .into_iter()
            .map(|log| -> Result<LogEntry, WalletError> {
                Ok(LogEntry {
                    address: parse_hex::<Address>(&log.address)?,
                    topics: log
                        .topics
                        .iter()
                        .map(|topic| parse_hex::<B256>(topic))
                        .collect::<Result<Vec<_>, _>>()?,
                    data: parse_bytes(&log.data)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let block_number = dto
            .block_number
            .as_deref()
            .map(parse_quantity)
            .transpose()?
            .and_then(|number| u64::try_from(number).ok());
        // pre-byzantium receipts carry no status; inclusion is all they promise
        let success = match dto.status.as_deref() {
            Some(status) => !parse_quantity(status)?.is_zero(),
            None => true,
        };
        Ok(TxReceipt {
            tx_hash: parse_hex(&dto.transaction_hash)?,
            success,
            block_number,
            logs,
        })
    }
}

fn parse_hex<T>(raw: &str) -> Result<T, WalletError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(raw.trim())
        .map_err(|e| WalletError::Transport(format!("invalid hex value '{raw}': {e}")))
}

fn parse_bytes(raw: &str) -> Result<Bytes, WalletError> {
    let digits = raw.trim().trim_start_matches("0x");
    hex::decode(digits)
        .map(Bytes::from)
        .map_err(|e| WalletError::Transport(format!("invalid hex data '{raw}': {e}")))
}

fn parse_quantity(raw: &str) -> Result<U256, WalletError> {
    let digits = raw.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| WalletError::Transport(format!("invalid quantity '{raw}': {e}")))
}

fn quantity(value: U256) -> String {
    format!("0x{value:x}")
}

fn chain_id_param(chain_id: u64) -> String {
    format!("{chain_id:#x}")
}

fn add_chain_params(params: &ChainParams) -> Value {
    let explorers = if params.explorer_url.is_empty() {
        Vec::new()
    } else {
        vec![params.explorer_url.clone()]
    };
    json!([{
        "chainId": chain_id_param(params.chain_id),
        "chainName": params.chain_name,
        "nativeCurrency": {
            "name": params.native_currency.name,
            "symbol": params.native_currency.symbol,
            "decimals": params.native_currency.decimals,
        },
        "rpcUrls": [params.rpc_url],
        "blockExplorerUrls": explorers,
    }])
}

#[async_trait]
impl WalletProvider for RpcWallet {
    type Connection = RpcConnection;

    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        let accounts: Vec<String> = self
            .inner
            .request("eth_requestAccounts", json!([]))
            .await?;
        accounts.iter().map(|account| parse_hex(account)).collect()
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        let raw: String = self.inner.request("eth_chainId", json!([])).await?;
        u64::try_from(parse_quantity(&raw)?)
            .map_err(|_| WalletError::Transport(format!("chain id '{raw}' is out of range")))
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), WalletError> {
        let _: Value = self
            .inner
            .request(
                "wallet_switchEthereumChain",
                json!([{ "chainId": chain_id_param(chain_id) }]),
            )
            .await?;
        info!(chain_id, "wallet accepted chain switch");
        // nobody listening is fine
        let _ = self.inner.chain_changed.send(chain_id);
        Ok(())
    }

    async fn add_chain(&self, params: &ChainParams) -> Result<(), WalletError> {
        let _: Value = self
            .inner
            .request("wallet_addEthereumChain", add_chain_params(params))
            .await?;
        info!(chain_id = params.chain_id, name = %params.chain_name, "wallet added chain");
        Ok(())
    }

    fn subscribe_chain_changed(&self) -> broadcast::Receiver<u64> {
        self.inner.chain_changed.subscribe()
    }

    async fn connect(&self) -> Result<RpcConnection, WalletError> {
        let account = self
            .request_accounts()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::Unavailable("wallet exposes no accounts".into()))?;
        let chain_id = WalletProvider::chain_id(self).await?;
        Ok(RpcConnection {
            inner: Arc::clone(&self.inner),
            account,
            chain_id,
        })
    }
}

#[derive(Clone)]
pub struct RpcConnection {
    inner: Arc<RpcInner>,
    account: Address,
    chain_id: u64,
}

impl RpcConnection {
    fn encode(&self, call: &ContractCall) -> Result<Bytes, WalletError> {
        self.inner
            .abis
            .for_contract(call.contract)
            .encode_call(call)
            .map_err(|e| WalletError::Encoding(e.to_string()))
    }

    fn tx_object(&self, call: &ContractCall) -> Result<Value, WalletError> {
        let data = self.encode(call)?;
        let mut tx = json!({
            "from": self.account.to_string(),
            "to": call.address.to_string(),
            "data": format!("0x{}", hex::encode(&data)),
        });
        if !call.value.is_zero() {
            tx["value"] = Value::String(quantity(call.value));
        }
        Ok(tx)
    }
}

#[async_trait]
impl ContractReader for RpcConnection {
    async fn call(&self, call: &ContractCall) -> Result<Value, WalletError> {
        let tx = self.tx_object(call)?;
        let raw: String = self.inner.request("eth_call", json!([tx, "latest"])).await?;
        let data = parse_bytes(&raw)?;
        if data.is_empty() {
            return Err(WalletError::rpc(
                -32000,
                format!("execution reverted: {} returned no data", call.signature()),
            ));
        }
        self.inner
            .abis
            .for_contract(call.contract)
            .decode_output(call, &data)
            .map_err(|e| WalletError::Encoding(e.to_string()))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, WalletError> {
        let raw: String = self
            .inner
            .request("eth_getCode", json!([address.to_string(), "latest"]))
            .await?;
        parse_bytes(&raw)
    }

    async fn native_balance(&self, address: Address) -> Result<U256, WalletError> {
        let raw: String = self
            .inner
            .request("eth_getBalance", json!([address.to_string(), "latest"]))
            .await?;
        parse_quantity(&raw)
    }
}

#[async_trait]
impl Connection for RpcConnection {
    fn account(&self) -> Address {
        self.account
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_transaction(&self, call: &ContractCall) -> Result<B256, WalletError> {
        let tx = self.tx_object(call)?;
        let raw: String = self
            .inner
            .request("eth_sendTransaction", json!([tx]))
            .await?;
        let tx_hash = parse_hex(&raw)?;
        info!(call = %call.signature(), %tx_hash, "transaction submitted");
        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<TxReceipt, WalletError> {
        let poll = async {
            loop {
                let receipt: Option<ReceiptDto> = self
                    .inner
                    .request("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
                    .await?;
                if let Some(receipt) = receipt {
                    return TxReceipt::try_from(receipt);
                }
                tokio::time::sleep(self.inner.receipt_poll).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            WalletError::Transport(format!(
                "no receipt for {tx_hash} after {}s",
                timeout.as_secs()
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::wallet::NativeCurrency;

    #[test]
    fn revert_reason__decodes_error_string() {
        // given
        let mut data = REVERT_SELECTOR.to_vec();
        data.extend(DynSolValue::String("Round expired".into()).abi_encode_params());
        let raw = format!("0x{}", hex::encode(data));

        // when
        let reason = revert_reason(&raw);

        // then
        assert_eq!(reason.as_deref(), Some("Round expired"));
        assert_eq!(revert_reason("0x1234"), None);
    }

    #[test]
    fn rpc_error__appends_revert_reason_to_message() {
        let mut data = REVERT_SELECTOR.to_vec();
        data.extend(DynSolValue::String("Already made choice".into()).abi_encode_params());
        let dto = RpcErrorDto {
            code: 3,
            message: "execution reverted".into(),
            data: Some(Value::String(format!("0x{}", hex::encode(data)))),
        };

        let err = WalletError::from(dto);

        assert_eq!(err, WalletError::rpc(3, "execution reverted: Already made choice"));
    }

    #[test]
    fn receipt_dto__converts_status_and_logs() {
        // given
        let raw = json!({
            "transactionHash": format!("0x{}", "ab".repeat(32)),
            "status": "0x1",
            "blockNumber": "0x10",
            "logs": [{
                "address": "0x00000000000000000000000000000000000000aa",
                "topics": [format!("0x{}", "01".repeat(32))],
                "data": "0x"
            }]
        });

        // when
        let receipt: ReceiptDto = serde_json::from_value(raw).unwrap();
        let receipt = TxReceipt::try_from(receipt).unwrap();

        // then
        assert!(receipt.success);
        assert_eq!(receipt.block_number, Some(16));
        assert_eq!(receipt.logs.len(), 1);
        assert!(receipt.logs[0].data.is_empty());
    }

    #[test]
    fn receipt_dto__zero_status_is_a_failure() {
        let raw = json!({
            "transactionHash": format!("0x{}", "cd".repeat(32)),
            "status": "0x0",
            "logs": []
        });

        let receipt: ReceiptDto = serde_json::from_value(raw).unwrap();

        assert!(!TxReceipt::try_from(receipt).unwrap().success);
    }

    #[test]
    fn add_chain_params__follows_eip_3085_shape() {
        let params = ChainParams {
            chain_id: 84532,
            chain_name: "Base Sepolia".into(),
            native_currency: NativeCurrency {
                name: "Ether".into(),
                symbol: "ETH".into(),
                decimals: 18,
            },
            rpc_url: "https://sepolia.base.org".into(),
            explorer_url: "https://sepolia.basescan.org".into(),
        };

        let value = add_chain_params(&params);

        assert_eq!(value[0]["chainId"], "0x14a34");
        assert_eq!(value[0]["rpcUrls"][0], "https://sepolia.base.org");
        assert_eq!(value[0]["nativeCurrency"]["decimals"], 18);
    }

    #[test]
    fn parse_quantity__reads_hex() {
        assert_eq!(parse_quantity("0x25").unwrap(), U256::from(37));
        assert_eq!(parse_quantity("0x").unwrap(), U256::ZERO);
        assert!(parse_quantity("0xzz").is_err());
    }
}
