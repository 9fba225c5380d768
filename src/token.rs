use crate::{
    amount::TokenAmount,
    decode::decode_scalar,
    deployment::AddressBook,
    error::ClientError,
    model::Currency,
    retry::RetryPolicy,
    wallet::{
        CallArg,
        Connection,
        ContractCall,
        ContractName,
        ContractReader,
        WalletError,
    },
};
use alloy::primitives::{
    Address,
    U256,
};
use std::{
    collections::HashMap,
    fmt,
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

enum CodeCheck {
    Missing,
    Rpc(WalletError),
}

impl CodeCheck {
    /// An empty code response right after a chain switch is usually the node lagging.
    fn is_transient(&self) -> bool {
        match self {
            CodeCheck::Missing => true,
            CodeCheck::Rpc(err) => err.is_transient(),
        }
    }
}

impl fmt::Display for CodeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeCheck::Missing => write!(f, "no code at token address"),
            CodeCheck::Rpc(err) => write!(f, "{err}"),
        }
    }
}

/// Balances and approvals. Native currency needs neither a token contract nor an
/// approval, so approval calls for it return without touching the chain.
pub struct TokenLedgerClient {
    book: Arc<AddressBook>,
    code_retry: RetryPolicy,
    allowance_retry: RetryPolicy,
    receipt_timeout: Duration,
    approval_locks: Mutex<HashMap<(Currency, Address), Arc<Mutex<()>>>>,
}

impl TokenLedgerClient {
    pub fn new(book: Arc<AddressBook>) -> Self {
        Self {
            book,
            code_retry: RetryPolicy::contract_code_check(),
            allowance_retry: RetryPolicy::allowance_check(),
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            approval_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_receipt_timeout(mut self, receipt_timeout: Duration) -> Self {
        self.receipt_timeout = receipt_timeout;
        self
    }

    pub async fn get_balance<R: ContractReader + ?Sized>(
        &self,
        reader: &R,
        owner: Address,
        currency: Currency,
    ) -> Result<TokenAmount, ClientError> {
        let decimals = self.book.decimals(currency);
        if currency.is_native() {
            let raw = reader.native_balance(owner).await?;
            return Ok(TokenAmount::from_raw(raw, decimals));
        }
        let token = self.book.token_address(currency)?;
        let call = ContractCall::new(ContractName::Token(currency), token, "balanceOf")
            .arg(CallArg::Address(owner));
        let value = reader.call(&call).await?;
        let raw = decode_scalar(&value, "balanceOf")?;
        Ok(TokenAmount::from_raw(raw, decimals))
    }

    pub async fn allowance<R: ContractReader + ?Sized>(
        &self,
        reader: &R,
        owner: Address,
        spender: Address,
        currency: Currency,
    ) -> Result<TokenAmount, ClientError> {
        let token = self.book.token_address(currency)?;
        let call = ContractCall::new(ContractName::Token(currency), token, "allowance")
            .arg(CallArg::Address(owner))
            .arg(CallArg::Address(spender));
        let value = self
            .allowance_retry
            .run("allowance", WalletError::is_transient, |_| reader.call(&call))
            .await?;
        let raw = decode_scalar(&value, "allowance")?;
        Ok(TokenAmount::from_raw(raw, self.book.decimals(currency)))
    }

    /// Approves `spender` for the maximum amount without reading the current
    /// allowance first, then waits for the approval to confirm.
    pub async fn ensure_approval<C: Connection + ?Sized>(
        &self,
        conn: &C,
        currency: Currency,
        spender: Address,
    ) -> Result<(), ClientError> {
        if currency.is_native() {
            debug!("native currency needs no approval");
            return Ok(());
        }
        let token = self.book.token_address(currency)?;
        let lock = self.approval_lock(currency, spender).await;
        let _serialized = lock.lock().await;
        self.verify_deployed(conn, currency, token).await?;
        self.approve_max(conn, currency, token, spender).await
    }

    /// Like [`Self::ensure_approval`], but skips the approval when the current
    /// allowance already covers `amount`. An unreadable allowance counts as too low.
    pub async fn ensure_allowance<C: Connection + ?Sized>(
        &self,
        conn: &C,
        currency: Currency,
        spender: Address,
        amount: &TokenAmount,
    ) -> Result<(), ClientError> {
        if currency.is_native() {
            return Ok(());
        }
        let decimals = self.book.decimals(currency);
        if amount.decimals() != decimals {
            return Err(ClientError::InvalidAmount(format!(
                "{currency} amounts use {decimals} decimals, got {}",
                amount.decimals()
            )));
        }
        let token = self.book.token_address(currency)?;
        let lock = self.approval_lock(currency, spender).await;
        let _serialized = lock.lock().await;
        self.verify_deployed(conn, currency, token).await?;
        match self
            .allowance(conn, conn.account(), spender, currency)
            .await
        {
            Ok(current) if current >= *amount => {
                debug!(%currency, %current, needed = %amount, "allowance already sufficient");
                return Ok(());
            }
            Ok(current) => {
                debug!(%currency, %current, needed = %amount, "allowance too low");
            }
            Err(err) => {
                warn!(%currency, error = %err, "allowance unreadable; approving anyway");
            }
        }
        self.approve_max(conn, currency, token, spender).await
    }

    async fn approval_lock(&self, currency: Currency, spender: Address) -> Arc<Mutex<()>> {
        let mut locks = self.approval_locks.lock().await;
        Arc::clone(locks.entry((currency, spender)).or_default())
    }

    async fn verify_deployed<C: Connection + ?Sized>(
        &self,
        conn: &C,
        currency: Currency,
        token: Address,
    ) -> Result<(), ClientError> {
        self.code_retry
            .run("token code", CodeCheck::is_transient, |_| async move {
                match conn.code_at(token).await {
                    Ok(code) if code.is_empty() => Err(CodeCheck::Missing),
                    Ok(_) => Ok(()),
                    Err(err) => Err(CodeCheck::Rpc(err)),
                }
            })
            .await
            .map_err(|check| match check {
                CodeCheck::Missing => ClientError::ContractNotDeployed {
                    contract: format!("{} token", self.book.symbol(currency)),
                    address: token,
                },
                CodeCheck::Rpc(err) => ClientError::from(err),
            })
    }

    async fn approve_max<C: Connection + ?Sized>(
        &self,
        conn: &C,
        currency: Currency,
        token: Address,
        spender: Address,
    ) -> Result<(), ClientError> {
        let symbol = self.book.symbol(currency);
        let call = ContractCall::new(ContractName::Token(currency), token, "approve")
            .arg(CallArg::Address(spender))
            .arg(CallArg::Uint(U256::MAX));
        info!(%symbol, %spender, "requesting token approval");
        let tx_hash = conn.send_transaction(&call).await.map_err(|err| {
            if err.is_user_rejected() {
                ClientError::ApprovalRejected {
                    symbol: symbol.clone(),
                }
            } else {
                ClientError::ApprovalFailed {
                    symbol: symbol.clone(),
                    reason: err.message().to_string(),
                }
            }
        })?;
        let receipt = conn
            .wait_for_receipt(tx_hash, self.receipt_timeout)
            .await
            .map_err(|err| ClientError::ApprovalFailed {
                symbol: symbol.clone(),
                reason: err.to_string(),
            })?;
        if !receipt.success {
            return Err(ClientError::ApprovalFailed {
                symbol,
                reason: format!("approval {tx_hash} reverted"),
            });
        }
        info!(%symbol, %tx_hash, "token approval confirmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        FakeWallet,
        STABLE_TOKEN,
        SwitchBehavior,
        TARGET_CHAIN,
        TxOutcome,
        test_book,
    };
    use crate::wallet::WalletProvider;
    use serde_json::json;

    async fn setup() -> (FakeWallet, crate::test_helpers::FakeConnection, TokenLedgerClient) {
        let wallet = FakeWallet::new(TARGET_CHAIN, SwitchBehavior::Accept);
        let conn = wallet.connect().await.unwrap();
        let book = test_book();
        (wallet, conn, TokenLedgerClient::new(book))
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_approval__native_currency_touches_nothing() {
        // given
        let (wallet, conn, tokens) = setup().await;
        let spender = test_book().game_contract();

        // when
        let result = tokens.ensure_approval(&conn, Currency::Native, spender).await;

        // then
        assert_eq!(result, Ok(()));
        assert!(wallet.chain().calls().is_empty());
        assert!(wallet.chain().sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_approval__retries_missing_code_then_approves_max() {
        // given
        let (wallet, conn, tokens) = setup().await;
        let spender = test_book().game_contract();
        wallet.chain().set_code(STABLE_TOKEN);
        wallet.chain().code_missing_for(STABLE_TOKEN, 5);

        // when
        let result = tokens
            .ensure_approval(&conn, Currency::StableYield, spender)
            .await;

        // then
        assert_eq!(result, Ok(()));
        let sent = wallet.chain().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].function, "approve");
        assert_eq!(sent[0].address, STABLE_TOKEN);
        assert_eq!(sent[0].args[1], CallArg::Uint(U256::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_approval__same_token_and_spender_wait_for_the_first_receipt() {
        // given
        let (wallet, conn, tokens) = setup().await;
        let spender = test_book().game_contract();
        wallet.chain().set_code(STABLE_TOKEN);
        wallet
            .chain()
            .on_send("approve", TxOutcome::ConfirmAfter(Duration::from_secs(1)));
        let sent_while_first_pending = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            wallet.chain().sent().len()
        };

        // when
        let (first, second, in_flight) = tokio::join!(
            tokens.ensure_approval(&conn, Currency::StableYield, spender),
            tokens.ensure_approval(&conn, Currency::StableYield, spender),
            sent_while_first_pending,
        );

        // then
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(in_flight, 1);
        assert_eq!(wallet.chain().sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_allowance__rejects_amount_in_another_precision() {
        let (wallet, conn, tokens) = setup().await;
        let spender = test_book().game_contract();
        let amount = TokenAmount::from_raw(U256::from(5u64), 18);

        let result = tokens
            .ensure_allowance(&conn, Currency::StableYield, spender, &amount)
            .await;

        assert!(matches!(result, Err(ClientError::InvalidAmount(_))));
        assert!(wallet.chain().sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_approval__gives_up_when_code_never_appears() {
        let (wallet, conn, tokens) = setup().await;
        let spender = test_book().game_contract();

        let result = tokens
            .ensure_approval(&conn, Currency::StableYield, spender)
            .await;

        assert!(matches!(
            result,
            Err(ClientError::ContractNotDeployed { address, .. }) if address == STABLE_TOKEN
        ));
        let code_checks = wallet
            .chain()
            .calls()
            .iter()
            .filter(|call| call.starts_with("code_at"))
            .count();
        assert_eq!(code_checks, 6);
        assert!(wallet.chain().sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_approval__maps_rejection_and_revert() {
        // given
        let (wallet, conn, tokens) = setup().await;
        let spender = test_book().game_contract();
        wallet.chain().set_code(STABLE_TOKEN);
        wallet.chain().on_send("approve", TxOutcome::RejectSignature);
        wallet.chain().on_send("approve", TxOutcome::Revert);

        // when
        let rejected = tokens
            .ensure_approval(&conn, Currency::StableYield, spender)
            .await;
        let reverted = tokens
            .ensure_approval(&conn, Currency::StableYield, spender)
            .await;

        // then
        assert_eq!(
            rejected,
            Err(ClientError::ApprovalRejected {
                symbol: "USDC".into()
            })
        );
        assert!(matches!(reverted, Err(ClientError::ApprovalFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_allowance__skips_approval_when_allowance_covers_amount() {
        // given
        let (wallet, conn, tokens) = setup().await;
        let spender = test_book().game_contract();
        wallet.chain().set_code(STABLE_TOKEN);
        wallet.chain().respond(
            &format!("allowance({},{spender})", conn.account()),
            json!("5000000"),
        );
        let fee = TokenAmount::parse("5", 6).unwrap();

        // when
        let result = tokens
            .ensure_allowance(&conn, Currency::StableYield, spender, &fee)
            .await;

        // then
        assert_eq!(result, Ok(()));
        assert!(wallet.chain().sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_allowance__approves_when_allowance_is_short() {
        let (wallet, conn, tokens) = setup().await;
        let spender = test_book().game_contract();
        wallet.chain().set_code(STABLE_TOKEN);
        wallet.chain().respond(
            &format!("allowance({},{spender})", conn.account()),
            json!("10"),
        );
        let fee = TokenAmount::parse("5", 6).unwrap();

        let result = tokens
            .ensure_allowance(&conn, Currency::StableYield, spender, &fee)
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(wallet.chain().sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn get_balance__formats_with_currency_precision() {
        // given
        let (wallet, conn, tokens) = setup().await;
        let owner = conn.account();
        wallet
            .chain()
            .respond(&format!("balanceOf({owner})"), json!("12500000"));
        wallet
            .chain()
            .set_native_balance(owner, U256::from(1_500_000_000_000_000_000u128));

        // when
        let stable = tokens
            .get_balance(&conn, owner, Currency::StableYield)
            .await
            .unwrap();
        let native = tokens.get_balance(&conn, owner, Currency::Native).await.unwrap();

        // then
        assert_eq!(stable.to_string(), "12.5");
        assert_eq!(native.to_string(), "1.5");
    }
}
