use crate::{
    error::ClientError,
    retry::RetryPolicy,
    wallet::{
        ChainParams,
        Connection,
        WalletError,
        WalletProvider,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{
        Mutex,
        broadcast::{
            self,
            error::RecvError,
        },
    },
    time::{
        MissedTickBehavior,
        interval,
        sleep,
        timeout,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchTiming {
    /// Pause after the switch is observed, before a fresh connection is built.
    pub settle: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for SwitchTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Single gate every chain-bound call passes through. Only one switch negotiation runs
/// at a time; later callers wait and then find the wallet already on the target.
pub struct NetworkGuard<W: WalletProvider> {
    wallet: Arc<W>,
    target: ChainParams,
    timing: SwitchTiming,
    chain_id_retry: RetryPolicy,
    switch_lock: Mutex<()>,
}

impl<W: WalletProvider> NetworkGuard<W> {
    pub fn new(wallet: Arc<W>, target: ChainParams) -> Self {
        Self {
            wallet,
            target,
            timing: SwitchTiming::default(),
            chain_id_retry: RetryPolicy::chain_id_check(),
            switch_lock: Mutex::new(()),
        }
    }

    pub fn with_timing(mut self, timing: SwitchTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn target(&self) -> &ChainParams {
        &self.target
    }

    pub fn wallet(&self) -> &Arc<W> {
        &self.wallet
    }

    /// Returns a connection created after the wallet was confirmed on the target chain.
    pub async fn ensure_network(&self) -> Result<W::Connection, ClientError> {
        let _negotiation = self.switch_lock.lock().await;
        let expected = self.target.chain_id;
        let observed = self.current_chain_id().await?;
        if observed == expected {
            return self.connect_verified().await;
        }

        info!(
            observed,
            expected,
            name = %self.target.chain_name,
            "wallet on wrong chain; requesting switch"
        );
        let mut changes = self.wallet.subscribe_chain_changed();
        self.request_switch(observed).await?;
        self.await_target(&mut changes).await?;
        sleep(self.timing.settle).await;
        let connection = self.connect_verified().await?;
        info!(chain_id = expected, "wallet switched to target chain");
        Ok(connection)
    }

    async fn current_chain_id(&self) -> Result<u64, ClientError> {
        self.chain_id_retry
            .run("chain id", WalletError::is_transient, |_| self.wallet.chain_id())
            .await
            .map_err(ClientError::from)
    }

    async fn connect_verified(&self) -> Result<W::Connection, ClientError> {
        let connection = self.wallet.connect().await?;
        let observed = connection.chain_id();
        if observed != self.target.chain_id {
            warn!(observed, expected = self.target.chain_id, "fresh connection on wrong chain");
            return Err(self.mismatch(observed));
        }
        Ok(connection)
    }

    /// One switch, or one add followed by one switch when the wallet does not know the
    /// chain. Rejections are never retried.
    async fn request_switch(&self, observed: u64) -> Result<(), ClientError> {
        let expected = self.target.chain_id;
        let err = match self.wallet.switch_chain(expected).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.is_user_rejected() {
            return Err(ClientError::UserRejected);
        }
        if !err.is_unrecognized_chain() {
            warn!(error = %err, "chain switch failed");
            return Err(self.mismatch(observed));
        }

        info!(chain_id = expected, "wallet does not know the chain; adding it");
        match self.wallet.add_chain(&self.target).await {
            Ok(()) => {}
            Err(err) if err.is_user_rejected() => return Err(ClientError::UserRejected),
            Err(err) => {
                warn!(error = %err, "adding chain failed");
                return Err(self.mismatch(observed));
            }
        }
        match self.wallet.switch_chain(expected).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_user_rejected() => Err(ClientError::UserRejected),
            Err(err) => {
                warn!(error = %err, "chain switch after add failed");
                Err(self.mismatch(observed))
            }
        }
    }

    /// Chain-changed notifications can be lost, so they race a chain id poll.
    async fn await_target(
        &self,
        changes: &mut broadcast::Receiver<u64>,
    ) -> Result<(), ClientError> {
        let expected = self.target.chain_id;
        let via_event = async {
            loop {
                match changes.recv().await {
                    Ok(chain_id) if chain_id == expected => return "event",
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };
        let via_poll = async {
            let mut ticker = interval(self.timing.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.wallet.chain_id().await {
                    Ok(chain_id) if chain_id == expected => return "poll",
                    Ok(_) => {}
                    Err(err) => debug!(error = %err, "chain id poll failed"),
                }
            }
        };
        let confirmed = timeout(self.timing.timeout, async {
            tokio::select! {
                source = via_event => source,
                source = via_poll => source,
            }
        })
        .await;
        match confirmed {
            Ok(source) => {
                debug!(source, chain_id = expected, "chain switch confirmed");
                Ok(())
            }
            Err(_) => Err(ClientError::NetworkSwitchTimeout {
                expected,
                expected_name: self.target.chain_name.clone(),
            }),
        }
    }

    fn mismatch(&self, observed: u64) -> ClientError {
        ClientError::NetworkMismatch {
            observed,
            expected: self.target.chain_id,
            expected_name: self.target.chain_name.clone(),
        }
    }
}
