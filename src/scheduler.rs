//! Keeps a shared view of the game list and of one watched game current.
//!
//! The list refreshes on a fixed period and whenever a [`RefreshTrigger`] fires;
//! triggers that arrive while a refresh is running collapse into a single follow-up.
//! A watched game refreshes on its own period until its [`GameWatch`] is dropped, after
//! which no result of that watch is applied.

use crate::{
    deployment::RefreshPeriods,
    model::{
        GameRecord,
        ObservedGame,
    },
    reader::GameReadClient,
    wallet::ContractReader,
};
use std::sync::{
    Arc,
    atomic::{
        AtomicBool,
        Ordering,
    },
};
use tokio::{
    sync::{
        Notify,
        watch,
    },
    task::JoinHandle,
    time::{
        MissedTickBehavior,
        interval,
    },
};
use tracing::{
    debug,
    warn,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GameSnapshot {
    /// Newest first, as returned by the last successful list refresh.
    pub games: Vec<GameRecord>,
    pub observed: Option<ObservedGame>,
    /// Bumped on every successful list refresh.
    pub list_generation: u64,
    pub last_error: Option<String>,
}

/// Shared state written by the refresh tasks and read by everything else.
#[derive(Clone)]
pub struct GameStore {
    state: Arc<watch::Sender<GameSnapshot>>,
}

impl Default for GameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GameStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GameSnapshot::default());
        Self {
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<GameSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> GameSnapshot {
        self.state.borrow().clone()
    }

    /// Latest known record for `game_id`, from the list or the watched game.
    pub fn game(&self, game_id: u64) -> Option<GameRecord> {
        let snapshot = self.state.borrow();
        snapshot
            .games
            .iter()
            .find(|game| game.game_id == game_id)
            .or_else(|| {
                snapshot
                    .observed
                    .as_ref()
                    .map(|observed| &observed.game)
                    .filter(|game| game.game_id == game_id)
            })
            .cloned()
    }

    pub fn set_games(&self, games: Vec<GameRecord>) {
        self.state.send_modify(|snapshot| {
            snapshot.games = games;
            snapshot.list_generation += 1;
            snapshot.last_error = None;
        });
    }

    /// Applies `observed` unless `cancelled` is already set. The flag is read under the
    /// store's lock, so nothing is applied once a cancellation has completed.
    pub fn set_observed(&self, observed: ObservedGame, cancelled: &AtomicBool) -> bool {
        self.state.send_if_modified(|snapshot| {
            if cancelled.load(Ordering::SeqCst) {
                return false;
            }
            snapshot.observed = Some(observed);
            true
        })
    }

    pub fn clear_observed(&self, game_id: u64) {
        self.state.send_if_modified(|snapshot| {
            let watching = snapshot
                .observed
                .as_ref()
                .is_some_and(|observed| observed.game.game_id == game_id);
            if watching {
                snapshot.observed = None;
            }
            watching
        });
    }

    pub fn record_error(&self, error: String) {
        self.state.send_modify(|snapshot| snapshot.last_error = Some(error));
    }
}

/// Requests an out-of-band list refresh. Requests made while one is pending collapse.
#[derive(Clone, Default)]
pub struct RefreshTrigger {
    notify: Arc<Notify>,
}

impl RefreshTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh(&self) {
        self.notify.notify_one();
    }

    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}

/// Aborts the task it owns when dropped.
pub struct RefreshHandle {
    task: JoinHandle<()>,
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A running watch of one game. Dropping it stops the refreshes, discards any
/// result still in flight and removes the observed game from the store.
pub struct GameWatch {
    game_id: u64,
    store: GameStore,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl GameWatch {
    pub fn game_id(&self) -> u64 {
        self.game_id
    }
}

impl Drop for GameWatch {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
        self.store.clear_observed(self.game_id);
        debug!(game_id = self.game_id, "stopped watching game");
    }
}

pub struct RefreshScheduler<R> {
    reader: Arc<GameReadClient<R>>,
    store: GameStore,
    periods: RefreshPeriods,
    trigger: RefreshTrigger,
}

impl<R: ContractReader + 'static> RefreshScheduler<R> {
    pub fn new(reader: Arc<GameReadClient<R>>, store: GameStore, periods: RefreshPeriods) -> Self {
        Self {
            reader,
            store,
            periods,
            trigger: RefreshTrigger::new(),
        }
    }

    pub fn store(&self) -> &GameStore {
        &self.store
    }

    pub fn trigger(&self) -> RefreshTrigger {
        self.trigger.clone()
    }

    /// One list refresh applied to the store.
    pub async fn refresh_list(&self) {
        refresh_list(&self.reader, &self.store).await;
    }

    /// Refreshes the list immediately, then every list period and on every trigger.
    pub fn start(&self) -> RefreshHandle {
        let reader = Arc::clone(&self.reader);
        let store = self.store.clone();
        let trigger = self.trigger.clone();
        let period = self.periods.list();
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.requested() => {
                        debug!("manual list refresh");
                        ticker.reset();
                    }
                }
                refresh_list(&reader, &store).await;
            }
        });
        RefreshHandle { task }
    }

    pub fn watch_game(&self, game_id: u64) -> GameWatch {
        let reader = Arc::clone(&self.reader);
        let store = self.store.clone();
        let period = self.periods.watch();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let watch_store = store.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                match reader.observe_game(game_id).await {
                    Ok(observed) => {
                        if !store.set_observed(observed, &flag) {
                            debug!(game_id, "discarding result of cancelled watch");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(game_id, error = %err, "watched game refresh failed");
                        store.record_error(err.to_string());
                    }
                }
            }
        });
        debug!(game_id, "watching game");
        GameWatch {
            game_id,
            store: watch_store,
            cancelled,
            task,
        }
    }
}

async fn refresh_list<R: ContractReader>(reader: &GameReadClient<R>, store: &GameStore) {
    match reader.list_games().await {
        Ok(games) => store.set_games(games),
        Err(err) => {
            warn!(error = %err, "game list refresh failed; keeping previous list");
            store.record_error(err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        decode::decode_game,
        model::GameStatus,
        test_helpers::{
            FakeChain,
            GameFixture,
            test_book,
        },
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::sleep;

    fn scheduler(chain: &Arc<FakeChain>) -> RefreshScheduler<Arc<FakeChain>> {
        let reader = GameReadClient::new(Arc::clone(chain), test_book());
        RefreshScheduler::new(Arc::new(reader), GameStore::new(), RefreshPeriods::default())
    }

    fn fixture_record(game_id: u64) -> GameRecord {
        decode_game(&GameFixture::new(game_id).tuple(), |currency| {
            currency.default_decimals()
        })
        .unwrap()
    }

    fn chain_with_games(count: u64) -> Arc<FakeChain> {
        let chain = Arc::new(FakeChain::default());
        chain.respond("gameCounter()", json!(count));
        for id in 0..count {
            chain.add_game(&GameFixture::new(id));
        }
        chain
    }

    #[tokio::test(start_paused = true)]
    async fn start__refreshes_immediately_and_then_on_the_list_period() {
        // given
        let chain = chain_with_games(3);
        let scheduler = scheduler(&chain);

        // when
        let _handle = scheduler.start();
        sleep(Duration::from_millis(10)).await;
        let first = scheduler.store().snapshot();
        sleep(Duration::from_secs(8)).await;

        // then
        assert_eq!(first.games.len(), 3);
        assert_eq!(first.list_generation, 1);
        assert_eq!(scheduler.store().snapshot().list_generation, 2);
        assert_eq!(chain.calls_to("gameCounter"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger__requests_during_a_refresh_collapse_into_one() {
        // given
        let chain = chain_with_games(2);
        chain.delay("gameCounter()", Duration::from_millis(500));
        let scheduler = scheduler(&chain);
        let trigger = scheduler.trigger();
        let _handle = scheduler.start();
        sleep(Duration::from_millis(100)).await;

        // when
        trigger.refresh();
        trigger.refresh();
        trigger.refresh();
        sleep(Duration::from_secs(2)).await;

        // then
        assert_eq!(chain.calls_to("gameCounter"), 2);
        assert_eq!(scheduler.store().snapshot().list_generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_list__failure_keeps_previous_games() {
        // given
        let chain = chain_with_games(2);
        let scheduler = scheduler(&chain);
        scheduler.refresh_list().await;

        // when
        chain.revert("gameCounter()", "node unavailable");
        scheduler.refresh_list().await;

        // then
        let snapshot = scheduler.store().snapshot();
        assert_eq!(snapshot.games.len(), 2);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_game__applies_each_refresh_of_the_watched_game() {
        // given
        let chain = chain_with_games(1);
        let scheduler = scheduler(&chain);

        // when
        let watch = scheduler.watch_game(0);
        sleep(Duration::from_millis(10)).await;
        chain.add_game(&GameFixture::new(0).status(GameStatus::Cancelled));
        sleep(Duration::from_secs(4)).await;

        // then
        assert_eq!(watch.game_id(), 0);
        let observed = scheduler.store().snapshot().observed.unwrap();
        assert_eq!(observed.game.status, GameStatus::Cancelled);
        assert_eq!(chain.calls_to("getGame"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_game__result_in_flight_is_discarded_after_drop() {
        // given
        let chain = chain_with_games(1);
        chain.delay("getGame(0)", Duration::from_secs(2));
        let scheduler = scheduler(&chain);
        let watch = scheduler.watch_game(0);
        sleep(Duration::from_millis(500)).await;

        // when
        drop(watch);
        sleep(Duration::from_secs(10)).await;

        // then
        assert_eq!(scheduler.store().snapshot().observed, None);
        assert_eq!(chain.calls_to("getGame"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_game__drop_removes_the_observed_game() {
        // given
        let chain = chain_with_games(1);
        let scheduler = scheduler(&chain);
        let watch = scheduler.watch_game(0);
        sleep(Duration::from_millis(10)).await;
        assert!(scheduler.store().game(0).is_some());

        // when
        drop(watch);

        // then
        assert_eq!(scheduler.store().snapshot().observed, None);
        assert_eq!(scheduler.store().game(0), None);
    }

    #[test]
    fn set_observed__cancelled_flag_blocks_the_write() {
        // given
        let store = GameStore::new();
        let cancelled = AtomicBool::new(true);
        let observed = ObservedGame {
            game: fixture_record(4),
            round: None,
            player: None,
        };

        // when
        let applied = store.set_observed(observed, &cancelled);

        // then
        assert!(!applied);
        assert_eq!(store.snapshot().observed, None);
        assert_eq!(store.game(4), None);
    }

    #[test]
    fn game__falls_back_to_the_watched_game() {
        let store = GameStore::new();
        let game = fixture_record(6);
        let observed = ObservedGame {
            game: game.clone(),
            round: None,
            player: None,
        };

        assert!(store.set_observed(observed, &AtomicBool::new(false)));

        assert_eq!(store.game(6), Some(game));
        store.clear_observed(6);
        assert_eq!(store.game(6), None);
    }
}
