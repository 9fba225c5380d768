#![allow(non_snake_case)]

use super::*;
use crate::{
    amount::TokenAmount,
    model::Choice,
    test_helpers::{
        CREATOR,
        FakeChain,
        FixedClock,
        GameFixture,
        PLAYER,
        player,
        test_book,
    },
};
use alloy::primitives::U256;
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

fn client(chain: &Arc<FakeChain>) -> GameReadClient<Arc<FakeChain>> {
    GameReadClient::new(Arc::clone(chain), test_book())
}

fn chain_with_counter(counter: u64) -> Arc<FakeChain> {
    let chain = Arc::new(FakeChain::default());
    chain.respond("gameCounter()", json!(counter.to_string()));
    chain
}

fn ids(games: &[GameRecord]) -> Vec<u64> {
    games.iter().map(|game| game.game_id).collect()
}

#[test]
fn list_window__covers_newest_ids_below_the_counter() {
    assert_eq!(list_window(37, 10, 2), 17..37);
    assert_eq!(list_window(5, 10, 2), 0..5);
    assert!(list_window(0, 10, 2).is_empty());
}

#[tokio::test]
async fn list_games__skips_failed_reads_and_sorts_newest_first() {
    // given
    let chain = chain_with_counter(37);
    for id in 0..37 {
        chain.add_game(&GameFixture::new(id));
    }
    chain.revert("getGame(20)", "Game does not exist");
    chain.revert("getGame(25)", "Game does not exist");

    // when
    let games = client(&chain).list_games().await.unwrap();

    // then
    let expected: Vec<u64> = (17..37).rev().filter(|id| *id != 20 && *id != 25).collect();
    assert_eq!(games.len(), 18);
    assert_eq!(ids(&games), expected);
    assert_eq!(chain.calls_to("getGame"), 20);
    assert!(!chain.calls().contains(&"getGame(16)".to_string()));
}

#[tokio::test]
async fn list_games__empty_counter_reads_nothing_else() {
    let chain = chain_with_counter(0);

    let games = client(&chain).list_games().await.unwrap();

    assert!(games.is_empty());
    assert_eq!(chain.calls(), vec!["gameCounter()".to_string()]);
}

#[tokio::test]
async fn list_games__fewer_games_than_window_lists_them_all() {
    let chain = chain_with_counter(5);
    for id in 0..5 {
        chain.add_game(&GameFixture::new(id));
    }

    let games = client(&chain).list_games().await.unwrap();

    assert_eq!(ids(&games), vec![4, 3, 2, 1, 0]);
}

#[tokio::test]
async fn list_games__counter_failure_is_surfaced() {
    let chain = Arc::new(FakeChain::default());

    let result = client(&chain).list_games().await;

    assert!(matches!(result, Err(ClientError::Provider(_))));
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]
    #[test]
    fn list_games__order_does_not_depend_on_completion_order(
        delays in prop::collection::vec(0u64..400, 20),
        failing in prop::collection::vec(any::<bool>(), 20),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            _list_games__order_does_not_depend_on_completion_order(delays, failing).await
        })?;
    }
}

async fn _list_games__order_does_not_depend_on_completion_order(
    delays: Vec<u64>,
    failing: Vec<bool>,
) -> Result<(), TestCaseError> {
    // given
    let chain = chain_with_counter(30);
    for (offset, (delay, fails)) in delays.iter().zip(&failing).enumerate() {
        let id = 10 + offset as u64;
        let signature = format!("getGame({id})");
        chain.add_game(&GameFixture::new(id));
        chain.delay(&signature, Duration::from_millis(*delay));
        if *fails {
            chain.revert(&signature, "unavailable");
        }
    }

    // when
    let games = client(&chain).list_games().await.unwrap();

    // then
    let expected: Vec<u64> = (10..30)
        .rev()
        .filter(|id| !failing[(*id - 10) as usize])
        .collect();
    prop_assert_eq!(ids(&games), expected);
    Ok(())
}

#[tokio::test]
async fn get_game__player_count_follows_the_player_list() {
    // given
    let chain = Arc::new(FakeChain::default());
    let fixture = GameFixture::new(3).players(vec![player(1), player(2), PLAYER]);
    let mut stale = fixture.tuple();
    stale[8] = json!(7);
    chain.respond("getGame(3)", stale);
    chain.respond("getGamePlayers(3)", fixture.player_list());

    // when
    let game = client(&chain)
        .with_caller(Some(PLAYER))
        .get_game(3)
        .await
        .unwrap();

    // then
    assert_eq!(game.current_player_count, 3);
    assert_eq!(game.player_list, vec![player(1), player(2), PLAYER]);
    assert!(game.is_player);
    assert!(!game.is_creator);
    assert!(game.can_join);
}

#[tokio::test]
async fn get_game__more_players_than_allowed_is_rejected() {
    let chain = Arc::new(FakeChain::default());
    let mut fixture = GameFixture::new(4).players(vec![player(1), player(2), player(3)]);
    fixture.max_players = 2;
    chain.add_game(&fixture);

    let result = client(&chain).get_game(4).await;

    assert!(matches!(result, Err(ClientError::Decode(_))));
}

#[tokio::test]
async fn get_game__reads_named_outputs_with_currency_decimals() {
    // given
    let chain = Arc::new(FakeChain::default());
    let fixture = GameFixture::new(8)
        .currency(Currency::StableYield, U256::from(5_000_000u64))
        .players(vec![player(1)]);
    chain.respond("getGame(8)", fixture.named());
    chain.respond("getGamePlayers(8)", fixture.player_list());

    // when
    let game = client(&chain)
        .with_caller(Some(CREATOR))
        .get_game(8)
        .await
        .unwrap();

    // then
    assert_eq!(game.game_id, 8);
    assert_eq!(game.currency, Currency::StableYield);
    assert_eq!(game.entry_fee, TokenAmount::from_raw(U256::from(5_000_000u64), 6));
    assert_eq!(game.entry_fee.to_string(), "5");
    assert_eq!(game.name, None);
    assert!(game.is_creator);
    assert!(!game.is_player);
}

#[tokio::test]
async fn get_game__countdown_deadline_is_remaining_plus_now() {
    // given
    let chain = Arc::new(FakeChain::default());
    let fixture = GameFixture::new(5)
        .status(GameStatus::Countdown)
        .players(vec![player(1), player(2)]);
    chain.add_game(&fixture);
    chain.respond("getCountdownRemaining(5)", json!("45"));
    let clock = Arc::new(FixedClock::new(1_700_000_100));

    // when
    let game = client(&chain)
        .with_clock(clock.clone())
        .get_game(5)
        .await
        .unwrap();

    // then
    assert_eq!(game.countdown_deadline, Some(1_700_000_145));
    clock.set(1_700_000_130);
    assert_eq!(game.seconds_until_countdown_ends(clock.now()), Some(15));
    clock.set(1_700_000_200);
    assert_eq!(game.seconds_until_countdown_ends(clock.now()), Some(0));
}

#[tokio::test]
async fn get_game__no_countdown_read_outside_countdown() {
    let chain = Arc::new(FakeChain::default());
    chain.add_game(&GameFixture::new(6).status(GameStatus::InProgress).round(1));

    let game = client(&chain).get_game(6).await.unwrap();

    assert_eq!(game.countdown_deadline, None);
    assert!(!game.can_join);
    assert_eq!(chain.calls_to("getCountdownRemaining"), 0);
}

#[tokio::test]
async fn get_game__zero_creator_or_revert_is_not_found() {
    // given
    let chain = Arc::new(FakeChain::default());
    let mut empty = GameFixture::new(9);
    empty.creator = Address::ZERO;
    chain.add_game(&empty);
    let client = client(&chain);

    // when
    let zero_creator = client.get_game(9).await;
    let missing = client.get_game(99).await;

    // then
    assert_eq!(zero_creator, Err(ClientError::GameNotFound(9)));
    assert_eq!(missing, Err(ClientError::GameNotFound(99)));
}

#[tokio::test]
async fn get_player_info__uses_game_currency_decimals_and_caches_it() {
    // given
    let chain = Arc::new(FakeChain::default());
    let fixture = GameFixture::new(2)
        .currency(Currency::StableYield, U256::from(1_000_000u64))
        .players(vec![PLAYER]);
    chain.add_game(&fixture);
    chain.respond(
        &format!("getPlayerInfo(2,{PLAYER})"),
        json!([true, true, 1, false, 0, "1000000"]),
    );
    let client = client(&chain);

    // when
    let first = client.get_player_info(2, PLAYER).await.unwrap();
    let second = client.get_player_info(2, PLAYER).await.unwrap();

    // then
    assert_eq!(first, second);
    assert!(first.is_playing);
    assert_eq!(first.choice, Some(Choice::Tail));
    assert_eq!(first.entry_amount, TokenAmount::from_raw(U256::from(1_000_000u64), 6));
    assert_eq!(chain.calls_to("getGame"), 1);
}

#[tokio::test]
async fn get_player_info__address_that_never_joined_is_not_a_player() {
    let chain = Arc::new(FakeChain::default());
    chain.add_game(&GameFixture::new(2));
    chain.respond(
        &format!("getPlayerInfo(2,{})", player(7)),
        json!([false, false, 0, false, 0, "0"]),
    );

    let result = client(&chain).get_player_info(2, player(7)).await;

    assert_eq!(result, Err(ClientError::NotAPlayer { game_id: 2 }));
}

#[tokio::test]
async fn get_round_info__decodes_unnamed_outputs() {
    // given
    let chain = Arc::new(FakeChain::default());
    chain.respond("getRoundInfo(2,3)", json!(["1700000300", true, 0]));
    let client = client(&chain);

    // when
    let round = client.get_round_info(2, 3).await.unwrap();
    let missing = client.get_round_info(2, 4).await;

    // then
    assert_eq!(
        round,
        RoundInfo {
            round: 3,
            deadline: 1_700_000_300,
            processed: true,
            winning_choice: Some(Choice::Head),
        }
    );
    assert_eq!(missing, Err(ClientError::RoundNotFound { game_id: 2, round: 4 }));
}

#[tokio::test]
async fn get_creator_stake__active_games_lock_the_stake() {
    // given
    let chain = Arc::new(FakeChain::default());
    chain.respond(
        &format!("getCreatorStake({CREATOR})"),
        json!({
            "stakedAmount": "250000000",
            "yieldAccumulated": "1200000",
            "timestamp": "1700000000",
            "activeGamesCount": "2",
            "hasStaked": true
        }),
    );

    // when
    let stake = client(&chain).get_creator_stake(CREATOR).await.unwrap().unwrap();

    // then
    assert_eq!(stake.staked_amount.to_string(), "250");
    assert_eq!(stake.yield_accumulated.to_string(), "1.2");
    assert_eq!(stake.active_games_count, 2);
    assert_eq!(stake.unstake_gate(), Err(ClientError::StakeLocked { active_games: 2 }));
}

#[tokio::test]
async fn get_creator_stake__never_staked_is_none() {
    let chain = Arc::new(FakeChain::default());
    chain.respond(
        &format!("getCreatorStake({PLAYER})"),
        json!(["0", "0", "0", "0", false]),
    );
    let client = client(&chain);

    assert_eq!(client.get_creator_stake(PLAYER).await, Ok(None));
    assert_eq!(client.get_creator_stake(player(9)).await, Ok(None));
}

#[tokio::test]
async fn observe_game__includes_open_round_and_caller_standing() {
    // given
    let chain = Arc::new(FakeChain::default());
    let fixture = GameFixture::new(11)
        .status(GameStatus::InProgress)
        .round(2)
        .players(vec![PLAYER, player(2)]);
    chain.add_game(&fixture);
    chain.respond("getRoundInfo(11,2)", json!(["1700000600", false, 0]));
    chain.respond(
        &format!("getPlayerInfo(11,{PLAYER})"),
        json!([true, false, 0, false, 0, "1000000000000000"]),
    );

    // when
    let observed = client(&chain)
        .with_caller(Some(PLAYER))
        .observe_game(11)
        .await
        .unwrap();

    // then
    assert_eq!(observed.game.current_round, 2);
    let round = observed.round.unwrap();
    assert!(round.is_open(1_700_000_000));
    assert_eq!(round.winning_choice, None);
    let standing = observed.player.unwrap();
    assert!(!standing.has_made_choice);
    assert_eq!(standing.choice, None);
}

#[tokio::test]
async fn observe_game__spectator_gets_no_player_info() {
    let chain = Arc::new(FakeChain::default());
    chain.add_game(&GameFixture::new(12).players(vec![player(1)]));

    let observed = client(&chain)
        .with_caller(Some(PLAYER))
        .observe_game(12)
        .await
        .unwrap();

    assert_eq!(observed.round, None);
    assert_eq!(observed.player, None);
    assert_eq!(chain.calls_to("getPlayerInfo"), 0);
}
