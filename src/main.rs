use alloy::primitives::Address;
use chrono::DateTime;
use clap::{
    ArgGroup,
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use flip_royale::{
    deployment::{
        AddressBook,
        DeploymentEnv,
        DeploymentStore,
    },
    model::{
        Choice,
        Currency,
        GameRecord,
        ObservedGame,
    },
    network::NetworkGuard,
    reader::GameReadClient,
    rpc_wallet::{
        RpcConnection,
        RpcWallet,
    },
    scheduler::{
        GameStore,
        RefreshScheduler,
    },
    token::TokenLedgerClient,
    wallet::Connection,
    writer::{
        CreateOutcome,
        GameWriteClient,
        StartOutcome,
    },
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};
use url::Url;

const DEFAULT_WALLET_URL: &str = "http://localhost:8545";
const LOG_FILE_PREFIX: &str = "flip-royale.log";

#[derive(Parser, Debug)]
#[command(
    name = "flip-royale",
    about = "Browse, join and play Flip Royale games",
    version,
    group(
        ArgGroup::new("network")
            .args(["local", "dev", "test"])
            .required(true)
    )
)]
struct Args {
    /// Use the local deployment
    #[arg(long)]
    local: bool,

    /// Use the devnet deployment
    #[arg(long)]
    dev: bool,

    /// Use the testnet deployment
    #[arg(long)]
    test: bool,

    /// JSON-RPC endpoint of the wallet that signs transactions
    #[arg(long, default_value = DEFAULT_WALLET_URL)]
    wallet_url: Url,

    /// Override the RPC URL offered to the wallet when it has to add the chain
    #[arg(long)]
    rpc_url: Option<Url>,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the most recent games
    Games,
    /// Show one game
    Game { game_id: u64 },
    /// Show a player's standing in a game
    Player { game_id: u64, address: Address },
    /// Show one round of a game
    Round { game_id: u64, round: u32 },
    /// Show the connected account's balance in one currency, or in every configured one
    Balance { currency: Option<Currency> },
    /// Show creator stake, for the connected account unless an address is given
    StakeInfo { address: Option<Address> },
    /// Create a game
    Create {
        #[arg(long, default_value = "native")]
        currency: Currency,
        /// Entry fee in whole units of the currency, e.g. 0.01
        #[arg(long)]
        entry_fee: String,
        #[arg(long, default_value_t = 10)]
        max_players: u32,
        #[arg(long)]
        name: Option<String>,
    },
    /// Join a game, paying its entry fee
    Join { game_id: u64 },
    /// Pick head or tail for the current round
    Choose { game_id: u64, choice: Choice },
    /// Start a game whose countdown has ended
    Start { game_id: u64 },
    /// Stake creator collateral
    Stake { amount: String },
    /// Withdraw creator collateral
    Unstake,
    /// Follow a game until interrupted
    Watch { game_id: u64 },
}

struct App {
    book: Arc<AddressBook>,
    guard: Arc<NetworkGuard<RpcWallet>>,
    tokens: Arc<TokenLedgerClient>,
    store: GameStore,
}

impl App {
    async fn connect(&self) -> Result<Arc<RpcConnection>> {
        let connection = self.guard.ensure_network().await?;
        Ok(Arc::new(connection))
    }

    async fn reader(&self) -> Result<GameReadClient<Arc<RpcConnection>>> {
        let connection = self.connect().await?;
        let caller = connection.account();
        Ok(GameReadClient::new(connection, Arc::clone(&self.book)).with_caller(Some(caller)))
    }

    fn writer(&self) -> GameWriteClient<RpcWallet> {
        GameWriteClient::new(
            Arc::clone(&self.guard),
            Arc::clone(&self.tokens),
            Arc::clone(&self.book),
            self.store.clone(),
        )
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling::daily(dir, LOG_FILE_PREFIX));
            let _ = fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

async fn handle_interupt() {
    let res = tokio::signal::ctrl_c().await;
    match res {
        Ok(_) => {
            tracing::info!("Received interrupt, exiting");
        }
        Err(_) => {
            tracing::warn!("Received interrupt error, exiting anyway");
        }
    }
}

fn format_time(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|time| time.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_game_row(book: &AddressBook, game: &GameRecord) {
    let mut flags = Vec::new();
    if game.is_creator {
        flags.push("creator");
    }
    if game.is_player {
        flags.push("playing");
    }
    if game.can_join && !game.is_player {
        flags.push("open");
    }
    println!(
        "#{:<5} {:<11} {:>12} {:<6} {:>3}/{:<3} {}  {}",
        game.game_id,
        game.status.to_string(),
        game.entry_fee.to_string(),
        book.symbol(game.currency),
        game.current_player_count,
        game.max_players,
        game.name.as_deref().unwrap_or("-"),
        flags.join(",")
    );
}

fn print_game(book: &AddressBook, game: &GameRecord, now: u64) {
    let symbol = book.symbol(game.currency);
    println!("Game #{}", game.game_id);
    if let Some(name) = &game.name {
        println!("  Name:        {name}");
    }
    println!("  Status:      {}", game.status);
    println!("  Currency:    {} ({symbol})", game.currency);
    println!("  Entry fee:   {} {symbol}", game.entry_fee);
    println!("  Prize pool:  {} {symbol}", game.total_prize_pool);
    println!("  Yield:       {} {symbol}", game.yield_accumulated);
    println!(
        "  Players:     {}/{} (min {})",
        game.current_player_count, game.max_players, game.min_players
    );
    println!("  Round:       {}", game.current_round);
    println!("  Creator:     {}", game.creator);
    if game.start_time > 0 {
        println!("  Started:     {}", format_time(game.start_time));
    }
    if let Some(remaining) = game.seconds_until_countdown_ends(now) {
        println!("  Countdown:   {remaining}s left");
    }
    if let Some(winner) = game.winner {
        println!("  Winner:      {winner}");
    }
    for player in &game.player_list {
        println!("    - {player}");
    }
}

fn print_observed(book: &AddressBook, observed: &ObservedGame, now: u64) {
    print_game(book, &observed.game, now);
    if let Some(round) = &observed.round {
        let state = if round.processed {
            "processed"
        } else if round.is_open(now) {
            "open"
        } else {
            "closed"
        };
        println!(
            "  Round {} {state}, deadline {}",
            round.round,
            format_time(round.deadline)
        );
        if let Some(winning) = round.winning_choice {
            println!("  Winning choice: {winning}");
        }
    }
    if let Some(player) = &observed.player {
        let choice = player
            .choice
            .map(|choice| choice.to_string())
            .unwrap_or_else(|| "none yet".to_string());
        println!(
            "  You: {}, choice {choice}",
            if player.eliminated { "eliminated" } else { "in" }
        );
    }
}

async fn run(command: Command, app: &App) -> Result<()> {
    match command {
        Command::Games => {
            let reader = app.reader().await?;
            let games = reader.list_games().await?;
            if games.is_empty() {
                println!("No games yet");
            }
            for game in &games {
                print_game_row(&app.book, game);
            }
            app.store.set_games(games);
        }
        Command::Game { game_id } => {
            let reader = app.reader().await?;
            let game = reader.get_game(game_id).await?;
            print_game(&app.book, &game, reader.now());
        }
        Command::Player { game_id, address } => {
            let reader = app.reader().await?;
            let info = reader.get_player_info(game_id, address).await?;
            println!("Player {address} in game #{game_id}");
            println!("  Playing:     {}", info.is_playing);
            println!(
                "  Choice:      {}",
                info.choice
                    .map(|choice| choice.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            match info.round_eliminated {
                Some(round) => println!("  Eliminated:  round {round}"),
                None if info.eliminated => println!("  Eliminated:  yes"),
                None => println!("  Eliminated:  no"),
            }
            println!("  Entry:       {}", info.entry_amount);
        }
        Command::Round { game_id, round } => {
            let reader = app.reader().await?;
            let info = reader.get_round_info(game_id, round).await?;
            println!("Round {round} of game #{game_id}");
            println!("  Deadline:    {}", format_time(info.deadline));
            println!("  Processed:   {}", info.processed);
            if let Some(winning) = info.winning_choice {
                println!("  Winning:     {winning}");
            }
        }
        Command::Balance { currency } => {
            let connection = app.connect().await?;
            let currencies = match currency {
                Some(currency) => vec![currency],
                None => Currency::ALL
                    .into_iter()
                    .filter(|currency| app.book.currency(*currency).is_ok())
                    .collect(),
            };
            for currency in currencies {
                let balance = app
                    .tokens
                    .get_balance(connection.as_ref(), connection.account(), currency)
                    .await?;
                println!("{balance} {}", app.book.symbol(currency));
            }
        }
        Command::StakeInfo { address } => {
            let reader = app.reader().await?;
            let creator = address
                .or(reader.caller())
                .ok_or_else(|| eyre!("No address given and no connected account"))?;
            let symbol = app.book.symbol(app.book.stake_currency());
            match reader.get_creator_stake(creator).await? {
                Some(stake) => {
                    println!("Creator stake of {creator}");
                    println!("  Staked:        {} {symbol}", stake.staked_amount);
                    println!("  Yield:         {} {symbol}", stake.yield_accumulated);
                    println!("  Since:         {}", format_time(stake.timestamp));
                    println!("  Active games:  {}", stake.active_games_count);
                }
                None => println!("{creator} has no creator stake"),
            }
        }
        Command::Create {
            currency,
            entry_fee,
            max_players,
            name,
        } => {
            let outcome = app
                .writer()
                .create_game(currency, &entry_fee, max_players, name.as_deref())
                .await?;
            match outcome {
                CreateOutcome::Created(game_id) => println!("Created game #{game_id}"),
                CreateOutcome::Pending { tx_hash } => println!(
                    "Game created in {tx_hash}; its id will appear in the next listing"
                ),
            }
        }
        Command::Join { game_id } => {
            let reader = app.reader().await?;
            let game = reader.get_game(game_id).await?;
            if game.is_player {
                return Err(eyre!("Already playing in game #{game_id}"));
            }
            if !game.can_join {
                return Err(eyre!("Game #{game_id} is {} and cannot be joined", game.status));
            }
            app.store.set_games(vec![game.clone()]);
            app.writer().join_game(game_id, &game.entry_fee).await?;
            println!(
                "Joined game #{game_id} for {} {}",
                game.entry_fee,
                app.book.symbol(game.currency)
            );
        }
        Command::Choose { game_id, choice } => {
            app.writer().make_choice(game_id, choice).await?;
            println!("Chose {choice} in game #{game_id}");
        }
        Command::Start { game_id } => {
            match app.writer().start_game_after_countdown(game_id).await? {
                StartOutcome::Started => println!("Started game #{game_id}"),
                StartOutcome::AlreadyStarted => println!("Game #{game_id} was already started"),
            }
        }
        Command::Stake { amount } => {
            app.writer().stake_as_creator(&amount).await?;
            println!(
                "Staked {amount} {}",
                app.book.symbol(app.book.stake_currency())
            );
        }
        Command::Unstake => {
            let reader = app.reader().await?;
            let creator = reader
                .caller()
                .ok_or_else(|| eyre!("No connected account"))?;
            let stake = reader
                .get_creator_stake(creator)
                .await?
                .ok_or_else(|| eyre!("{creator} has no creator stake to withdraw"))?;
            stake.unstake_gate()?;
            app.writer().unstake_creator().await?;
            println!("Withdrew creator stake");
        }
        Command::Watch { game_id } => watch(app, game_id).await?,
    }
    Ok(())
}

async fn watch(app: &App, game_id: u64) -> Result<()> {
    let reader = Arc::new(app.reader().await?);
    let scheduler = RefreshScheduler::new(
        Arc::clone(&reader),
        app.store.clone(),
        app.book.refresh().clone(),
    );
    let mut updates = scheduler.store().subscribe();
    let watch = scheduler.watch_game(game_id);
    let interrupt = handle_interupt();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if let Some(observed) = &snapshot.observed {
                    println!();
                    print_observed(&app.book, observed, reader.now());
                } else if let Some(error) = &snapshot.last_error {
                    eprintln!("refresh failed: {error}");
                }
            }
        }
    }
    drop(watch);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref());

    let env = if args.local {
        DeploymentEnv::Local
    } else if args.dev {
        DeploymentEnv::Dev
    } else {
        DeploymentEnv::Test
    };
    let store = DeploymentStore::new(env).wrap_err("opening deployment store")?;
    let mut book = AddressBook::load(&store, env)?;
    if let Some(rpc_url) = args.rpc_url {
        book = book.with_rpc_url(rpc_url);
    }
    let book = Arc::new(book);

    let wallet = RpcWallet::new(args.wallet_url.clone(), book.abis().clone())
        .map_err(|err| eyre!("Failed to reach wallet at {}: {err}", args.wallet_url))?;
    let guard = Arc::new(NetworkGuard::new(Arc::new(wallet), book.chain().clone()));
    let tokens = Arc::new(TokenLedgerClient::new(Arc::clone(&book)));
    let app = App {
        book,
        guard,
        tokens,
        store: GameStore::new(),
    };

    tracing::info!(env = %env, "starting flip-royale client");
    run(args.command, &app).await
}
