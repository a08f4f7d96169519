mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::BotConfig;
use hedgebot_brokers_metatrader::{retcode, Credentials, MetaTraderBroker};
use hedgebot_core::ExitReason;
use hedgebot_engine::{run_replay, ReplaySummary, Runner};
use rust_decimal::Decimal;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "hedgebot")]
#[command(about = "Hedging ladder trading bot for MetaTrader 5")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trade live through the MetaTrader bridge
    Run {
        /// Path to the TOML config file
        #[arg(short, long, default_value = "config/bot.toml")]
        config: PathBuf,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Replay historical candles against the paper broker
    Replay {
        /// Path to the TOML config file
        #[arg(short, long, default_value = "config/bot.toml")]
        config: PathBuf,

        /// CSV file with OHLC candles
        #[arg(short, long)]
        data: PathBuf,

        /// Starting balance (overrides [replay].balance)
        #[arg(long)]
        balance: Option<Decimal>,

        /// Spread in price units (overrides [replay].spread)
        #[arg(long)]
        spread: Option<Decimal>,
    },

    /// Validate a config file and print the effective settings
    CheckConfig {
        /// Path to the TOML config file
        #[arg(short, long, default_value = "config/bot.toml")]
        config: PathBuf,
    },

    /// Print the MT5 trade-server return codes
    Retcodes,
}

/// Trading account login, taken from the environment.
#[derive(Args)]
struct CredentialArgs {
    /// Account number
    #[arg(long, env = "MT5_LOGIN")]
    login: u64,

    /// Account password
    #[arg(long, env = "MT5_PASSWORD", hide_env_values = true)]
    password: String,

    /// Trade server name
    #[arg(long, env = "MT5_SERVER")]
    server: String,
}

impl From<CredentialArgs> for Credentials {
    fn from(args: CredentialArgs) -> Self {
        Credentials {
            login: args.login,
            password: args.password,
            server: args.server,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.log_json {
        fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    match cli.command {
        Commands::Run { config, credentials } => run_live(config, credentials.into()).await?,
        Commands::Replay {
            config,
            data,
            balance,
            spread,
        } => replay(config, data, balance, spread).await?,
        Commands::CheckConfig { config } => check_config(config)?,
        Commands::Retcodes => {
            println!("MT5 trade server return codes:");
            for (code, reason) in retcode::TABLE {
                println!("  {:>5}  {}", code, reason);
            }
        }
    }

    Ok(())
}

async fn run_live(path: PathBuf, credentials: Credentials) -> Result<()> {
    let config = BotConfig::load(&path)?;
    config.validate().context("Invalid configuration")?;

    info!(
        config = %path.display(),
        symbol = %config.symbol,
        timeframe = %config.timeframe,
        bridge = %format!("{}:{}", config.broker.bridge.host, config.broker.bridge.port),
        login = credentials.login,
        server = %credentials.server,
        "Starting hedgebot"
    );

    let broker = MetaTraderBroker::new(config.broker.bridge.clone(), credentials);
    let summary = Runner::new(config.runner(), broker)
        .run()
        .await
        .context("Trading loop failed")?;

    println!(
        "Stopped after {} polls: {} ladders opened, {} closed",
        summary.polls, summary.ladders_opened, summary.ladders_closed
    );
    Ok(())
}

async fn replay(path: PathBuf, data: PathBuf, balance: Option<Decimal>, spread: Option<Decimal>) -> Result<()> {
    let config = BotConfig::load(&path)?;
    config.validate().context("Invalid configuration")?;

    let candles = hedgebot_data::load_candles(&data)
        .with_context(|| format!("Failed to load candles from {}", data.display()))?;
    if candles.is_empty() {
        anyhow::bail!("No candles in {}", data.display());
    }
    info!(candles = candles.len(), data = %data.display(), "Loaded historical data");

    let mut account = config.replay_account();
    if let Some(balance) = balance {
        account.initial_balance = balance;
    }
    if let Some(spread) = spread {
        account.spread = spread;
    }

    let summary = run_replay(&candles, config.controller(), config.replay_symbol(), account)
        .await
        .context("Replay failed")?;
    print_summary(&config.symbol, &summary);
    Ok(())
}

fn print_summary(symbol: &str, summary: &ReplaySummary) {
    let sep = "=".repeat(60);
    println!("\n{sep}");
    println!("  REPLAY RESULTS");
    println!("{sep}");
    println!("  Symbol:          {}", symbol);
    println!("  Candles:         {}", summary.candles);
    println!("  Ladders opened:  {}", summary.ladders_opened);
    println!("  Ladders closed:  {}", summary.exits.len());
    for reason in [
        ExitReason::TakeProfit,
        ExitReason::ProfitTarget,
        ExitReason::LossLimit,
        ExitReason::Desync,
        ExitReason::Exhausted,
        ExitReason::PlacementFailed,
    ] {
        let count = summary.exits_by(reason);
        if count > 0 {
            println!("    {:<16} {}", reason.to_string(), count);
        }
    }
    println!("  Deepest rung:    {}", summary.deepest_rung);
    println!("  Deals:           {}", summary.deals);
    println!("  Start balance:   {:.2}", summary.start_balance);
    println!("  Final balance:   {:.2}", summary.final_balance);
    println!("  Final equity:    {:.2}", summary.final_equity);
    println!("  Net profit:      {:.2}", summary.net_profit());
    if summary.open_at_end {
        println!("  (a ladder was still open on the last candle)");
    }
    println!("{sep}\n");
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = BotConfig::load(&path)?;
    config.validate().context("Invalid configuration")?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
    println!("# {} is valid\n", path.display());
    println!("{}", rendered);
    Ok(())
}
