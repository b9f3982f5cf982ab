use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rsibot::api::{BinanceKlineStream, BinanceRestClient};
use rsibot::notify::{sink_from_env, Notifier};
use rsibot::{Result, Settings, StreamSupervisor, TradingEngine};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "rsibot=info";

/// Paper-trade RSI / signal-line crossovers on a live kline stream
#[derive(Debug, Parser)]
#[command(name = "rsibot", version, about)]
struct Cli {
    /// TOML settings file (optional, defaults apply when missing)
    #[arg(short, long, default_value = "rsibot.toml")]
    config: PathBuf,

    /// Tracing filter, overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,

    /// Instrument to trade, overrides the settings file
    #[arg(short, long)]
    symbol: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.log_filter.as_deref());

    let mut settings = Settings::load(Some(&cli.config))?;
    if let Some(symbol) = cli.symbol {
        settings.symbol = symbol.to_uppercase();
    }
    settings.validate()?;

    tracing::info!("🚀 rsibot starting");
    log_settings(&settings);

    let sink = sink_from_env()?;
    let (notifier, notifier_task) = Notifier::new(sink, settings.symbol.clone()).spawn();
    notifier.text(format!(
        "🤖 *rsibot* paper trading `{}` on {} candles · balance `${:.2}`",
        settings.symbol, settings.signal_interval, settings.initial_balance
    ));

    let snapshots = BinanceRestClient::new(
        settings.stream.rest_base_url.clone(),
        Duration::from_secs(settings.stream.snapshot_timeout_secs),
    )?;
    let feed = BinanceKlineStream::new(settings.stream.ws_base_url.clone());
    let engine = TradingEngine::new(&settings)?;

    let mut supervisor = StreamSupervisor::new(
        settings.supervisor(),
        Arc::new(feed),
        Arc::new(snapshots),
        engine,
        notifier.clone(),
    );

    tracing::info!("Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        _ = supervisor.run() => {
            tracing::error!("Supervisor exited unexpectedly");
        }
    }

    let engine = supervisor.engine();
    let ledger = engine.positions().ledger().snapshot();
    if let Some(position) = engine.positions().position() {
        tracing::info!(
            entry = position.entry_price,
            stop = position.current_stop_price,
            stage = position.stage.label(),
            "Position left open at shutdown"
        );
    }
    tracing::info!(
        balance = %format!("{:.2}", ledger.balance),
        net_pnl = %format!("{:+.2}", ledger.net_pnl()),
        trades = ledger.total_trades,
        wins = ledger.wins,
        losses = ledger.losses,
        win_rate = %format!("{:.1}%", ledger.win_rate() * 100.0),
        "📊 Session summary"
    );

    // Flush pending notifications
    drop(supervisor);
    drop(notifier);
    if tokio::time::timeout(Duration::from_secs(5), notifier_task)
        .await
        .is_err()
    {
        tracing::warn!("Notifier did not drain in time");
    }

    tracing::info!("👋 rsibot stopped");
    Ok(())
}

fn setup_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_settings(settings: &Settings) {
    let t = settings.stage_thresholds;
    let k = settings.stop_multipliers;
    tracing::info!("📊 Configuration:");
    tracing::info!(
        "  Symbol: {} ({} ticks, {} signal candles)",
        settings.symbol,
        settings.tick_interval,
        settings.signal_interval
    );
    tracing::info!(
        "  RSI {} / {:?} {}",
        settings.oscillator_period,
        settings.signal_smoothing,
        settings.signal_smoothing_period
    );
    tracing::info!(
        "  Risk {}% of ${:.2}, stop buffer {}%",
        settings.risk_percent_of_balance * 100.0,
        settings.initial_balance,
        settings.stop_buffer_pct * 100.0
    );
    tracing::info!(
        "  Stages at {}R / {}R / {}R, stops {}R / +{}R / +{}R, partial {}%",
        t.t0,
        t.t1,
        t.t2,
        -k.k0,
        k.k1,
        k.k2,
        settings.partial_exit_fraction * 100.0
    );
    match settings.take_profit_r {
        Some(target) => tracing::info!("  Take profit at {}R", target),
        None => tracing::info!("  No take profit, trailing stop only"),
    }
}
