use clap::Parser;
use rsibot::api::NotificationSink;
use rsibot::notify::sink_from_env;
use rsibot::Result;

/// Send one message through the configured notification channel
#[derive(Debug, Parser)]
#[command(name = "ping_notifier", about)]
struct Cli {
    #[arg(short, long, default_value = "🏓 rsibot notifier ping")]
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("rsibot=info,ping_notifier=info")
        .init();

    let cli = Cli::parse();
    let sink = sink_from_env()?;

    let handle = sink.send(&cli.message).await?;
    tracing::info!(message_id = handle.0, "✓ Notification delivered");
    Ok(())
}
