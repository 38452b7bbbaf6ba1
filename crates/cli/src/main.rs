use std::path::PathBuf;

use {
    anyhow::Context,
    beacon_config::BeaconConfig,
    beacon_protocol::{Message, NEW_MESSAGE_TOPIC},
    beacon_store::{DurableStore, RedisStore},
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "beacon", about = "Beacon realtime message-delivery gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of searching the default locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Durable store URL, e.g. redis://localhost:6379/1.
        #[arg(long)]
        store_url: Option<String>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Publish one message onto the ingress topic.
    Publish {
        /// Recipient user id.
        #[arg(long)]
        to: i64,
        /// Sender user id.
        #[arg(long)]
        from: i64,
        #[arg(short, long)]
        message: String,
        #[arg(long, default_value_t = 0)]
        conversation: i64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<BeaconConfig> {
    match path {
        Some(path) => {
            let mut config = beacon_config::load_config(path)?;
            beacon_config::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
            Ok(config)
        },
        None => Ok(beacon_config::discover_and_load()),
    }
}

async fn publish(config: &BeaconConfig, message: Message) -> anyhow::Result<()> {
    let store = RedisStore::connect(&config.store.url)
        .await
        .with_context(|| format!("connecting to store at {}", config.store.url))?;
    let payload = serde_json::to_string(&message)?;
    store.publish(NEW_MESSAGE_TOPIC, &payload).await?;
    info!(
        message_id = %message.message_id,
        recipient_id = message.recipient_id,
        "message published"
    );
    println!("{}", message.message_id);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Gateway {
            bind,
            port,
            store_url,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(url) = store_url {
                config.store.url = url;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "beacon starting");
            beacon_gateway::start_gateway(config).await
        },
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            print!("{}", beacon_config::to_toml(&config)?);
            Ok(())
        },
        Commands::Publish {
            to,
            from,
            message,
            conversation,
        } => publish(&config, Message::new(from, to, conversation, message)).await,
    }
}
