//! Telegauge CLI
//!
//! Terminal front-end for live telemetry feeds:
//! - Watch feeds and print each reading as it arrives
//! - Manage the saved feed list
//! - Generate a default config file

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use telegauge::config::{default_path, generate_default_config, Config, LoggingConfig};
use telegauge::{
    ConnectionManager, Connector, FeedBoard, FeedError, FeedUpdate, MemoryBroker, MqttConnector,
    PayloadNormalizer, TransportScheme,
};

/// Delay before the demo broker accepts a connection
const DEMO_CONNECT_DELAY: Duration = Duration::from_secs(1);

/// Interval between simulated readings in demo mode
const DEMO_PUBLISH_PERIOD: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "telegauge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live telemetry gauges for MQTT topics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: <config dir>/telegauge/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print readings until interrupted
    Watch {
        /// Broker host
        #[arg(long)]
        host: Option<String>,
        /// Broker port
        #[arg(long)]
        port: Option<u16>,
        /// Transport (tcp, ssl, ws, wss)
        #[arg(long)]
        scheme: Option<TransportScheme>,
        /// Client identifier
        #[arg(long)]
        client_id: Option<String>,
        /// Extra feeds as TOPIC or TOPIC=LABEL
        #[arg(short, long = "topic")]
        topics: Vec<String>,
        /// Use the built-in simulated broker
        #[arg(long)]
        demo: bool,
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
        /// Don't write the feed list back on exit
        #[arg(long)]
        no_save: bool,
    },

    /// List saved feeds
    Topics,

    /// Add a feed to the saved list
    Add {
        /// Topic to watch
        topic: String,
        /// Display label (default: the topic)
        #[arg(short, long)]
        label: Option<String>,
    },

    /// Remove a feed from the saved list
    Remove {
        /// Topic to remove
        topic: String,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli
        .config
        .or_else(default_path)
        .unwrap_or_else(|| PathBuf::from("telegauge.toml"));

    match cli.command {
        Commands::Watch {
            host,
            port,
            scheme,
            client_id,
            topics,
            demo,
            format,
            no_save,
        } => {
            let mut config = Config::load_or_default(&path)?;
            init_tracing(&config.logging)?;

            if let Some(host) = host {
                config.broker.host = host;
            }
            if let Some(port) = port {
                config.broker.port = port;
            }
            if let Some(scheme) = scheme {
                config.broker.scheme = scheme;
            }
            if let Some(client_id) = client_id {
                config.broker.client_id = client_id;
            }

            watch(config, &path, &topics, demo, format, !no_save).await?;
        }

        Commands::Topics => {
            let mut config = Config::load_or_default(&path)?;
            config.ensure_default_feed();
            for feed in &config.feeds {
                println!("{}\t{}", feed.topic, feed.label);
            }
        }

        Commands::Add { topic, label } => {
            let mut config = Config::load_or_default(&path)?;
            config.ensure_default_feed();
            let board = FeedBoard::from_feed_configs(&config.feeds);
            let feed = board.add_feed(&topic, label.as_deref())?;
            config.feeds = board.to_feed_configs();
            config.save(&path)?;
            println!("Added {} ({})", feed.topic, feed.label);
        }

        Commands::Remove { topic } => {
            let mut config = Config::load_or_default(&path)?;
            let board = FeedBoard::from_feed_configs(&config.feeds);
            if !board.remove_feed(&topic) {
                bail!("No saved feed for topic '{}'", topic);
            }
            config.feeds = board.to_feed_configs();
            config.save(&path)?;
            println!("Removed {}", topic);
        }

        Commands::Config { output } => {
            let config = generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

async fn watch(
    mut config: Config,
    path: &Path,
    extra_topics: &[String],
    demo: bool,
    format: OutputFormat,
    save: bool,
) -> anyhow::Result<()> {
    config.ensure_default_feed();
    let board = FeedBoard::from_feed_configs(&config.feeds);
    for arg in extra_topics {
        let (topic, label) = parse_topic_arg(arg);
        match board.add_feed(topic, label) {
            Ok(_) | Err(FeedError::Duplicate(_)) => {}
            Err(err) => return Err(err).with_context(|| format!("invalid feed '{}'", arg)),
        }
    }

    let mut simulation = None;
    let connector: Arc<dyn Connector> = if demo {
        let broker = MemoryBroker::with_connect_delay(DEMO_CONNECT_DELAY);
        simulation = Some(broker.start_simulation(DEMO_PUBLISH_PERIOD));
        Arc::new(broker)
    } else {
        Arc::new(MqttConnector::new())
    };

    let (manager, pump) = ConnectionManager::with_options(
        connector,
        config.broker.clone(),
        PayloadNormalizer::new(config.normalizer.field_priority.clone()),
        config.manager.clone(),
    );
    let pump_task = tokio::spawn(pump.run());

    board.attach(&manager);
    let mut updates = board.updates();

    tracing::info!(
        url = %config.broker.broker_url(),
        feeds = board.len(),
        demo,
        "Telegauge v{}",
        env!("CARGO_PKG_VERSION")
    );
    manager.connect(config.broker.clone());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("failed to listen for ctrl-c")?;
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => print_update(&update, format)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind, skipped updates");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("Shutting down...");
    manager.shutdown();
    pump_task.await.context("event pump panicked")?;
    if let Some(simulation) = simulation {
        simulation.abort();
    }

    if save {
        config.feeds = board.to_feed_configs();
        config.save(path)?;
        tracing::info!(path = %path.display(), "Saved feeds");
    }
    Ok(())
}

fn parse_topic_arg(arg: &str) -> (&str, Option<&str>) {
    match arg.split_once('=') {
        Some((topic, label)) => (topic, Some(label)),
        None => (arg, None),
    }
}

fn print_update(update: &FeedUpdate, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(update)?);
        return Ok(());
    }

    match update {
        FeedUpdate::Reading { label, reading } => println!("{}: {:.1}", label, reading.value),
        FeedUpdate::NoData { label, .. } => println!("{}: no data", label),
        FeedUpdate::Connection { state } => println!("[{}]", state),
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("telegauge={}", logging.level)));
    let json = logging.format.eq_ignore_ascii_case("json");

    // Logs go to stderr or the log file so stdout stays free for readings.
    match logging.file.as_deref() {
        Some(file) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .with_context(|| format!("failed to open log file {}", file))?;
            let writer = Mutex::new(file);
            if json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init();
            }
        }
        None => {
            if json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .init();
            }
        }
    }
    Ok(())
}
