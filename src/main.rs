use aps_bus::config::{AppConfig, Environment};
use aps_bus::factory::FactoryStateCache;
use aps_bus::gateway::{
    find_response, Dispatcher, FtsGateway, OrderGateway, OrderRequest, SystemGateway,
    WorkpieceType,
};
use aps_bus::lint;
use aps_bus::mqtt::SessionClient;
use aps_bus::refresh::RefreshController;
use aps_bus::registry::{TemplateLibrary, TopicRegistry};
use aps_bus::replay::{load_recording, ReplayEngine, SessionStats};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use rumqttc::QoS;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Scopes watched by `monitor` when no topic is given.
const FACTORY_SCOPES: [&str; 4] = ["ccu/#", "module/#", "fts/#", "/j1/txt/#"];

#[derive(Parser, Debug)]
#[command(name = "aps-bus", version, about = "MQTT session and message routing for the APS factory")]
struct Cli {
    /// Broker environment: live, replay or mock
    #[arg(long, global = true, value_parser = parse_environment)]
    env: Option<Environment>,

    /// Config file, defaults to the per-user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch live traffic
    Monitor {
        #[arg(long = "topic")]
        topics: Vec<String>,
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Record traffic to a SQLite (.db) or JSON lines (.jsonl) file
    Record {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "#")]
        filter: String,
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Publish a recorded session to the selected broker
    Replay {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        #[arg(long = "loop")]
        looping: bool,
    },
    /// Summarise a recorded session
    Analyze {
        #[arg(long)]
        file: PathBuf,
    },
    /// Place a production order with the CCU
    Order {
        #[arg(long, default_value = "BLUE")]
        color: WorkpieceType,
        #[arg(long)]
        erp_id: Option<String>,
    },
    /// Send the FTS to its initial dock position
    Dock {
        #[arg(long)]
        serial: String,
        #[arg(long)]
        node: String,
    },
    /// Reset the factory
    Reset {
        #[arg(long)]
        with_storage: bool,
    },
    /// List registered topics
    Topics {
        #[arg(long)]
        category: Option<String>,
    },
    /// Check a JSON payload against a template
    Validate {
        #[arg(long)]
        template: String,
        #[arg(long)]
        payload: String,
    },
    /// Scan Rust sources for session-layer misuse
    Lint { dir: PathBuf },
}

fn parse_environment(s: &str) -> std::result::Result<Environment, String> {
    s.parse::<Environment>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let mut config = AppConfig::load(cli.config.as_deref())?;
    let default_env = match cli.command {
        Command::Replay { .. } => Environment::Replay,
        _ => config.default_environment,
    };
    config.default_environment = cli.env.unwrap_or(default_env);

    match cli.command {
        Command::Monitor { topics, seconds } => monitor(&config, topics, seconds).await,
        Command::Record {
            out,
            filter,
            seconds,
        } => record(&config, &out, &filter, seconds).await,
        Command::Replay {
            file,
            speed,
            looping,
        } => replay(&config, &file, speed, looping).await,
        Command::Analyze { file } => analyze(&config, &file),
        Command::Order { color, erp_id } => order(&config, color, erp_id).await,
        Command::Dock { serial, node } => {
            let (client, templates) = connect_for_commands(&config).await?;
            let receipt = FtsGateway::new(Dispatcher::new(client.clone(), templates))
                .dock(&serial, &node)
                .map_err(|e| eyre!("Dock command failed: {}", e))?;
            println!("Published to {} (#{})", receipt.topic, receipt.publish_id);
            client.stop().await;
            Ok(())
        }
        Command::Reset { with_storage } => {
            let (client, templates) = connect_for_commands(&config).await?;
            let receipt = SystemGateway::new(Dispatcher::new(client.clone(), templates))
                .with_cache(Arc::new(FactoryStateCache::new()))
                .reset(with_storage)
                .map_err(|e| eyre!("Reset failed: {}", e))?;
            println!("Published to {} (#{})", receipt.topic, receipt.publish_id);
            client.stop().await;
            Ok(())
        }
        Command::Topics { category } => {
            list_topics(&config, category.as_deref());
            Ok(())
        }
        Command::Validate { template, payload } => validate(&config, &template, &payload),
        Command::Lint { dir } => {
            let findings = lint::scan_dir(&dir);
            for finding in &findings {
                println!("{}", finding);
            }
            if findings.is_empty() {
                println!("No findings in {}", dir.display());
                Ok(())
            } else {
                Err(eyre!("{} lint findings", findings.len()))
            }
        }
    }
}

fn setup(verbose: u8) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging(verbose);
    Ok(())
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => builder.with_max_level(level).init(),
    }
}

fn registry_dir(config: &AppConfig) -> PathBuf {
    if config.registry_dir.is_dir() {
        return config.registry_dir.clone();
    }
    let bundled = Path::new(env!("CARGO_MANIFEST_DIR")).join("registry");
    warn!(
        "Registry directory {} not found, using {}",
        config.registry_dir.display(),
        bundled.display()
    );
    bundled
}

/// Resolves on Ctrl-C or after `seconds`, whichever comes first.
async fn wait_for(seconds: Option<u64>) {
    let limit = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = limit => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
}

async fn connect_for_commands(
    config: &AppConfig,
) -> Result<(Arc<SessionClient>, Arc<TemplateLibrary>)> {
    let templates = Arc::new(TemplateLibrary::load(&registry_dir(config)));
    let client = SessionClient::shared(config);
    client
        .connect()
        .await
        .map_err(|e| eyre!("Cannot reach broker {}: {}", client.descriptor(), e))?;
    Ok((client, templates))
}

async fn monitor(config: &AppConfig, topics: Vec<String>, seconds: Option<u64>) -> Result<()> {
    let registry = TopicRegistry::load(&registry_dir(config));
    let topics = if topics.is_empty() {
        FACTORY_SCOPES.iter().map(|s| s.to_string()).collect()
    } else {
        topics
    };

    let client = SessionClient::shared(config);
    client.subscribe_many(&topics, client.descriptor().default_qos)?;
    if let Err(e) = client.connect().await {
        warn!("Broker not reachable yet, retrying in background: {}", e);
    }

    let refresh = RefreshController::from_config(&config.refresh);
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut last_seen = 0;
    let deadline = wait_for(seconds);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tick.tick() => {
                let received = client.status().messages_received;
                if received != last_seen && refresh.request_refresh(false) {
                    last_seen = received;
                    print_summary(&client, &registry);
                }
            }
        }
    }

    client.stop().await;
    Ok(())
}

fn print_summary(client: &SessionClient, registry: &TopicRegistry) {
    let status = client.status();
    println!(
        "[{:?}] {} received, {} published",
        status.state, status.messages_received, status.messages_published
    );
    for pattern in client.buffer_patterns() {
        let Some(latest) = client.latest(&pattern) else {
            continue;
        };
        println!(
            "  {:<20} {:<45} {:<28} {}",
            pattern,
            latest.topic,
            registry.friendly_name(&latest.topic),
            latest.payload.len()
        );
    }
}

async fn record(
    config: &AppConfig,
    out: &Path,
    filter: &str,
    seconds: Option<u64>,
) -> Result<()> {
    let client = SessionClient::shared(config);
    client.subscribe_many([filter], client.descriptor().default_qos)?;
    client.start_recording(out, filter, &config.recorder)?;
    if let Err(e) = client.connect().await {
        warn!("Broker not reachable yet, retrying in background: {}", e);
    }

    info!("Recording {} to {}", filter, out.display());
    wait_for(seconds).await;

    client.stop().await;
    if let Some(status) = client.stop_recording() {
        println!(
            "{} written, {} dropped, {} write errors",
            status.written, status.dropped, status.write_errors
        );
    }
    Ok(())
}

async fn replay(config: &AppConfig, file: &Path, speed: f64, looping: bool) -> Result<()> {
    let client = SessionClient::shared(config);
    client
        .connect()
        .await
        .map_err(|e| eyre!("Cannot reach replay broker {}: {}", client.descriptor(), e))?;

    let mut engine = ReplayEngine::new(client.clone());
    let loaded = engine.load(file)?;
    for warning in engine.warnings() {
        warn!("{}", warning);
    }
    info!("Replaying {} messages at {}x", loaded, speed);
    engine.start(speed, looping).await?;

    tokio::select! {
        _ = engine.join() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    engine.stop().await;

    println!("{} messages published", engine.published_count());
    if let Some(error) = engine.last_error() {
        println!("stopped on error: {}", error);
    }
    client.stop().await;
    Ok(())
}

fn analyze(config: &AppConfig, file: &Path) -> Result<()> {
    let recording = load_recording(file)?;
    for warning in &recording.warnings {
        warn!("{}", warning);
    }
    let registry = TopicRegistry::load(&registry_dir(config));
    print!(
        "{}",
        SessionStats::from_session(&recording.messages, Some(&registry))
    );
    Ok(())
}

async fn order(config: &AppConfig, color: WorkpieceType, erp_id: Option<String>) -> Result<()> {
    let (client, templates) = connect_for_commands(config).await?;
    client.subscribe_many(["ccu/order/response"], QoS::AtLeastOnce)?;

    let request_id = Uuid::new_v4().to_string();
    let mut request = OrderRequest::new(color).with_request_id(request_id.clone());
    if let Some(erp_id) = &erp_id {
        request = request.with_erp_id(erp_id.clone());
    }
    let receipt = OrderGateway::new(Dispatcher::new(client.clone(), templates))
        .send(&request)
        .map_err(|e| eyre!("Order failed: {}", e))?;
    println!("Order published to {} (#{})", receipt.topic, receipt.publish_id);

    let echo = erp_id.unwrap_or(request_id);
    let waited = tokio::time::timeout(RESPONSE_TIMEOUT, async {
        loop {
            if let Some(response) = find_response(&client, &echo) {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;

    match waited {
        Ok(response) => println!("CCU response: {}", response.payload.text()),
        Err(_) => warn!("No order response within {:?}", RESPONSE_TIMEOUT),
    }
    client.stop().await;
    Ok(())
}

fn list_topics(config: &AppConfig, category: Option<&str>) {
    let registry = TopicRegistry::load(&registry_dir(config));
    let entries = match category {
        Some(category) => registry.list_by_category(category),
        None => registry.entries().to_vec(),
    };
    for entry in entries {
        println!(
            "{:<20} {:<45} {:<28} {}",
            entry.category,
            entry.pattern,
            entry.friendly_name,
            entry.template.as_deref().unwrap_or("-")
        );
    }
}

fn validate(config: &AppConfig, template: &str, payload: &str) -> Result<()> {
    let templates = TemplateLibrary::load(&registry_dir(config));
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| eyre!("Payload is not JSON: {}", e))?;
    templates.validate(template, &value)?.into_result(template)?;
    println!("Payload matches {}", template);
    Ok(())
}
