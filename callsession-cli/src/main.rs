//! Callsession CLI Application

use anyhow::{Context, Result};
use callsession_core::prelude::*;
use callsession_core::RelayEndpoint;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

mod timeline;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file (defaults plus CALLSESSION_* environment otherwise)
    #[arg(short, long, env = "CALLSESSION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a customer and a technician against each other in-process
    Demo {
        /// Call identifier shared by both parties
        #[arg(long, default_value = "demo-ticket")]
        call_id: String,

        /// Negotiation engine
        #[arg(long, value_enum, default_value = "sim")]
        engine: Engine,

        /// Enable video
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        video: bool,

        /// Enable audio
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        audio: bool,

        /// Share the customer's screen once connected
        #[arg(long)]
        screen_share: bool,

        /// How long to stay connected before hanging up, in milliseconds
        #[arg(long, default_value = "500")]
        hold_ms: u64,

        /// Give up if the call does not connect within this many seconds
        #[arg(long, default_value = "15")]
        timeout_secs: u64,
    },

    /// Show the effective configuration
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// In-process simulated peer connection
    Sim,
    /// Real WebRTC stack over loopback
    Webrtc,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callsession=info,callsession_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            call_id,
            engine,
            video,
            audio,
            screen_share,
            hold_ms,
            timeout_secs,
        } => {
            let options = DemoOptions {
                call_id: CallId::new(call_id),
                engine,
                video,
                audio,
                screen_share,
                hold: Duration::from_millis(hold_ms),
                timeout: Duration::from_secs(timeout_secs),
            };
            handle_demo(&config, options).await?;
        }
        Commands::Status => {
            handle_status(&config)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<SessionConfig> {
    let config = match path {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SessionConfig {
            peer: PeerConfig::from_env(),
            ..SessionConfig::default()
        },
    };
    tracing::debug!(
        path = ?path,
        ice_servers = config.peer.ice_servers.len(),
        "Configuration loaded"
    );
    Ok(config)
}

struct DemoOptions {
    call_id: CallId,
    engine: Engine,
    video: bool,
    audio: bool,
    screen_share: bool,
    hold: Duration,
    timeout: Duration,
}

fn peer_factory(engine: Engine, config: &SessionConfig) -> Result<Arc<dyn PeerTransportFactory>> {
    Ok(match engine {
        Engine::Sim => Arc::new(SimulatedTransportFactory::new()),
        Engine::Webrtc => Arc::new(
            WebRtcTransportFactory::new(config.peer.clone())
                .context("creating WebRTC transport factory")?,
        ),
    })
}

fn party(
    engine: Engine,
    config: &SessionConfig,
    relay: RelayEndpoint,
) -> Result<CallManager> {
    Ok(CallManager::new(
        config.call.clone(),
        Arc::new(SyntheticCaptureBackend::new()),
        Arc::new(relay),
        peer_factory(engine, config)?,
    ))
}

fn print_events(
    label: &'static str,
    started: Instant,
    mut events: EventReceiver,
    connected: tokio::sync::oneshot::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connected = Some(connected);
        while let Some(event) = events.recv().await {
            println!("{}", timeline::describe(label, started.elapsed(), &event));
            if matches!(event, CallEvent::Connected { .. }) {
                if let Some(tx) = connected.take() {
                    let _ = tx.send(());
                }
            }
        }
    })
}

async fn handle_demo(config: &SessionConfig, options: DemoOptions) -> Result<()> {
    let call_id = options.call_id;
    println!("📞 Demo call {call_id} ({:?} engine)", options.engine);
    println!(
        "   Video: {} | Audio: {} | Screen share: {}",
        options.video, options.audio, options.screen_share
    );

    let (customer_relay, technician_relay) = InMemoryRelay::pair();
    let customer = party(options.engine, config, customer_relay)?;
    let technician = party(options.engine, config, technician_relay)?;

    let started = Instant::now();
    let (customer_up_tx, customer_up) = tokio::sync::oneshot::channel();
    let (technician_up_tx, technician_up) = tokio::sync::oneshot::channel();
    let printers = [
        print_events("customer", started, customer.subscribe(&call_id), customer_up_tx),
        print_events("technician", started, technician.subscribe(&call_id), technician_up_tx),
    ];

    tokio::try_join!(
        customer.initiate(call_id.clone(), CallRole::Offerer, options.video, options.audio),
        technician.initiate(call_id.clone(), CallRole::Answerer, options.video, options.audio),
    )
    .context("starting the call")?;

    let connected = tokio::time::timeout(options.timeout, async {
        let _ = customer_up.await;
        let _ = technician_up.await;
    })
    .await;
    if connected.is_err() {
        println!("⚠️  Call did not connect within {:?}", options.timeout);
    } else if options.screen_share {
        if customer.start_screen_share(&call_id).await {
            println!("🖥️  Customer is sharing their screen");
            tokio::time::sleep(options.hold / 2).await;
            customer.stop_screen_share(&call_id).await;
            println!("🖥️  Screen share stopped, camera restored");
        } else {
            println!("⚠️  Screen share refused (no video sender or capture denied)");
        }
    }

    tokio::time::sleep(options.hold).await;
    for (label, manager) in [("customer", &customer), ("technician", &technician)] {
        if let Some(info) = manager.session(&call_id) {
            println!("📊 {}", timeline::summary(label, &info));
        }
    }

    customer.end_call(&call_id).await;
    technician.end_call(&call_id).await;
    for printer in printers {
        let _ = printer.await;
    }

    println!("📞 Call ended after {:?}", started.elapsed());
    Ok(())
}

fn handle_status(config: &SessionConfig) -> Result<()> {
    println!("📊 Callsession CLI Status");
    println!("=========================");
    println!(
        "✅ Max concurrent calls: {}",
        config.call.max_concurrent_calls
    );
    for server in &config.peer.ice_servers {
        let auth = if server.username.is_some() {
            " (authenticated)"
        } else {
            ""
        };
        println!("✅ ICE server: {}{auth}", server.urls.join(", "));
    }
    println!();
    println!("Effective configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();
    println!("Available commands:");
    println!("  callsession demo [options]  - Run a two-party call in-process");
    println!("  callsession status          - Show this status");
    println!();
    println!("Use 'callsession --help' for detailed options");

    Ok(())
}
