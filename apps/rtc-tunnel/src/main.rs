use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rtc_tunnel::TunnelConfig;
use rtc_tunnel::engine::webrtc::WebRtcEngine;
use rtc_tunnel::relay;
use rtc_tunnel::signal::{BusSignalTransport, SignalInitiator, SignalResponder};
use rtc_tunnel::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use signal_bus::{Bus, KoshareClient};
use tokio::net::TcpListener;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = TunnelConfig::from_env().context("invalid tunnel configuration")?;
    let bus: Arc<dyn Bus> = Arc::new(
        KoshareClient::connect(&cli.bus, cli.prefix.clone())
            .await
            .with_context(|| format!("unable to reach signaling bus {}", cli.bus))?,
    );
    let transport = Arc::new(BusSignalTransport::new(bus));

    match cli.command {
        Command::Server(args) => serve(args, transport, config).await,
        Command::Client(args) => dial(args, transport, config).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "rtc-tunnel",
    about = "Tunnel TCP connections over WebRTC data channels",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "RTC_TUNNEL_BUS",
        default_value = "ws://127.0.0.1:8080/",
        help = "Websocket endpoint of the koshare signaling router"
    )]
    bus: String,

    #[arg(
        long,
        global = true,
        env = "RTC_TUNNEL_PREFIX",
        default_value = "",
        help = "Prefix applied to every signaling topic"
    )]
    prefix: String,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "RTC_TUNNEL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "RTC_TUNNEL_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept tunnels and forward their streams to a local address
    Server(ServerArgs),
    /// Open a tunnel and expose it on a local port
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    #[arg(long, help = "Signaling id other peers connect to")]
    id: String,

    #[arg(long, value_name = "ADDR", help = "Address every tunneled stream is connected to")]
    forward: String,
}

#[derive(Args, Debug)]
struct ClientArgs {
    #[arg(long, help = "Signaling id of this client")]
    id: String,

    #[arg(long, value_name = "ID", help = "Signaling id of the server to tunnel to")]
    server: String,

    #[arg(
        long,
        value_name = "ADDR",
        default_value = "127.0.0.1:1082",
        help = "Local address accepting connections to tunnel"
    )]
    listen: String,
}

async fn serve(
    args: ServerArgs,
    transport: Arc<BusSignalTransport>,
    config: TunnelConfig,
) -> anyhow::Result<()> {
    let signal = SignalResponder::new(args.id.clone(), transport);
    let engine = Arc::new(WebRtcEngine::new());
    let mut listener = rtc_tunnel::listen(signal, engine, config).await?;
    println!("🔌 waiting for tunnels as '{}'", args.id);

    while let Some(connection) = listener.accept().await {
        info!(remote_id = %connection.remote_id(), "tunnel accepted");
        let target = args.forward.clone();
        tokio::spawn(async move {
            if let Err(err) = relay::forward_streams(connection, target).await {
                tracing::warn!(error = %err, "forwarding stopped");
            }
        });
    }
    Ok(())
}

async fn dial(
    args: ClientArgs,
    transport: Arc<BusSignalTransport>,
    config: TunnelConfig,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("unable to listen on {}", args.listen))?;
    let signal = SignalInitiator::new(args.id, transport);
    let engine = WebRtcEngine::new();
    let connection = rtc_tunnel::connect(signal, &args.server, &engine, &config)
        .await
        .with_context(|| format!("unable to connect to '{}'", args.server))?;
    println!(
        "🔌 tunnel to '{}' listening on {}",
        args.server, args.listen
    );
    relay::serve_local(listener, connection).await?;
    Ok(())
}
