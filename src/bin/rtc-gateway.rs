use anyhow::{Context, Result};
use clap::Parser;
use rtc_gateway::http::{self, AppState};
use rtc_gateway::{init_logging, CredentialIssuer, ServerConfig, SignalingHub, TurnServer};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "RTC Gateway - WebRTC signaling and TURN server", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// TURN listening port
    #[arg(long)]
    turn_port: Option<u16>,

    /// Public IP advertised in relay addresses
    #[arg(long)]
    public_ip: Option<IpAddr>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn load_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.general.bind = bind;
        }
        if let Some(port) = self.port {
            config.general.port = port;
        }
        if let Some(port) = self.turn_port {
            config.turn.port = port;
        }
        if let Some(ip) = self.public_ip {
            config.turn.public_ip = ip;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = Arc::new(args.load_config()?);
    info!("RTC Gateway v{}", rtc_gateway::VERSION);

    let issuer = Arc::new(CredentialIssuer::from_config(&config.turn, &config.general.domain));
    let hub = Arc::new(SignalingHub::new());

    let (turn, listeners) = if config.turn.enabled {
        let server = Arc::new(TurnServer::new(config.turn.clone(), issuer.clone()));
        let listeners = server.start().await.context("starting TURN server")?;
        (Some(server), Some(listeners))
    } else {
        warn!("TURN server disabled");
        (None, None)
    };

    let state = AppState {
        hub,
        issuer,
        turn: turn.clone(),
        config: config.clone(),
    };

    let listener = TcpListener::bind(config.general.listen_addr())
        .await
        .with_context(|| format!("binding {}", config.general.listen_addr()))?;

    tokio::select! {
        result = http::serve(listener, state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    if let Some(listeners) = listeners {
        listeners.abort();
    }
    if let Some(turn) = turn {
        turn.allocations().shutdown().await;
    }

    Ok(())
}
