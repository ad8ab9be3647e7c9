use bytes::Bytes;
use clap::Parser;
use peerlink::config::{self, AdmissionProfile, Config};
use peerlink::error::{AppError, ConnectionError};
use peerlink::network::admission::{IpMarshall, SweepSummary};
use peerlink::network::codec::{BasicCodec, MemorySendCache};
use peerlink::network::connection::ConnectionContext;
use peerlink::network::connection_manager::ConnectionManager;
use peerlink::network::connector::DualStackConnector;
use peerlink::network::events::{ConnectionInfo, ConnectionObserver, ObserverSet};
use peerlink::network::server::{ServerStatus, TcpServer};
use peerlink::shutdown::ShutdownManager;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "peerlinkd")]
#[command(about = "peerlink P2P transport daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "peerlink.toml")]
    config: String,

    /// Override the listen address (`ip` or `ip:port`)
    #[arg(long)]
    listen_addr: Option<String>,

    /// Extra peer to dial at startup (`host:port`); may be repeated
    #[arg(long)]
    connect: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            let short_name = hostname_str.split('.').next().unwrap_or(&hostname_str);
            eprintln!("\n╔═══════════════════════════════════════════╗");
            eprintln!("║  🖥️  NODE: {:<30} ║", short_name);
            eprintln!("╚═══════════════════════════════════════════╝\n");
        }
    }

    if args.generate_config {
        let mut config = Config::default();
        config.node.peer_uuid = uuid::Uuid::new_v4().to_string();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(listen) = &args.listen_addr {
        if let Err(e) = apply_listen_override(&mut config, listen) {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    }
    config.network.bootstrap_peers.extend(args.connect.iter().cloned());

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");
    info!(
        "🚀 peerlinkd v{} ({}, built {}) starting as '{}'",
        version, git_hash, build_date, config.node.name
    );

    if let Err(e) = run(config).await {
        error!("❌ {}", e);
        std::process::exit(1);
    }
}

fn apply_listen_override(config: &mut Config, listen: &str) -> Result<(), AppError> {
    if let Ok(addr) = listen.parse::<SocketAddr>() {
        config.network.listen_address = addr.ip().to_string();
        config.network.port = addr.port();
    } else if let Ok(ip) = listen.parse::<IpAddr>() {
        config.network.listen_address = ip.to_string();
    } else {
        return Err(AppError::Config(format!(
            "Invalid --listen-addr '{}'",
            listen
        )));
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), AppError> {
    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();

    let (codec, mut inbound) =
        BasicCodec::new(Bytes::from(config.node.handshake_payload.clone().into_bytes()));
    if config.node.handshake_payload.is_empty() {
        warn!("⚠️  node.handshake_payload is empty: outbound connections will be refused");
    }
    let send_cache = MemorySendCache::new(
        config.network.send_cache_capacity,
        Duration::from_secs(config.network.send_cache_ttl_secs),
    );
    let observers = ObserverSet::new().with(Arc::new(PeerLog));

    let mut context = ConnectionContext::new(
        config.peer_uuid()?,
        Arc::new(codec),
        Arc::new(send_cache),
        Arc::new(observers),
    );
    context.compression = config.network.compression;
    context.strategy = config.network.transport;
    context.connect_timeout = Duration::from_secs(config.network.connect_timeout_secs);
    context.handshake_timeout = Duration::from_secs(config.network.handshake_timeout_secs);
    context.read_cycle = Duration::from_millis(config.network.read_cycle_ms.max(1));
    context.inline_limit = config.network.inline_limit_bytes;
    let context = Arc::new(context);

    let (whitelist, banned) = config.admission.access_lists()?;
    let profile = match config.admission.profile {
        AdmissionProfile::General => "general",
        AdmissionProfile::Strict => "strict",
    };
    let marshall = Arc::new(IpMarshall::with_access_rules(
        profile,
        config.admission.settings(),
        whitelist,
        banned,
    ));

    let registry = ConnectionManager::new();
    registry.start_sweep(
        &shutdown_token,
        Duration::from_secs(config.network.keepalive_sweep_secs.max(1)),
    );

    let server = Arc::new(TcpServer::bind(
        &config.server_settings()?,
        context.clone(),
        marshall.clone(),
        registry.clone(),
    )?);
    let mut new_connections = server.subscribe();

    // Accept loop; a faulted listener takes the daemon down with it
    let server_handle = {
        let server = server.clone();
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            if let ServerStatus::Faulted(reason) = server.run(token.child_token()).await {
                error!("💀 Listener faulted, shutting down: {}", reason);
                token.cancel();
            }
        })
    };
    shutdown_manager.register_task("server", server_handle);

    let sweep_handle = {
        let marshall = marshall.clone();
        let token = shutdown_token.child_token();
        let period = marshall.settings().cleanup_period.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = marshall.periodic_sweep(false);
                        if summary != SweepSummary::default() {
                            debug!("🧹 Admission sweep: {:?}", summary);
                        }
                    }
                }
            }
        })
    };
    shutdown_manager.register_task("admission-sweep", sweep_handle);

    let events_handle = {
        let token = shutdown_token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = new_connections.recv() => match accepted {
                        Ok(connection) => info!(
                            "✅ Peer {} ready ({})",
                            connection.info(),
                            connection
                                .peer_uuid()
                                .map(|u| u.to_string())
                                .unwrap_or_default()
                        ),
                        Err(RecvError::Lagged(missed)) => {
                            warn!("⚠️  Missed {} new-connection notifications", missed)
                        }
                        Err(RecvError::Closed) => break,
                    },
                    message = inbound.recv() => match message {
                        Some(message) => debug!(
                            "📨 #{} sent type {} ({} bytes{})",
                            message.connection_id,
                            message.header.message_type,
                            message.header.total_len,
                            if message.header.split { ", by reference" } else { "" }
                        ),
                        None => break,
                    },
                }
            }
        })
    };
    shutdown_manager.register_task("events", events_handle);

    let endpoints = config.bootstrap_endpoints()?;
    if !endpoints.is_empty() {
        let connector = Arc::new(DualStackConnector::new(config.connector_settings()));
        for endpoint in endpoints {
            let connector = connector.clone();
            let registry = registry.clone();
            let context = context.clone();
            let token = shutdown_token.child_token();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = registry.connect(&endpoint, &connector, context) => match result {
                        Ok(connection) => info!("✅ Connected to bootstrap peer {}", connection.info()),
                        Err(e) => warn!("❌ Bootstrap peer {} unreachable: {}", endpoint, e),
                    },
                }
            });
            shutdown_manager.register_task("bootstrap", handle);
        }
    }

    info!(
        "👂 Node ready on {} ({} admission)",
        server.local_addr(),
        profile
    );
    shutdown_manager.wait_for_shutdown().await;

    registry.stop_sweep().await;
    registry.close_all().await;
    let stats = marshall.stats();
    info!(
        "👋 Stopped ({} watched, {} banned, {} permanent)",
        stats.watchlist, stats.blacklist, stats.permanent_bans
    );
    Ok(())
}

/// Logs peer lifecycle events the connection itself doesn't report.
struct PeerLog;

impl ConnectionObserver for PeerLog {
    fn on_disconnected(&self, info: &ConnectionInfo, error: Option<&ConnectionError>) {
        match error {
            Some(e) => debug!("👋 Peer {} disconnected: {}", info, e),
            None => debug!("👋 Peer {} disconnected", info),
        }
    }

    fn on_unexpected_error(&self, info: &ConnectionInfo, error: &ConnectionError) {
        error!("❌ Unexpected error on {}: {}", info, error);
    }
}

fn setup_logging(
    config: &config::LoggingConfig,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    if config.output == "file" {
        let path = Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|f| f.to_os_string())
            .unwrap_or_else(|| "peerlink.log".into());
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));

        if config.format == "json" {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        } else {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
        return Some(guard);
    }

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ if is_systemd => {
            // journald adds its own timestamp and hostname
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .without_time()
                .compact()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }
    None
}

// UTC time plus the short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();

        // "2025-12-10 18:09:43.150 [server1]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
