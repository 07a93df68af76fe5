use clap::Parser;
use log::{error, info};
use server::api::{self, AppState};
use server::config::Config;
use server::engine::TickEngine;
use server::error::{ServerError, ServerResult};
use server::game::{FrameworkHandle, ModuleRegistry};
use server::intents::IntentQueue;
use server::registry::SubscriptionRegistry;
use server::store::postgres::PostgresStore;
use server::store::Store;
use server::ws;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Command line arguments. Every flag overrides the corresponding config
/// file / environment value.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Configuration file path
    #[clap(short, long, env = "GRID_CONFIG_FILE")]
    config: Option<String>,

    /// Address to bind to
    #[clap(short = 'H', long)]
    host: Option<String>,

    /// HTTP API port
    #[clap(short, long)]
    port: Option<u16>,

    /// WebSocket port
    #[clap(short = 'w', long)]
    ws_port: Option<u16>,

    /// Tick interval in milliseconds
    #[clap(short, long)]
    tick_interval_ms: Option<u64>,

    /// Game module identifier
    #[clap(short, long)]
    game_module: Option<String>,

    /// PostgreSQL connection URL
    #[clap(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> ServerResult<()> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ws_port) = args.ws_port {
        config.ws_port = ws_port;
    }
    if let Some(tick_interval_ms) = args.tick_interval_ms {
        config.tick_interval_ms = tick_interval_ms;
    }
    if let Some(game_module) = args.game_module {
        config.game_module = game_module;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    config.validate()?;
    let config = Arc::new(config);

    info!(
        "starting grid shard server (http: {}:{}, ws: {}:{})",
        config.host, config.port, config.host, config.ws_port
    );
    info!("tick interval: {}ms", config.tick_interval_ms);

    // Losing the store at startup is fatal; the process exits cleanly.
    let store: Arc<dyn Store> = Arc::new(
        PostgresStore::connect(&config.database_url, config.db_max_connections).await?,
    );
    info!("connected to database");

    let registry = Arc::new(SubscriptionRegistry::new());
    let intents = Arc::new(IntentQueue::new());

    let modules = ModuleRegistry::builtin();
    let module = modules.resolve(&config.game_module).ok_or_else(|| {
        error!("available game modules: {:?}", modules.names());
        ServerError::UnknownModule(config.game_module.clone())
    })?;
    module.on_init(FrameworkHandle::new(Arc::clone(&store))).await?;
    info!("loaded game module: {}", config.game_module);

    let engine = TickEngine::new(
        Arc::clone(&store),
        module,
        Arc::clone(&registry),
        Arc::clone(&intents),
        &config,
    );
    engine.start();

    let state = AppState {
        store,
        registry,
        intents,
        engine: Arc::clone(&engine),
        config: Arc::clone(&config),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ws_addr = format!("{}:{}", config.host, config.ws_port);
    let ws_listener = TcpListener::bind(&ws_addr).await?;
    let ws_state = state.clone();
    let ws_task = tokio::spawn(async move {
        ws::run_listener(ws_listener, ws_state, shutdown_rx).await;
    });

    let http_addr = format!("{}:{}", config.host, config.port);
    let http_listener = TcpListener::bind(&http_addr).await?;
    info!("http api listening on {http_addr}");

    let router = api::router(state);
    axum::serve(http_listener, router)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {err}");
            }
            info!("shutdown signal received");
        })
        .await?;

    // Shutdown order: stop accepting connections, then let the engine finish
    // or roll back its in-flight tick.
    let _ = shutdown_tx.send(true);
    engine.stop().await;
    ws_task.abort();
    info!("grid shard server stopped");

    Ok(())
}
