//! Registry node for manual and multi-process testing.
//!
//! Joins the registry in Redis and prints its view as one JSON line per
//! heartbeat interval until Ctrl+C or SIGTERM, then deregisters.
//!
//! Run: SERVER_ID=game-1 cargo run -p server-registry --bin registry_node

use dotenv::dotenv;
use server_registry::{
    start_registry, stop_registry, MembershipEvent, RedisStore, RegistryConfig, ServerRegistry,
};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let is_production = std::env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, deregistering"),
        _ = terminate => tracing::info!("Received SIGTERM, deregistering"),
    }
}

fn print_status(event: &str, registry: &ServerRegistry) {
    let snapshot = registry.snapshot().load();
    let servers: Vec<&str> = snapshot.server_ids().collect();
    let status = serde_json::json!({
        "event": event,
        "id": registry.server_id(),
        "count": snapshot.count(),
        "index": snapshot.index_or_sentinel(),
        "servers": servers,
        "updated_at": snapshot.updated_at(),
    });
    println!("{status}");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    let config = RegistryConfig::from_env()?;
    let interval = config.heartbeat_interval;

    let store = RedisStore::connect(&redis_url).await?;
    let registry = start_registry(store, config).await?;
    print_status("ready", &registry);

    let mut events = registry.subscribe();
    let mut status_timer = tokio::time::interval(interval);
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status_timer.tick() => print_status("status", &registry),
            event = events.recv() => match event {
                Ok(MembershipEvent::Joined(id)) => print_status(&format!("joined:{id}"), &registry),
                Ok(MembershipEvent::Left(id)) => print_status(&format!("left:{id}"), &registry),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Membership events lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    stop_registry(&registry).await;
    print_status("stopped", &registry);
    Ok(())
}
