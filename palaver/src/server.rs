use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use palaver_backend::auth::StoreAuthProvider;
use palaver_backend::settings::Settings;
use palaver_backend::store::StoreHandle;
use palaver_core::xml::stream_parser::quick_xml::QuickXmlStreamParser;
use palaver_inbound::connection::tcp::TcpConnection;
use palaver_inbound::InboundStream;
use palaver_services::registry::ResourceRegistry;
use palaver_services::router::Router;

/// How long draining connections get after a shutdown broadcast.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub async fn run(settings: Settings, store: StoreHandle) -> Result<(), Error> {
    let tls_config = settings.tls.server_config()?;
    let inbound_config = settings.inbound_config()?;
    let registry = Arc::new(ResourceRegistry::new(settings.conflict_policy()));
    let router = Arc::new(Router::new(
        registry.clone(),
        settings.server.domain.clone(),
        settings.server.virtual_hosts.clone(),
    ));
    let provider = StoreAuthProvider::new(store, settings.server.domain.clone());

    let listener = TcpListener::bind(("0.0.0.0", settings.server.port)).await?;
    info!(
        port = settings.server.port,
        domain = %settings.server.domain,
        tls = settings.tls.enabled,
        "listening for client connections"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let per_ip_connections = Arc::new(DashMap::<IpAddr, usize>::new());
    let mut connection_tasks = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "accept failed");
                        continue;
                    }
                };

                while connection_tasks.try_join_next().is_some() {}

                if connection_tasks.len() >= settings.connection.max_connections {
                    debug!(%addr, "refusing connection, server is full");
                    continue;
                }
                let ip = addr.ip();
                let connections_from_ip =
                    per_ip_connections.get(&ip).map(|count| *count).unwrap_or(0);
                if connections_from_ip >= settings.connection.max_connections_per_ip {
                    debug!(%addr, "refusing connection, per-address limit reached");
                    continue;
                }
                *per_ip_connections.entry(ip).or_insert(0) += 1;

                let connection = TcpConnection::new(socket, tls_config.clone());
                let stream = InboundStream::<_, QuickXmlStreamParser<_>, _>::new(
                    connection,
                    router.clone(),
                    registry.clone(),
                    provider.clone(),
                    inbound_config.clone(),
                    shutdown_rx.clone(),
                );

                let per_ip_connections = per_ip_connections.clone();
                connection_tasks.spawn(async move {
                    stream.handle().await;
                    if let Some(mut count) = per_ip_connections.get_mut(&ip) {
                        *count = count.saturating_sub(1);
                    }
                    per_ip_connections.remove_if(&ip, |_, count| *count == 0);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    // Stop accepting, tell every connection to wind down, then give the
    // drain a bounded amount of time before aborting stragglers.
    drop(listener);
    let _ = shutdown_tx.send(true);
    let drain = async {
        while connection_tasks.join_next().await.is_some() {}
    };
    if timeout(DRAIN_DEADLINE, drain).await.is_err() {
        warn!("drain deadline exceeded, aborting remaining connections");
        connection_tasks.shutdown().await;
    }

    Ok(())
}
