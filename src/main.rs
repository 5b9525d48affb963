use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use campusd::campus::CampusManager;
use campusd::identity::{Directory, IdentityProvider};
use campusd::limits::MAX_CONNECTIONS;
use campusd::observability;
use campusd::wire;

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable ({e}), ctrl-c only");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = env_parsed("CAMPUSD_METRICS_PORT");
    observability::init(metrics_port);

    let port = std::env::var("CAMPUSD_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("CAMPUSD_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("CAMPUSD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("CAMPUSD_PASSWORD").unwrap_or_else(|_| "campusd".into());
    let admins = std::env::var("CAMPUSD_ADMINS").unwrap_or_default();
    let max_connections: usize = env_parsed("CAMPUSD_MAX_CONNECTIONS").unwrap_or(MAX_CONNECTIONS);
    let compact_threshold: u64 = env_parsed("CAMPUSD_COMPACT_THRESHOLD").unwrap_or(1000);

    let tls_cert = std::env::var("CAMPUSD_TLS_CERT").ok();
    let tls_key = std::env::var("CAMPUSD_TLS_KEY").ok();
    let tls_acceptor = campusd::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;

    let campuses = Arc::new(CampusManager::new(PathBuf::from(&data_dir), compact_threshold));
    let directory = Directory::from_admin_list(&admins);
    let identity: Arc<dyn IdentityProvider> = Arc::new(directory);
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("campusd listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  admins: {}", if admins.trim().is_empty() { "none" } else { admins.as_str() });
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let campuses = campuses.clone();
                let identity = identity.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, campuses, identity, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Give in-flight sessions up to 10s to finish.
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("campusd stopped");
    Ok(())
}
