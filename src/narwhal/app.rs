use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::narwhal::{
    admin, config, logging, net, telemetry,
    tunnel::{
        client::{Client, ClientOptions},
        control::SessionOptions,
        server::{Server, ServerOptions},
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>, log_level: Option<String>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logging = logging::init(&cfg.logging, log_level.as_deref())?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }
    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server = cfg.server.is_some(),
        client = cfg.client.is_some(),
        admin_addr = %cfg.admin_addr,
        "narwhal: starting"
    );

    let relays: telemetry::SharedRelays = Arc::new(telemetry::RelayRegistry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let mut registry = None;
    if let Some(sc) = &cfg.server {
        if sc.users.is_empty() {
            tracing::warn!("config: server has no users; every AUTH will be rejected");
        }
        let server = Server::new(
            ServerOptions {
                listen_addr: sc.listen_addr.clone(),
                users: sc.users.clone(),
                session: SessionOptions {
                    bind_host: sc.bind_host.clone(),
                    handshake_timeout: sc.handshake_timeout,
                    pairing_timeout: sc.pairing_timeout,
                    pairing_capacity: sc.pairing_queue_capacity,
                    buffer_size: sc.buffer_size,
                },
            },
            relays.clone(),
        )?;
        registry = Some(server.registry());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    if let Some(cc) = &cfg.client {
        let client = Client::new(
            ClientOptions {
                server_addr: cc.server_addr.clone(),
                local_addr: cc.local_addr.clone(),
                remote_port: cc.remote_port,
                uid: cc.uid.clone(),
                max_retry_times: cc.max_retry_times,
                retry_backoff: cc.retry_backoff,
                dial_timeout: cc.dial_timeout,
                reply_timeout: cc.reply_timeout,
                buffer_size: cc.buffer_size,
            },
            relays.clone(),
        )?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let prom = match telemetry::init_prometheus() {
            Ok(h) => Some(Arc::new(h)),
            Err(err) => {
                tracing::warn!(err = %err, "metrics: exporter disabled");
                None
            }
        };
        let state = admin::AdminState {
            prom,
            relays: relays.clone(),
            registry: registry.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // A task ending on its own is fatal: the client gave up or a listener failed.
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        },
    };
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = %humantime::format_duration(DRAIN_TIMEOUT), "shutdown: drain timed out; aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
