//! pingwatchd: peer latency monitor daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use pingwatch_core::config::PingwatchConfig;
use pingwatch_services::{rtt_gauges, ProbeScheduler};

mod membership;
mod ping;
mod status;

use membership::PeerTable;
use ping::PingTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PingwatchConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PingwatchConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PingwatchConfig::default()
    });

    let probe_config = config.probe.probe_config()?;
    let listen_addr = config.network.listen_addr()?;
    let metrics_addr = config.network.metrics_addr()?;

    let host_label = if config.probe.host_label.is_empty() {
        hostname().context("failed to read system hostname")?
    } else {
        config.probe.host_label.clone()
    };
    let self_id = config.node_id(&host_label)?;
    tracing::info!(node_id = %self_id, host = %host_label, "pingwatchd starting");

    // Bind ping socket
    let socket = Arc::new(
        UdpSocket::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind ping socket on {listen_addr}"))?,
    );

    // Peers
    let peers = PeerTable::new(probe_config.ttl);
    for peer in &config.peers {
        match peer.resolve() {
            Ok((id, addr)) if id == self_id => {
                tracing::debug!(%addr, "skipping bootstrap entry for self");
            }
            Ok((id, addr)) => peers.add_bootstrap(id, addr),
            Err(e) => tracing::warn!(error = %e, "ignoring invalid bootstrap peer"),
        }
    }
    tracing::info!(count = peers.len(), "bootstrap peers loaded");

    let transport = PingTransport::new(socket, self_id, peers.clone());

    // Metrics
    let gauges = Arc::new(rtt_gauges().context("failed to register RTT gauges")?);

    let scheduler = ProbeScheduler::start(
        self_id,
        host_label,
        probe_config,
        transport.clone(),
        Arc::new(peers.clone()),
        gauges.clone(),
    )
    .await
    .context("failed to start probe scheduler")?;

    let status_state = status::StatusState {
        self_id,
        gauges,
        last_seen: scheduler.registry().clone(),
        peers,
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let responder_task = tokio::spawn(transport.receive_loop());

    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let status_task = tokio::spawn(async move {
        if let Err(e) = status::serve(status_state, metrics_addr).await {
            tracing::error!(error = %e, "metrics server failed");
        }
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = responder_task     => tracing::error!("ping responder exited: {:?}", r),
        r = status_task        => tracing::error!("metrics server exited: {:?}", r),
        r = scheduler_task     => {
            tracing::error!("probe scheduler exited: {:?}", r);
            anyhow::bail!("probe scheduler stopped");
        }
    }

    Ok(())
}

/// The system hostname, used as the `host` label when none is configured.
fn hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("gethostname");
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).into_owned();
    if name.is_empty() {
        anyhow::bail!("system hostname is empty");
    }
    Ok(name)
}
