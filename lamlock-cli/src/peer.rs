use anyhow::Context;
use tokio::sync::broadcast;

use lamlock_core::chooser::RandomChooser;
use lamlock_core::engine::MutexEngine;
use lamlock_core::node::{NodeEvent, NodeHandle, PeerNode, RoundOutcome};
use lamlock_core::transport_tcp::TcpTransport;
use lamlock_core::types::{AccessOutcome, PeerId};

use crate::settings::Settings;

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let me = settings.engine.me;
    let transport = TcpTransport::start(me, settings.engine.peers, settings.host, settings.base_port)
        .await
        .context("failed to start transport")?;

    tracing::info!(
        "🔒 lamlock peer {} of {} publishing on {} as {}",
        me,
        settings.engine.peers.size(),
        transport.publisher.local_addr(),
        settings.engine.role
    );

    let chooser = RandomChooser::seeded(settings.seed);
    let engine = MutexEngine::with_chooser(settings.engine, Box::new(chooser));
    let (handle, node) = PeerNode::spawn(engine, transport.publisher, transport.inbound, settings.node);

    let logger = tokio::spawn(log_events(me, handle.subscribe()));
    let rounds = tokio::spawn(run_rounds(handle.clone(), settings.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("🛑 Shutting down peer {}", me);

    rounds.abort();
    if let Ok(status) = handle.status().await {
        tracing::info!("📋 Final state: {}", serde_json::to_string(&status)?);
    }
    handle.shutdown().await.ok();
    node.await.context("node task failed")?;
    logger.abort();
    for subscription in transport.subscriptions {
        subscription.abort();
    }
    Ok(())
}

// ─── Rounds ─────────────────────────────────────────────────────────────────

async fn run_rounds(handle: NodeHandle, settings: Settings) {
    if settings.rounds == 0 {
        tracing::info!("Passive peer, only granting requests");
        return;
    }

    tokio::time::sleep(settings.start_delay).await;
    for round in 1..=settings.rounds {
        match handle.run_round().await {
            Ok(RoundOutcome::Completed(_)) => {
                tracing::info!(round, "✅ Round complete");
            }
            Ok(RoundOutcome::Abandoned) => {
                tracing::warn!(round, "⚠️  Round abandoned, no grant from every peer");
            }
            Err(e) => {
                tracing::error!(round, error = %e, "Round failed");
                return;
            }
        }
        if round < settings.rounds {
            tokio::time::sleep(settings.interval).await;
        }
    }
    tracing::info!(rounds = settings.rounds, "All rounds done");
}

// ─── Event Log ──────────────────────────────────────────────────────────────

async fn log_events(me: PeerId, mut events: broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(me, event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(peer = %me, skipped, "event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn log_event(me: PeerId, event: NodeEvent) {
    match event {
        NodeEvent::RequestIssued { clock } => {
            tracing::info!(peer = %me, clock, "📨 Requesting the resource");
        }
        NodeEvent::RequestRetried { clock, attempt } => {
            tracing::warn!(peer = %me, clock, attempt, "🔁 Request re-issued");
        }
        NodeEvent::RequestAbandoned { clock } => {
            tracing::warn!(peer = %me, clock, "Request abandoned");
        }
        NodeEvent::Entered { clock, access } => match access {
            AccessOutcome::Read { position, value } => {
                tracing::info!(peer = %me, clock, position, value, "🔓 Read inside critical section");
            }
            AccessOutcome::Write(mutation) => {
                tracing::info!(
                    peer = %me,
                    clock,
                    position = mutation.position,
                    value = mutation.value,
                    "✏️  Wrote inside critical section"
                );
            }
        },
        NodeEvent::Released { clock, .. } => {
            tracing::info!(peer = %me, clock, "🔒 Released critical section");
        }
        NodeEvent::UpdateApplied { from, position, value } => {
            tracing::info!(peer = %me, %from, position, value, "Replica updated");
        }
    }
}
