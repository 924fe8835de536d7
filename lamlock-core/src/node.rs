//! Async driver around [`MutexEngine`].
//!
//! One task owns the engine and its replica. Frames from every
//! subscription arrive on a single inbound channel, local commands on a
//! second one, so all state changes are serialized without a lock. The
//! same task arms the request deadline and the critical-section hold
//! timer.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::engine::{MutexEngine, PeerStatus, Step};
use crate::error::{EngineError, NodeError};
use crate::transport::{Inbound, InboundReceiver, Publisher};
use crate::types::{AccessOutcome, LogicalTime, Mutation, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    /// How long a request may wait for its grants before it is re-issued
    pub request_timeout: Duration,
    /// Re-issues allowed before the request is abandoned
    pub max_retries: u32,
    /// How long the critical section is held before release
    pub hold: Duration,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            hold: Duration::ZERO,
            command_buffer: 32,
            event_buffer: 256,
        }
    }
}

/// Things a node reports while it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    RequestIssued { clock: LogicalTime },
    RequestRetried { clock: LogicalTime, attempt: u32 },
    RequestAbandoned { clock: LogicalTime },
    Entered { clock: LogicalTime, access: AccessOutcome },
    Released { clock: LogicalTime, mutation: Option<Mutation> },
    UpdateApplied { from: PeerId, position: usize, value: i64 },
}

/// How one request round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Completed(AccessOutcome),
    Abandoned,
}

enum Command {
    Request(oneshot::Sender<Result<(), EngineError>>),
    Cancel(oneshot::Sender<Result<(), EngineError>>),
    Status(oneshot::Sender<PeerStatus>),
    Shutdown,
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeHandle {
    /// Start a request. Returns once the REQUESTs are published.
    pub async fn request(&self) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Request(tx)).await?;
        Ok(rx.await.map_err(|_| NodeError::Stopped)??)
    }

    pub async fn cancel(&self) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Cancel(tx)).await?;
        Ok(rx.await.map_err(|_| NodeError::Stopped)??)
    }

    pub async fn status(&self) -> Result<PeerStatus, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx)).await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Ask the node to stop. A held critical section is released first.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Request the resource and wait until the round is over: released
    /// after use, or abandoned after the retry budget ran out.
    pub async fn run_round(&self) -> Result<RoundOutcome, NodeError> {
        let mut events = self.subscribe();
        self.request().await?;

        let mut entered = None;
        loop {
            match events.recv().await {
                Ok(NodeEvent::Entered { access, .. }) => entered = Some(access),
                Ok(NodeEvent::Released { .. }) => {
                    if let Some(access) = entered {
                        return Ok(RoundOutcome::Completed(access));
                    }
                }
                Ok(NodeEvent::RequestAbandoned { .. }) => return Ok(RoundOutcome::Abandoned),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "node events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(NodeError::Stopped),
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), NodeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NodeError::Stopped)
    }
}

struct HeldSection {
    release_at: Instant,
    clock: LogicalTime,
    mutation: Option<Mutation>,
}

/// The task that owns one peer's engine
pub struct PeerNode<P> {
    engine: MutexEngine,
    publisher: P,
    inbound: InboundReceiver,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<NodeEvent>,
    config: NodeConfig,
    deadline: Option<Instant>,
    attempts: u32,
    held: Option<HeldSection>,
}

impl<P: Publisher + 'static> PeerNode<P> {
    /// Spawn the driver task
    pub fn spawn(
        engine: MutexEngine,
        publisher: P,
        inbound: InboundReceiver,
        config: NodeConfig,
    ) -> (NodeHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::channel(config.command_buffer);
        let (events, _) = broadcast::channel(config.event_buffer);
        let handle = NodeHandle {
            commands: command_tx,
            events: events.clone(),
        };
        let node = Self {
            engine,
            publisher,
            inbound,
            commands,
            events,
            config,
            deadline: None,
            attempts: 0,
            held: None,
        };
        (handle, tokio::spawn(node.run()))
    }

    async fn run(mut self) {
        let me = self.engine.me();
        info!(peer = %me, role = %self.engine.config().role, "node started");
        let mut commands_open = true;

        loop {
            let now = Instant::now();
            let deadline = self.deadline.unwrap_or(now);
            let release_at = self.held.as_ref().map(|h| h.release_at).unwrap_or(now);

            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                    None => commands_open = false,
                },
                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => {
                        warn!(peer = %me, "inbound channel closed");
                        break;
                    }
                },
                _ = sleep_until(release_at), if self.held.is_some() => self.release().await,
                _ = sleep_until(deadline), if self.deadline.is_some() => self.on_deadline().await,
            }
        }

        if self.held.is_some() {
            self.release().await;
        }
        info!(peer = %me, "node stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Request(reply) => {
                let result = self.engine.request_entry();
                let result = match result {
                    Ok(step) => {
                        self.attempts = 0;
                        self.deadline = Some(Instant::now() + self.config.request_timeout);
                        if let Some(stamp) = self.engine.request_stamp() {
                            self.emit(NodeEvent::RequestIssued { clock: stamp.clock });
                        }
                        self.apply(step).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Cancel(reply) => {
                let clock = self.engine.request_stamp().map(|s| s.clock);
                let result = match self.engine.cancel_request() {
                    Ok(step) => {
                        self.deadline = None;
                        self.apply(step).await;
                        if let Some(clock) = clock {
                            self.emit(NodeEvent::RequestAbandoned { clock });
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.engine.status());
            }
            Command::Shutdown => {}
        }
    }

    async fn on_frame(&mut self, frame: Inbound) {
        let message = match MessageCodec::decode(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.engine.me(), from = %frame.from, error = %e, "dropping frame");
                return;
            }
        };
        if message.sender != frame.from {
            warn!(
                peer = %self.engine.me(),
                endpoint = %frame.from,
                sender = %message.sender,
                "sender does not match publishing endpoint"
            );
            return;
        }
        debug!(peer = %self.engine.me(), from = %message.sender, kind = message.label(), "received");
        let step = self.engine.handle_message(message);
        self.apply(step).await;
    }

    async fn on_deadline(&mut self) {
        let Some(stamp) = self.engine.request_stamp() else {
            self.deadline = None;
            return;
        };
        if self.engine.is_using_resource() {
            self.deadline = None;
            return;
        }

        if self.attempts < self.config.max_retries {
            self.attempts += 1;
            match self.engine.rebroadcast_request() {
                Ok(step) => {
                    self.deadline = Some(Instant::now() + self.config.request_timeout);
                    if let Some(stamp) = self.engine.request_stamp() {
                        self.emit(NodeEvent::RequestRetried {
                            clock: stamp.clock,
                            attempt: self.attempts,
                        });
                    }
                    self.apply(step).await;
                }
                Err(e) => {
                    warn!(peer = %self.engine.me(), error = %e, "retry rejected");
                    self.deadline = None;
                }
            }
            return;
        }

        warn!(
            peer = %self.engine.me(),
            clock = stamp.clock,
            attempts = self.attempts,
            "request abandoned"
        );
        self.deadline = None;
        match self.engine.cancel_request() {
            Ok(step) => {
                self.apply(step).await;
                self.emit(NodeEvent::RequestAbandoned { clock: stamp.clock });
            }
            Err(e) => warn!(peer = %self.engine.me(), error = %e, "cancel rejected"),
        }
    }

    async fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        match self.engine.release_critical_section(held.mutation) {
            Ok(step) => {
                self.emit(NodeEvent::Released {
                    clock: held.clock,
                    mutation: held.mutation,
                });
                // Releasing only ever sends UPDATEs and deferred ACKs
                self.dispatch(&step).await;
            }
            Err(e) => warn!(peer = %self.engine.me(), error = %e, "release rejected"),
        }
    }

    /// Send a step's envelopes and react to a critical-section entry
    async fn apply(&mut self, step: Step) {
        self.dispatch(&step).await;

        if let Some(mutation) = step.applied {
            self.emit(NodeEvent::UpdateApplied {
                from: mutation.stamp.peer,
                position: mutation.position,
                value: mutation.value,
            });
        }

        if let Some(access) = step.entered {
            self.deadline = None;
            let clock = self.engine.request_stamp().map(|s| s.clock).unwrap_or_default();
            self.emit(NodeEvent::Entered { clock, access });
            self.held = Some(HeldSection {
                release_at: Instant::now() + self.config.hold,
                clock,
                mutation: access.mutation(),
            });
            if self.config.hold.is_zero() {
                self.release().await;
            }
        }
    }

    async fn dispatch(&self, step: &Step) {
        for envelope in &step.outbound {
            let payload: Bytes = match MessageCodec::encode(&envelope.message) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(peer = %self.engine.me(), error = %e, "failed to encode message");
                    continue;
                }
            };
            if let Err(e) = self.publisher.publish(envelope.to, payload).await {
                warn!(
                    peer = %self.engine.me(),
                    to = %envelope.to,
                    kind = envelope.message.label(),
                    error = %e,
                    "publish failed"
                );
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
