//! Engine bridge: request/reply correlation across the process boundary.
//!
//! Every dispatch gets a fresh correlation id and a [`PendingCommand`] entry
//! holding a oneshot reply slot. The entry is removed exactly once: by the
//! matching reply, by timeout, by the caller abandoning the future, or by
//! [`EngineBridge::reset`], which rejects every outstanding entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::events;
use crate::settings::DispatchSettings;

const EVENT_CAPACITY: usize = 256;

// ── Wire envelopes ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestEnvelope<'a> {
    correlation_id: &'a str,
    command: &'a str,
    args: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyEnvelope {
    correlation_id: String,
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Unsolicited engine push (no correlation id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Lost { reason: String },
}

// ── Pending commands ────────────────────────────────────────────

pub struct PendingCommand {
    pub correlation_id: String,
    pub command: String,
    pub args: Value,
    pub issued_at: Instant,
    reply: oneshot::Sender<Result<Value, BridgeError>>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingCommand>>>;

/// Removes the pending entry when the dispatch future finishes or is dropped.
struct PendingGuard {
    pending: PendingMap,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

// ── Bridge ──────────────────────────────────────────────────────

pub struct EngineBridge {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    frames_sent: AtomicU64,
    events: broadcast::Sender<EngineEvent>,
    status: watch::Sender<ConnectionStatus>,
    settings: DispatchSettings,
}

impl EngineBridge {
    pub fn new(settings: DispatchSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            outbound: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            frames_sent: AtomicU64::new(0),
            events,
            status,
            settings,
        }
    }

    /// A connected bridge plus the receiving end of its outbound frames.
    pub fn channel(settings: DispatchSettings) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let bridge = Arc::new(Self::new(settings));
        let (tx, rx) = mpsc::unbounded_channel();
        bridge.connect(tx);
        (bridge, rx)
    }

    /// Attach an outbound channel. Replaces any previous one.
    pub fn connect(&self, sender: mpsc::UnboundedSender<String>) {
        *self.outbound.lock() = Some(sender);
        self.status.send_replace(ConnectionStatus::Connected);
        tracing::info!("engine channel connected");
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of request frames handed to the outbound channel so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    fn next_correlation_id(&self) -> String {
        format!("cmd-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn dispatch(&self, command: &str, args: Value) -> Result<Value, BridgeError> {
        self.dispatch_with_cancel(command, args, &CancellationToken::new())
            .await
    }

    /// Send `command` and wait for its correlated reply, the timeout, or `cancel`.
    pub async fn dispatch_with_cancel(
        &self,
        command: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, BridgeError> {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let timeout = self.settings.timeout_for(command);
        let correlation_id = self.next_correlation_id();
        let frame = serde_json::to_string(&RequestEnvelope {
            correlation_id: &correlation_id,
            command,
            args: &args,
        })
        .map_err(|e| BridgeError::invalid(format!("Cannot encode '{command}': {e}")))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(
            correlation_id.clone(),
            PendingCommand {
                correlation_id: correlation_id.clone(),
                command: command.to_string(),
                args,
                issued_at: Instant::now(),
                reply: reply_tx,
            },
        );
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            correlation_id: correlation_id.clone(),
        };

        self.send(frame)?;
        tracing::debug!(%correlation_id, command, "dispatched");

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(%correlation_id, command, "dispatch cancelled");
                Err(BridgeError::Cancelled)
            }
            waited = tokio::time::timeout(timeout, reply_rx) => match waited {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(BridgeError::ConnectionLost {
                    reason: "reply slot dropped".to_string(),
                }),
                Err(_) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = timeout.as_millis() as u64;
                    tracing::warn!(%correlation_id, command, timeout_ms, "dispatch timed out");
                    Err(BridgeError::DispatchTimeout {
                        command: command.to_string(),
                        timeout_ms,
                    })
                }
            },
        }
    }

    fn send(&self, frame: String) -> Result<(), BridgeError> {
        let sent = match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => {
                return Err(BridgeError::Channel {
                    message: "engine is not connected".to_string(),
                })
            }
        };
        if !sent {
            self.reset("outbound channel closed");
            return Err(BridgeError::Channel {
                message: "outbound channel closed".to_string(),
            });
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Route one inbound frame: a reply resolves its pending command, an event
    /// is broadcast, anything else is logged and dropped.
    pub fn handle_frame(&self, frame: &str) {
        let value: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed engine frame");
                return;
            }
        };

        if value.get("correlationId").is_some() {
            match serde_json::from_value::<ReplyEnvelope>(value) {
                Ok(reply) => self.resolve(reply),
                Err(e) => tracing::warn!(error = %e, "dropping malformed engine reply"),
            }
        } else if value.get("eventType").is_some() {
            match serde_json::from_value::<EngineEvent>(value) {
                Ok(event) => {
                    if event.event_type == events::ENGINE_LOG {
                        match event.payload.as_str() {
                            Some(line) => tracing::info!(target: "scene_bridge::engine", "{line}"),
                            None => tracing::info!(target: "scene_bridge::engine", payload = %event.payload),
                        }
                    } else {
                        tracing::trace!(event_type = %event.event_type, "engine event");
                    }
                    let _ = self.events.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "dropping malformed engine event"),
            }
        } else {
            tracing::warn!("dropping engine frame with neither correlationId nor eventType");
        }
    }

    fn resolve(&self, reply: ReplyEnvelope) {
        let Some(pending) = self.pending.lock().remove(&reply.correlation_id) else {
            tracing::debug!(
                correlation_id = %reply.correlation_id,
                "ignoring reply with no pending command"
            );
            return;
        };
        tracing::debug!(
            correlation_id = %pending.correlation_id,
            command = %pending.command,
            elapsed = ?pending.issued_at.elapsed(),
            ok = reply.ok,
            "reply received"
        );
        let outcome = if reply.ok {
            Ok(reply.result.unwrap_or(Value::Null))
        } else {
            let message = match reply.error {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => "engine reported failure".to_string(),
            };
            Err(BridgeError::EngineReported {
                command: pending.command,
                message,
            })
        };
        // Receiver gone means the caller already gave up.
        let _ = pending.reply.send(outcome);
    }

    /// Tear down the channel: drop the outbound sender and reject every
    /// pending command with `ConnectionLost`.
    pub fn reset(&self, reason: &str) {
        self.outbound.lock().take();
        let drained: Vec<PendingCommand> = self.pending.lock().drain().map(|(_, p)| p).collect();
        tracing::warn!(reason, rejected = drained.len(), "engine channel reset");
        for pending in drained {
            let _ = pending.reply.send(Err(BridgeError::ConnectionLost {
                reason: reason.to_string(),
            }));
        }
        self.status.send_replace(ConnectionStatus::Lost {
            reason: reason.to_string(),
        });
    }
}
