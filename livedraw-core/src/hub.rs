//! Fan-out of round state to connected observers.

use crate::config::ScheduleConfig;
use crate::error::{DrawError, Result};
use crate::payload::{LivePayload, PreviousResult, RoundProgress};
use crate::round::{Round, SealedRound};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Message queued for one observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized [`LivePayload`].
    Event(Arc<str>),
    /// Liveness probe; the transport answers it with [`Observer::acknowledge`].
    Ping,
}

/// Receiving end of an observer connection, held by the transport.
#[derive(Debug)]
pub struct Observer {
    id: Uuid,
    rx: mpsc::Receiver<Outbound>,
    alive: Arc<AtomicBool>,
}

impl Observer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next queued message. `None` once the hub has evicted this observer.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    /// Mark the observer responsive until the next heartbeat.
    pub fn acknowledge(&self) {
        self.alive.store(true, Ordering::Release);
    }
}

struct ObserverSlot {
    tx: mpsc::Sender<Outbound>,
    alive: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default)]
struct HubSnapshot {
    config: ScheduleConfig,
    previous: Option<PreviousResult>,
    current: Option<RoundProgress>,
}

/// Observers and the snapshot behind one lock, so a joining observer's welcome
/// and the set of broadcast targets always agree.
#[derive(Default)]
struct HubState {
    observers: HashMap<Uuid, ObserverSlot>,
    snapshot: HubSnapshot,
    closed: bool,
}

pub struct BroadcastHub {
    state: RwLock<HubState>,
    buffer: usize,
}

impl BroadcastHub {
    pub fn new(config: ScheduleConfig, buffer: usize) -> Self {
        Self {
            state: RwLock::new(HubState {
                snapshot: HubSnapshot {
                    config,
                    ..HubSnapshot::default()
                },
                ..HubState::default()
            }),
            buffer: buffer.max(1),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.state.read().observers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Latest sealed result known to the hub.
    pub fn previous(&self) -> Option<PreviousResult> {
        self.state.read().snapshot.previous.clone()
    }

    /// Register a new observer. Its first message is always the welcome payload.
    ///
    /// Fails with [`DrawError::EngineStopped`] once [`close_all`](Self::close_all)
    /// has run.
    pub fn connect(&self, now: DateTime<Utc>) -> Result<Observer> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let alive = Arc::new(AtomicBool::new(true));
        let id = Uuid::new_v4();

        let mut state = self.state.write();
        if state.closed {
            return Err(DrawError::EngineStopped);
        }

        let text = serde_json::to_string(&welcome_of(&state.snapshot, now))?;
        // the channel is fresh, so there is room for the welcome
        let _ = tx.try_send(Outbound::Event(text.into()));

        state.observers.insert(
            id,
            ObserverSlot {
                tx,
                alive: alive.clone(),
            },
        );
        let total = state.observers.len();
        drop(state);

        tracing::debug!("Observer {} connected ({} total)", id, total);
        Ok(Observer { id, rx, alive })
    }

    pub fn disconnect(&self, id: Uuid) -> bool {
        let removed = self.state.write().observers.remove(&id).is_some();
        if removed {
            tracing::debug!("Observer {} disconnected", id);
        }
        removed
    }

    /// Drop every observer and refuse new ones; their `recv` returns `None`
    /// afterwards.
    pub fn close_all(&self) {
        let mut state = self.state.write();
        state.closed = true;
        if !state.observers.is_empty() {
            tracing::info!("Closing {} observers", state.observers.len());
        }
        state.observers.clear();
    }

    pub fn welcome(&self, now: DateTime<Utc>) -> LivePayload {
        welcome_of(&self.state.read().snapshot, now)
    }

    pub fn set_config(&self, config: ScheduleConfig) {
        self.state.write().snapshot.config = config;
    }

    pub fn on_round_started(&self, round: &Round) {
        self.state.write().snapshot.current = Some(progress_of(round));
    }

    pub fn on_sample(&self, round: &Round, digit: u8) -> usize {
        let payload = LivePayload::Sample {
            minute_start: round.minute_start(),
            sample_digit: digit,
            samples_taken: round.samples_taken(),
            counts: round.counts().clone(),
        };
        self.publish(&payload, |snapshot| {
            snapshot.current = Some(progress_of(round));
        })
    }

    /// Publish the preview, then reissue the previous result next to it.
    pub fn on_preview(&self, round: &Round, config: &ScheduleConfig, now: DateTime<Utc>) -> usize {
        let delivered = self.broadcast(&LivePayload::Preview {
            minute_start: round.minute_start(),
            published_at: now,
            samples_planned: round.samples_planned(),
            samples_taken: round.samples_taken(),
            counts: round.counts().clone(),
            preview_offset: config.preview_offset_secs,
        });

        if let Some(previous) = self.previous() {
            self.broadcast(&LivePayload::Previous { previous });
        }

        delivered
    }

    pub fn on_final(&self, sealed: &SealedRound) -> usize {
        let previous = PreviousResult::from(sealed);
        let delivered = self.publish(&LivePayload::final_of(sealed), |snapshot| {
            snapshot.previous = Some(previous.clone());
            snapshot.current = None;
        });
        self.broadcast(&LivePayload::Previous { previous });
        delivered
    }

    /// Send `payload` to every observer, returning how many accepted it.
    ///
    /// Delivery is best-effort per observer: a closed observer is evicted and a
    /// full queue loses this message only.
    pub fn broadcast(&self, payload: &LivePayload) -> usize {
        self.publish(payload, |_| {})
    }

    /// Apply `update` to the snapshot and pick the targets under the same
    /// lock, then send outside it.
    fn publish(&self, payload: &LivePayload, update: impl FnOnce(&mut HubSnapshot)) -> usize {
        let text: Arc<str> = match serde_json::to_string(payload) {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::error!("Failed to serialize {} payload: {}", payload.kind(), e);
                return 0;
            }
        };

        let targets: Vec<(Uuid, mpsc::Sender<Outbound>)> = {
            let mut state = self.state.write();
            update(&mut state.snapshot);
            state
                .observers
                .iter()
                .map(|(id, slot)| (*id, slot.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(Outbound::Event(text.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Observer {} is lagging, dropped {} payload", id, payload.kind());
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut state = self.state.write();
            for id in &closed {
                state.observers.remove(id);
            }
            tracing::debug!("Evicted {} closed observers", closed.len());
        }

        delivered
    }

    /// Evict observers that missed the previous probe and probe the rest.
    ///
    /// An observer whose queue is full keeps its liveness until a ping can be
    /// queued. Returns the number of evicted observers.
    pub fn heartbeat(&self) -> usize {
        let mut state = self.state.write();
        let before = state.observers.len();

        state.observers.retain(|id, slot| {
            if !slot.alive.swap(false, Ordering::AcqRel) {
                tracing::debug!("Observer {} missed heartbeat, evicting", id);
                return false;
            }
            match slot.tx.try_send(Outbound::Ping) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    slot.alive.store(true, Ordering::Release);
                    tracing::debug!("Observer {} queue full, ping deferred", id);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        let evicted = before - state.observers.len();
        if evicted > 0 {
            tracing::info!("Heartbeat evicted {} observers", evicted);
        }
        evicted
    }
}

fn welcome_of(snapshot: &HubSnapshot, now: DateTime<Utc>) -> LivePayload {
    LivePayload::Welcome {
        now,
        preview_offset: snapshot.config.preview_offset_secs,
        samples_planned: snapshot.config.samples_planned,
        previous_result: snapshot.previous.clone(),
        current: snapshot.current.clone(),
    }
}

fn progress_of(round: &Round) -> RoundProgress {
    RoundProgress {
        minute_start: round.minute_start(),
        samples_planned: round.samples_planned(),
        samples_taken: round.samples_taken(),
        counts: round.counts().clone(),
    }
}
