//! The draw engine: one task that owns all round state.
//!
//! The task sleeps until the [`RoundClock`]'s next wake, a heartbeat tick or an
//! administrative command, whichever comes first. Nothing else mutates rounds,
//! so the scheduler callbacks can never overlap.

use crate::clock::{ClockEvent, Phase, RoundClock, RoundPlan};
use crate::config::{ConfigUpdate, EngineConfig, ScheduleConfig};
use crate::error::{DrawError, Result};
use crate::hub::{BroadcastHub, Observer};
use crate::round::{DigitCounts, RoundLedger, SealedRound};
use crate::time::{delay_until, iso_seconds, iso_utc, seconds_until, SystemClock, WallClock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Running,
    Stopped,
}

/// Answer to the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(with = "iso_seconds")]
    pub now: DateTime<Utc>,
    /// Start of the round in progress, `None` between rounds.
    #[serde(with = "iso_seconds::option")]
    pub minute_start: Option<DateTime<Utc>>,
    pub phase: Phase,
    pub status: EngineStatus,
    pub samples_planned: u32,
    pub samples_taken: u32,
    pub counts: DigitCounts,
    pub seconds_until_preview: u64,
    pub seconds_until_final: u64,
    pub previous_result: Option<SealedRound>,
    /// Schedule applied from the next round on.
    pub config: ScheduleConfig,
    pub observers: usize,
}

enum EngineCommand {
    Status(oneshot::Sender<StatusReport>),
    UpdateConfig(ConfigUpdate, oneshot::Sender<Result<ScheduleConfig>>),
    ForcePreview(oneshot::Sender<Result<()>>),
    ForceFinal(oneshot::Sender<Result<SealedRound>>),
    Shutdown,
}

pub struct DrawEngine {
    clock: Arc<dyn WallClock>,
    rounds: RoundClock,
    ledger: RoundLedger,
    config: ScheduleConfig,
    hub: Arc<BroadcastHub>,
    rng: Box<dyn RngCore + Send>,
    heartbeat_interval: Duration,
    commands: mpsc::Receiver<EngineCommand>,
}

impl DrawEngine {
    /// Spawn the engine on the current tokio runtime using the system clock and
    /// an OS-seeded CSPRNG.
    pub fn spawn(config: EngineConfig) -> Result<EngineHandle> {
        Self::spawn_with(
            config,
            Arc::new(SystemClock),
            Box::new(StdRng::from_entropy()),
        )
    }

    pub fn spawn_with(
        config: EngineConfig,
        clock: Arc<dyn WallClock>,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<EngineHandle> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let hub = Arc::new(BroadcastHub::new(config.schedule, config.observer_buffer));

        let engine = Self {
            clock: clock.clone(),
            rounds: RoundClock::new(),
            ledger: RoundLedger::new(),
            config: config.schedule,
            hub: hub.clone(),
            rng,
            heartbeat_interval: config.heartbeat_interval,
            commands: rx,
        };

        let task = tokio::spawn(engine.run());

        Ok(EngineHandle {
            commands: tx,
            hub,
            clock,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    async fn run(mut self) {
        self.rounds.start(self.clock.now());
        tracing::info!(
            "Draw engine started: {} samples, preview {}s before final",
            self.config.samples_planned,
            self.config.preview_offset_secs
        );

        let period = self.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.fire_due_events();

            let wait = self
                .rounds
                .next_wake()
                .map(|wake| delay_until(wake, self.clock.now()));

            tokio::select! {
                _ = sleep_for(wait) => {}
                _ = heartbeat.tick() => {
                    self.hub.heartbeat();
                }
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }

        self.rounds.stop();
        self.hub.close_all();
        tracing::info!("Draw engine stopped");
    }

    fn fire_due_events(&mut self) {
        loop {
            let now = self.clock.now();
            let Some(event) = self.rounds.poll(now, &self.config) else {
                break;
            };
            self.apply(event, now);
        }
    }

    fn apply(&mut self, event: ClockEvent, now: DateTime<Utc>) {
        match event {
            ClockEvent::RoundStarted { boundary } => {
                let planned = self
                    .rounds
                    .plan()
                    .map_or(self.config.samples_planned, |plan| plan.config.samples_planned);
                let round = self.ledger.begin(boundary, planned);
                self.hub.on_round_started(round);
                tracing::info!("Round {} started", iso_utc(boundary));
            }
            ClockEvent::Sample { index } => {
                let digit = self.draw_digit();
                if let Some(round) = self.ledger.record_sample(digit) {
                    let delivered = self.hub.on_sample(round, digit);
                    tracing::debug!(
                        "Sample {} of round {}: {} ({} observers)",
                        index + 1,
                        iso_utc(round.minute_start()),
                        digit,
                        delivered
                    );
                }
            }
            ClockEvent::Preview => {
                if let (Some(round), Some(plan)) = (self.ledger.current(), self.rounds.plan()) {
                    let delivered = self.hub.on_preview(round, &plan.config, now);
                    tracing::info!(
                        "Preview of round {} published to {} observers",
                        iso_utc(round.minute_start()),
                        delivered
                    );
                }
            }
            ClockEvent::Final => {
                self.lock_final(now);
            }
        }
    }

    fn draw_digit(&mut self) -> u8 {
        self.rng.gen_range(0..10)
    }

    fn lock_final(&mut self, now: DateTime<Utc>) -> Option<SealedRound> {
        let digit = self.draw_digit();
        let sealed = self.ledger.seal(digit, now)?.clone();
        let delivered = self.hub.on_final(&sealed);

        tracing::info!(
            "Round {} locked final digit {} ({} observers)",
            iso_utc(sealed.minute_start),
            sealed.final_digit,
            delivered
        );
        Some(sealed)
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            EngineCommand::UpdateConfig(update, reply) => {
                let _ = reply.send(self.update_config(&update));
            }
            EngineCommand::ForcePreview(reply) => {
                let _ = reply.send(self.force_preview());
            }
            EngineCommand::ForceFinal(reply) => {
                let _ = reply.send(self.force_final());
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn update_config(&mut self, update: &ConfigUpdate) -> Result<ScheduleConfig> {
        let merged = self.config.merged(update).map_err(|e| {
            tracing::warn!("Rejected configuration update: {}", e);
            e
        })?;

        self.config = merged;
        self.hub.set_config(merged);
        tracing::info!(
            "Configuration updated: {} samples, preview offset {}s (from next round)",
            merged.samples_planned,
            merged.preview_offset_secs
        );
        Ok(merged)
    }

    fn force_preview(&mut self) -> Result<()> {
        let now = self.clock.now();
        let round = self.ledger.current().ok_or(DrawError::NoActiveRound)?;
        let config = self.rounds.plan().map_or(self.config, |plan| plan.config);

        self.hub.on_preview(round, &config, now);
        tracing::info!("Forced preview of round {}", iso_utc(round.minute_start()));
        Ok(())
    }

    fn force_final(&mut self) -> Result<SealedRound> {
        if !self.rounds.lock_early() {
            return Err(DrawError::NoActiveRound);
        }

        let sealed = self
            .lock_final(self.clock.now())
            .ok_or(DrawError::NoActiveRound)?;
        tracing::info!("Forced final of round {}", iso_utc(sealed.minute_start));
        Ok(sealed)
    }

    fn status(&self) -> StatusReport {
        let now = self.clock.now();
        let round = self.ledger.current();

        let (preview_at, final_at) = match self.rounds.plan() {
            Some(plan) => (Some(plan.preview_at), Some(plan.final_at)),
            None => match self.rounds.next_boundary() {
                Some(boundary) => {
                    let upcoming = RoundPlan::new(boundary, self.config);
                    (Some(upcoming.preview_at), Some(upcoming.final_at))
                }
                None => (None, None),
            },
        };

        StatusReport {
            now,
            minute_start: round.map(|round| round.minute_start()),
            phase: self.rounds.phase(),
            status: if self.rounds.is_running() {
                EngineStatus::Running
            } else {
                EngineStatus::Stopped
            },
            samples_planned: round.map_or(self.config.samples_planned, |round| round.samples_planned()),
            samples_taken: round.map_or(0, |round| round.samples_taken()),
            counts: round.map(|round| round.counts().clone()).unwrap_or_default(),
            seconds_until_preview: preview_at.map_or(0, |at| seconds_until(at, now)),
            seconds_until_final: final_at.map_or(0, |at| seconds_until(at, now)),
            previous_result: self.ledger.previous().cloned(),
            config: self.config,
            observers: self.hub.observer_count(),
        }
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running [`DrawEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    hub: Arc<BroadcastHub>,
    clock: Arc<dyn WallClock>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| DrawError::EngineStopped)?;
        rx.await.map_err(|_| DrawError::EngineStopped)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.request(EngineCommand::Status).await
    }

    /// Change the schedule from the next round on. Invalid values are
    /// rejected and the current schedule is kept.
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<ScheduleConfig> {
        self.request(|reply| EngineCommand::UpdateConfig(update, reply))
            .await?
    }

    /// Publish a preview of the round in progress out of schedule.
    pub async fn force_preview(&self) -> Result<()> {
        self.request(EngineCommand::ForcePreview).await?
    }

    /// Lock the round in progress now; the next round starts on schedule.
    pub async fn force_final(&self) -> Result<SealedRound> {
        self.request(EngineCommand::ForceFinal).await?
    }

    /// Register an observer. Fails with [`DrawError::EngineStopped`] once the
    /// engine has closed its observers.
    pub fn connect(&self) -> Result<Observer> {
        self.hub.connect(self.clock.now())
    }

    pub fn disconnect(&self, id: Uuid) -> bool {
        self.hub.disconnect(id)
    }

    pub fn observer_count(&self) -> usize {
        self.hub.observer_count()
    }

    /// Stop the engine and wait for its task to finish.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.commands.send(EngineCommand::Shutdown).await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| DrawError::internal(format!("Engine task failed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Outbound;
    use crate::time::TokioClock;
    use chrono::TimeZone;
    use serde_json::Value;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn spawn_at(anchor: DateTime<Utc>, schedule: ScheduleConfig) -> EngineHandle {
        let config = EngineConfig {
            schedule,
            ..EngineConfig::default()
        };
        DrawEngine::spawn_with(
            config,
            Arc::new(TokioClock::starting_at(anchor)),
            Box::new(StdRng::seed_from_u64(42)),
        )
        .unwrap()
    }

    async fn next_event(observer: &mut Observer) -> Value {
        loop {
            match observer.recv().await.expect("observer closed") {
                Outbound::Event(text) => return serde_json::from_str(&text).unwrap(),
                Outbound::Ping => observer.acknowledge(),
            }
        }
    }

    /// Events up to and including the first one of `kind`.
    async fn events_until(observer: &mut Observer, kind: &str) -> Vec<Value> {
        let mut events = Vec::new();
        loop {
            let event = next_event(observer).await;
            let done = event["type"] == kind;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn of_kind<'a>(events: &'a [Value], kind: &str) -> Vec<&'a Value> {
        events.iter().filter(|e| e["type"] == kind).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_schedule_two_rounds() {
        let engine = spawn_at(at(0, 0, 30), ScheduleConfig::default());
        let mut observer = engine.connect().unwrap();

        let welcome = next_event(&mut observer).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["now"], "2024-01-01T00:00:30Z");

        let first = events_until(&mut observer, "final").await;
        let samples = of_kind(&first, "sample");
        assert_eq!(samples.len(), 25);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample["minuteStart"], "2024-01-01T00:01:00Z");
            assert_eq!(sample["samplesTaken"], i as u64 + 1);
            let total: u64 = sample["counts"]
                .as_object()
                .unwrap()
                .values()
                .map(|v| v.as_u64().unwrap())
                .sum();
            assert_eq!(total, i as u64 + 1);
        }

        let preview = of_kind(&first, "preview")[0];
        assert_eq!(preview["publishedAt"], "2024-01-01T00:01:25Z");
        assert_eq!(preview["samplesTaken"], 25);
        // nothing sealed before the first final
        assert!(of_kind(&first, "previous").is_empty());

        let final_one = first.last().unwrap().clone();
        assert_eq!(final_one["lockedAt"], "2024-01-01T00:02:00Z");
        assert_eq!(final_one["minuteStart"], "2024-01-01T00:01:00Z");

        let reissue = next_event(&mut observer).await;
        assert_eq!(reissue["type"], "previous");
        assert_eq!(reissue["previous"]["finalDigit"], final_one["finalDigit"]);

        let second = events_until(&mut observer, "final").await;
        let preview_at = second.iter().position(|e| e["type"] == "preview").unwrap();
        assert_eq!(second[preview_at]["publishedAt"], "2024-01-01T00:02:25Z");
        assert_eq!(second[preview_at + 1]["type"], "previous");
        assert_eq!(
            second[preview_at + 1]["previous"]["finalDigit"],
            final_one["finalDigit"]
        );
        assert_eq!(second.last().unwrap()["lockedAt"], "2024-01-01T00:03:00Z");

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_change_applies_next_round() {
        let engine = spawn_at(at(0, 0, 50), ScheduleConfig::default());
        let mut observer = engine.connect().unwrap();
        events_until(&mut observer, "sample").await;

        let invalid = ConfigUpdate {
            samples_planned: Some(0),
            preview_offset_secs: None,
        };
        assert!(matches!(
            engine.update_config(invalid).await,
            Err(DrawError::InvalidConfig(_))
        ));

        let update = ConfigUpdate {
            samples_planned: None,
            preview_offset_secs: Some(10),
        };
        let applied = engine.update_config(update).await.unwrap();
        assert_eq!(applied, ScheduleConfig::new(25, 10).unwrap());

        let first = events_until(&mut observer, "preview").await;
        let preview = first.last().unwrap();
        assert_eq!(preview["publishedAt"], "2024-01-01T00:01:25Z");
        assert_eq!(preview["previewOffset"], 35);

        let second = events_until(&mut observer, "preview").await;
        let preview = second.last().unwrap();
        assert_eq!(preview["publishedAt"], "2024-01-01T00:02:50Z");
        assert_eq!(preview["previewOffset"], 10);
        // the longer window still holds exactly the planned samples
        assert_eq!(preview["samplesTaken"], 25);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_final_seals_round_once() {
        let engine = spawn_at(at(0, 0, 40), ScheduleConfig::default());
        let mut observer = engine.connect().unwrap();

        assert!(matches!(engine.force_final().await, Err(DrawError::NoActiveRound)));
        assert!(matches!(engine.force_preview().await, Err(DrawError::NoActiveRound)));

        events_until(&mut observer, "sample").await;
        engine.force_preview().await.unwrap();
        let sealed = engine.force_final().await.unwrap();
        assert_eq!(sealed.minute_start, at(0, 1, 0));
        assert_eq!(sealed.samples_taken, 1);

        let forced = events_until(&mut observer, "final").await;
        let previews = of_kind(&forced, "preview");
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0]["minuteStart"], "2024-01-01T00:01:00Z");
        assert_eq!(previews[0]["samplesTaken"], 1);
        // nothing was sealed before this round, so the preview had no reissue
        assert!(of_kind(&forced, "previous").is_empty());
        assert_eq!(forced.last().unwrap()["minuteStart"], "2024-01-01T00:01:00Z");
        assert_eq!(next_event(&mut observer).await["type"], "previous");

        let status = engine.status().await.unwrap();
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.previous_result, Some(sealed.clone()));
        assert!(status.minute_start.is_none());

        // a forced preview in the next round is followed by the reissue
        let started = events_until(&mut observer, "sample").await;
        assert_eq!(started.last().unwrap()["minuteStart"], "2024-01-01T00:02:00Z");
        engine.force_preview().await.unwrap();
        let preview = events_until(&mut observer, "preview").await.pop().unwrap();
        assert_eq!(preview["minuteStart"], "2024-01-01T00:02:00Z");
        let reissue = next_event(&mut observer).await;
        assert_eq!(reissue["type"], "previous");
        assert_eq!(reissue["previous"]["minuteStart"], "2024-01-01T00:01:00Z");
        assert_eq!(reissue["previous"]["finalDigit"], sealed.final_digit);

        // no scheduled preview or final for the locked round
        let next = events_until(&mut observer, "final").await;
        assert!(next
            .iter()
            .filter(|e| e["type"] != "previous")
            .all(|e| e["minuteStart"] == "2024-01-01T00:02:00Z"));
        assert_eq!(next.last().unwrap()["lockedAt"], "2024-01-01T00:03:00Z");

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_before_first_round() {
        let engine = spawn_at(at(0, 0, 30), ScheduleConfig::default());

        let status = engine.status().await.unwrap();
        assert_eq!(status.status, EngineStatus::Running);
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.seconds_until_preview, 55);
        assert_eq!(status.seconds_until_final, 90);
        assert_eq!(status.samples_taken, 0);
        assert!(status.previous_result.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert!(json["minuteStart"].is_null());
        assert_eq!(json["status"], "running");

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_leaving_mid_round() {
        let engine = spawn_at(at(0, 0, 55), ScheduleConfig::new(5, 30).unwrap());
        let mut staying = engine.connect().unwrap();
        let mut leaving = engine.connect().unwrap();
        assert_eq!(engine.observer_count(), 2);

        events_until(&mut leaving, "sample").await;
        assert!(engine.disconnect(leaving.id()));
        drop(leaving);

        let events = events_until(&mut staying, "final").await;
        assert_eq!(of_kind(&events, "sample").len(), 5);
        assert_eq!(engine.observer_count(), 1);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_observer_is_evicted() {
        let engine = spawn_at(at(0, 0, 0), ScheduleConfig::default());
        let mut silent = engine.connect().unwrap();

        // never acknowledge pings: evicted on the second probe
        let mut closed = false;
        for _ in 0..200 {
            if silent.recv().await.is_none() {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert_eq!(engine.observer_count(), 0);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let engine = spawn_at(at(0, 0, 10), ScheduleConfig::default());
        let mut observer = engine.connect().unwrap();
        next_event(&mut observer).await;

        engine.shutdown().await.unwrap();

        assert!(observer.recv().await.is_none());
        assert!(matches!(engine.status().await, Err(DrawError::EngineStopped)));
        assert!(matches!(engine.connect(), Err(DrawError::EngineStopped)));
    }
}
