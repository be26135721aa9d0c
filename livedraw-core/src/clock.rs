//! Minute-aligned round scheduler.
//!
//! [`RoundClock`] is a plain state machine: the engine asks it for the next
//! wake time, sleeps until then, and polls it for due events. Every instant is
//! derived from the round boundary, so processing delays never accumulate.

use crate::config::ScheduleConfig;
use crate::time::{iso_utc, next_minute_boundary, ROUND_SECS};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Sampling,
    PreviewPending,
    FinalPending,
}

/// Firing instants of one round, fixed when the round starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPlan {
    pub boundary: DateTime<Utc>,
    pub config: ScheduleConfig,
    pub sample_times: Vec<DateTime<Utc>>,
    pub preview_at: DateTime<Utc>,
    pub final_at: DateTime<Utc>,
}

impl RoundPlan {
    pub fn new(boundary: DateTime<Utc>, config: ScheduleConfig) -> Self {
        let final_at = boundary + Duration::seconds(ROUND_SECS);
        let preview_at = final_at - Duration::seconds(i64::from(config.preview_offset_secs));

        // samples spread evenly over [boundary, boundary + window)
        let window_ms = i64::from(config.sample_window_secs()) * 1000;
        let planned = i64::from(config.samples_planned);
        let sample_times = (0..planned)
            .map(|i| boundary + Duration::milliseconds(i * window_ms / planned))
            .collect();

        Self {
            boundary,
            config,
            sample_times,
            preview_at,
            final_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    RoundStarted { boundary: DateTime<Utc> },
    Sample { index: usize },
    Preview,
    Final,
}

#[derive(Debug)]
pub struct RoundClock {
    phase: Phase,
    running: bool,
    next_boundary: Option<DateTime<Utc>>,
    plan: Option<RoundPlan>,
    samples_fired: usize,
}

impl Default for RoundClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundClock {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            running: false,
            next_boundary: None,
            plan: None,
            samples_fired: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Plan of the round in progress, if any.
    pub fn plan(&self) -> Option<&RoundPlan> {
        match self.phase {
            Phase::Idle => None,
            _ => self.plan.as_ref(),
        }
    }

    /// Boundary at which the next round will start.
    pub fn next_boundary(&self) -> Option<DateTime<Utc>> {
        self.next_boundary
    }

    pub fn samples_fired(&self) -> usize {
        self.samples_fired
    }

    /// Arm the first round at the next minute boundary. No-op when running.
    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.running {
            return;
        }

        self.running = true;
        self.phase = Phase::Idle;
        self.plan = None;
        let boundary = next_minute_boundary(now);
        self.next_boundary = Some(boundary);
        tracing::debug!("Round clock armed for {}", iso_utc(boundary));
    }

    /// Drop every pending wake.
    pub fn stop(&mut self) {
        self.running = false;
        self.phase = Phase::Idle;
        self.plan = None;
        self.next_boundary = None;
        self.samples_fired = 0;
    }

    /// The single instant the driver has to wake at.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        if !self.running {
            return None;
        }

        match self.phase {
            Phase::Idle => self.next_boundary,
            Phase::Sampling => self
                .plan
                .as_ref()
                .and_then(|plan| plan.sample_times.get(self.samples_fired).copied()),
            Phase::PreviewPending => self.plan.as_ref().map(|plan| plan.preview_at),
            Phase::FinalPending => self.plan.as_ref().map(|plan| plan.final_at),
        }
    }

    /// Advance past the next event if it is due at `now`.
    ///
    /// `config` is only read when a new round starts, so updates made while a
    /// round is in progress take effect from the following round.
    pub fn poll(&mut self, now: DateTime<Utc>, config: &ScheduleConfig) -> Option<ClockEvent> {
        let wake = self.next_wake()?;
        if now < wake {
            return None;
        }

        match self.phase {
            Phase::Idle => {
                if now >= wake + Duration::seconds(ROUND_SECS) {
                    let realigned = next_minute_boundary(now);
                    tracing::warn!(
                        "Round at {} was missed entirely, realigning to {}",
                        iso_utc(wake),
                        iso_utc(realigned)
                    );
                    self.next_boundary = Some(realigned);
                    return None;
                }

                let plan = RoundPlan::new(wake, *config);
                self.next_boundary = Some(plan.final_at);
                self.samples_fired = 0;
                self.phase = if plan.sample_times.is_empty() {
                    Phase::PreviewPending
                } else {
                    Phase::Sampling
                };
                self.plan = Some(plan);
                Some(ClockEvent::RoundStarted { boundary: wake })
            }
            Phase::Sampling => {
                let index = self.samples_fired;
                self.samples_fired += 1;
                let planned = self.plan.as_ref().map_or(0, |plan| plan.sample_times.len());
                if self.samples_fired >= planned {
                    self.phase = Phase::PreviewPending;
                }
                Some(ClockEvent::Sample { index })
            }
            Phase::PreviewPending => {
                self.phase = Phase::FinalPending;
                Some(ClockEvent::Preview)
            }
            Phase::FinalPending => {
                self.phase = Phase::Idle;
                Some(ClockEvent::Final)
            }
        }
    }

    /// Abandon the rest of the current round after an out-of-schedule final.
    ///
    /// Returns false when no round is in progress.
    pub fn lock_early(&mut self) -> bool {
        if !self.running || self.phase == Phase::Idle {
            return false;
        }

        self.phase = Phase::Idle;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    /// Poll every due event at its own wake instant, up to `until`.
    fn drive(
        clock: &mut RoundClock,
        config: &ScheduleConfig,
        until: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, ClockEvent)> {
        let mut fired = Vec::new();
        while let Some(wake) = clock.next_wake() {
            if wake > until {
                break;
            }
            if let Some(event) = clock.poll(wake, config) {
                fired.push((wake, event));
            }
        }
        fired
    }

    #[test]
    fn test_preview_to_final_gap_matches_offset() {
        for offset in 0..60 {
            let config = ScheduleConfig::new(25, offset).unwrap();
            let plan = RoundPlan::new(at(0, 1, 0), config);

            assert_eq!(
                plan.final_at - plan.preview_at,
                Duration::seconds(i64::from(offset))
            );
            assert!(plan.sample_times.iter().all(|t| *t < plan.boundary + Duration::seconds(60)));
            assert!(plan.sample_times.iter().all(|t| *t < plan.preview_at));
        }
    }

    #[test]
    fn test_default_round_timeline() {
        let config = ScheduleConfig::default();
        let mut clock = RoundClock::new();
        clock.start(at(0, 0, 30));
        assert_eq!(clock.next_wake(), Some(at(0, 1, 0)));

        let fired = drive(&mut clock, &config, at(0, 2, 0));

        // the next round's first sample also lands on 00:02:00
        let samples: Vec<_> = fired
            .iter()
            .filter(|(t, e)| matches!(e, ClockEvent::Sample { .. }) && *t < at(0, 2, 0))
            .collect();
        assert_eq!(samples.len(), 25);
        assert!(samples.iter().all(|(t, _)| *t >= at(0, 1, 0) && *t < at(0, 1, 25)));

        let preview = fired.iter().find(|(_, e)| *e == ClockEvent::Preview).unwrap();
        assert_eq!(preview.0, at(0, 1, 25));

        let finals: Vec<_> = fired.iter().filter(|(_, e)| *e == ClockEvent::Final).collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].0, at(0, 2, 0));
    }

    #[test]
    fn test_boundaries_do_not_drift() {
        let config = ScheduleConfig::new(3, 20).unwrap();
        let mut clock = RoundClock::new();
        clock.start(at(0, 0, 12));

        let mut boundaries = Vec::new();
        // wake a little late every time to simulate processing jitter
        while boundaries.len() < 10 {
            let wake = clock.next_wake().unwrap();
            if let Some(ClockEvent::RoundStarted { boundary }) =
                clock.poll(wake + Duration::milliseconds(350), &config)
            {
                boundaries.push(boundary);
            }
        }

        for (n, boundary) in boundaries.iter().enumerate() {
            assert_eq!(*boundary, at(0, 1, 0) + Duration::seconds(60 * n as i64));
        }
    }

    #[test]
    fn test_final_precedes_next_round_start() {
        let config = ScheduleConfig::new(1, 10).unwrap();
        let mut clock = RoundClock::new();
        clock.start(at(0, 0, 59));

        let fired = drive(&mut clock, &config, at(0, 2, 0));
        let at_two: Vec<_> = fired.iter().filter(|(t, _)| *t == at(0, 2, 0)).map(|(_, e)| *e).collect();
        assert_eq!(
            at_two,
            vec![
                ClockEvent::Final,
                ClockEvent::RoundStarted { boundary: at(0, 2, 0) },
                ClockEvent::Sample { index: 0 },
            ]
        );
    }

    #[test]
    fn test_config_snapshot_per_round() {
        let mut config = ScheduleConfig::default();
        let mut clock = RoundClock::new();
        clock.start(at(0, 0, 0));

        clock.poll(at(0, 0, 0), &config).unwrap();
        config.preview_offset_secs = 10;

        let plan = clock.plan().unwrap();
        assert_eq!(plan.preview_at, at(0, 0, 25));

        drive(&mut clock, &config, at(0, 1, 0));
        assert_eq!(clock.plan().unwrap().preview_at, at(0, 1, 50));
    }

    #[test]
    fn test_missed_round_realigns() {
        let config = ScheduleConfig::default();
        let mut clock = RoundClock::new();
        clock.start(at(0, 0, 30));

        // process suspended for several minutes
        assert_eq!(clock.poll(at(0, 4, 10), &config), None);
        assert_eq!(clock.next_wake(), Some(at(0, 5, 0)));
        assert_eq!(clock.phase(), Phase::Idle);
    }

    #[test]
    fn test_late_wake_fires_overdue_events_in_order() {
        let config = ScheduleConfig::new(4, 40).unwrap();
        let mut clock = RoundClock::new();
        clock.start(at(0, 1, 0));

        let mut events = Vec::new();
        while let Some(event) = clock.poll(at(0, 1, 30), &config) {
            events.push(event);
        }

        assert_eq!(events.len(), 1 + 4 + 1);
        assert_eq!(events.last(), Some(&ClockEvent::Preview));
        assert_eq!(clock.phase(), Phase::FinalPending);
    }

    #[test]
    fn test_lock_early_skips_rest_of_round() {
        let config = ScheduleConfig::default();
        let mut clock = RoundClock::new();
        assert!(!clock.lock_early());

        clock.start(at(0, 1, 0));
        clock.poll(at(0, 1, 0), &config).unwrap();
        assert!(clock.lock_early());
        assert_eq!(clock.phase(), Phase::Idle);
        assert_eq!(clock.next_wake(), Some(at(0, 2, 0)));
    }

    #[test]
    fn test_stop_clears_wake() {
        let mut clock = RoundClock::new();
        clock.start(at(0, 0, 1));
        clock.stop();

        assert!(!clock.is_running());
        assert_eq!(clock.next_wake(), None);
        assert_eq!(clock.poll(at(1, 0, 0), &ScheduleConfig::default()), None);
    }
}
