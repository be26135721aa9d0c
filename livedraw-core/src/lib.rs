//! livedraw core - minute-aligned live draw engine
//!
//! Once per UTC minute a round starts, samples are drawn and streamed to
//! observers, a preview is published ahead of the boundary and the final digit
//! is locked at the boundary. [`DrawEngine`] runs the schedule on a single task
//! and fans state out through the [`BroadcastHub`].

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod payload;
pub mod round;
pub mod time;

pub use clock::{ClockEvent, Phase, RoundClock, RoundPlan};
pub use config::{ConfigUpdate, EngineConfig, ScheduleConfig};
pub use engine::{DrawEngine, EngineHandle, EngineStatus, StatusReport};
pub use error::{DrawError, Result};
pub use hub::{BroadcastHub, Observer, Outbound};
pub use payload::{LivePayload, PreviousResult, RoundProgress};
pub use round::{DigitCounts, Round, RoundLedger, SealedRound};
pub use time::{iso_utc, SystemClock, TokioClock, WallClock};
