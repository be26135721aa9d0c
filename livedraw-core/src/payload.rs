use crate::round::{DigitCounts, SealedRound};
use crate::time::iso_seconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of the most recently sealed round, as shown to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousResult {
    #[serde(with = "iso_seconds")]
    pub minute_start: DateTime<Utc>,
    pub final_digit: u8,
    pub counts: DigitCounts,
}

impl From<&SealedRound> for PreviousResult {
    fn from(sealed: &SealedRound) -> Self {
        Self {
            minute_start: sealed.minute_start,
            final_digit: sealed.final_digit,
            counts: sealed.counts.clone(),
        }
    }
}

/// Progress of the round in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundProgress {
    #[serde(with = "iso_seconds")]
    pub minute_start: DateTime<Utc>,
    pub samples_planned: u32,
    pub samples_taken: u32,
    pub counts: DigitCounts,
}

/// Every message pushed on the live event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LivePayload {
    #[serde(rename_all = "camelCase")]
    Welcome {
        #[serde(with = "iso_seconds")]
        now: DateTime<Utc>,
        preview_offset: u32,
        samples_planned: u32,
        previous_result: Option<PreviousResult>,
        current: Option<RoundProgress>,
    },
    #[serde(rename_all = "camelCase")]
    Sample {
        #[serde(with = "iso_seconds")]
        minute_start: DateTime<Utc>,
        sample_digit: u8,
        samples_taken: u32,
        counts: DigitCounts,
    },
    #[serde(rename_all = "camelCase")]
    Preview {
        #[serde(with = "iso_seconds")]
        minute_start: DateTime<Utc>,
        #[serde(with = "iso_seconds")]
        published_at: DateTime<Utc>,
        samples_planned: u32,
        samples_taken: u32,
        counts: DigitCounts,
        preview_offset: u32,
    },
    Previous {
        previous: PreviousResult,
    },
    #[serde(rename_all = "camelCase")]
    Final {
        #[serde(with = "iso_seconds")]
        minute_start: DateTime<Utc>,
        #[serde(with = "iso_seconds")]
        locked_at: DateTime<Utc>,
        final_digit: u8,
        samples_planned: u32,
        samples_taken: u32,
        counts: DigitCounts,
    },
}

impl LivePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Sample { .. } => "sample",
            Self::Preview { .. } => "preview",
            Self::Previous { .. } => "previous",
            Self::Final { .. } => "final",
        }
    }

    pub fn final_of(sealed: &SealedRound) -> Self {
        Self::Final {
            minute_start: sealed.minute_start,
            locked_at: sealed.locked_at,
            final_digit: sealed.final_digit,
            samples_planned: sealed.samples_planned,
            samples_taken: sealed.samples_taken,
            counts: sealed.counts.clone(),
        }
    }
}
