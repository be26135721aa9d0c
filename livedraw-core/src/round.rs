use crate::time::iso_seconds;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Frequency of each digit 0-9.
///
/// Serialized as an object with all ten keys `"0"`..`"9"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigitCounts([u32; 10]);

impl DigitCounts {
    pub fn from_samples(samples: &[u8]) -> Self {
        let mut counts = Self::default();
        for &digit in samples {
            counts.record(digit);
        }
        counts
    }

    pub fn record(&mut self, digit: u8) {
        if let Some(slot) = self.0.get_mut(usize::from(digit)) {
            *slot += 1;
        }
    }

    pub fn get(&self, digit: u8) -> u32 {
        self.0.get(usize::from(digit)).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        (0u8..).zip(self.0.iter().copied())
    }
}

impl Serialize for DigitCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (digit, count) in self.iter() {
            map.serialize_entry(&digit.to_string(), &count)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DigitCounts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, u32>::deserialize(deserializer)?;
        let mut counts = Self::default();
        for (key, count) in raw {
            let digit: usize = key
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid digit key '{}'", key)))?;
            let slot = counts
                .0
                .get_mut(digit)
                .ok_or_else(|| serde::de::Error::custom(format!("digit {} out of range", digit)))?;
            *slot = count;
        }
        Ok(counts)
    }
}

/// The round currently being sampled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    minute_start: DateTime<Utc>,
    samples_planned: u32,
    samples: Vec<u8>,
    counts: DigitCounts,
}

impl Round {
    pub fn new(minute_start: DateTime<Utc>, samples_planned: u32) -> Self {
        Self {
            minute_start,
            samples_planned,
            samples: Vec::with_capacity(samples_planned as usize),
            counts: DigitCounts::default(),
        }
    }

    pub fn minute_start(&self) -> DateTime<Utc> {
        self.minute_start
    }

    pub fn samples_planned(&self) -> u32 {
        self.samples_planned
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    pub fn samples_taken(&self) -> u32 {
        self.samples.len() as u32
    }

    pub fn counts(&self) -> &DigitCounts {
        &self.counts
    }

    /// Append a sample. Returns false once `samples_planned` is reached.
    pub fn push_sample(&mut self, digit: u8) -> bool {
        if self.samples_taken() >= self.samples_planned {
            return false;
        }
        self.samples.push(digit);
        self.counts.record(digit);
        true
    }

    fn seal(self, final_digit: u8, locked_at: DateTime<Utc>) -> SealedRound {
        SealedRound {
            minute_start: self.minute_start,
            locked_at,
            final_digit,
            samples_planned: self.samples_planned,
            samples_taken: self.samples.len() as u32,
            counts: self.counts,
        }
    }
}

/// A round whose final digit has been locked. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedRound {
    #[serde(with = "iso_seconds")]
    pub minute_start: DateTime<Utc>,
    #[serde(with = "iso_seconds")]
    pub locked_at: DateTime<Utc>,
    pub final_digit: u8,
    pub samples_planned: u32,
    pub samples_taken: u32,
    pub counts: DigitCounts,
}

/// Current and previous round bookkeeping.
#[derive(Debug, Default)]
pub struct RoundLedger {
    current: Option<Round>,
    previous: Option<SealedRound>,
}

impl RoundLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Round> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&SealedRound> {
        self.previous.as_ref()
    }

    /// Start a new round. An unsealed round still in progress is discarded.
    pub fn begin(&mut self, minute_start: DateTime<Utc>, samples_planned: u32) -> &Round {
        if let Some(stale) = self.current.take() {
            tracing::warn!(
                "Discarding unsealed round {} with {} samples",
                crate::time::iso_utc(stale.minute_start()),
                stale.samples_taken()
            );
        }
        self.current.insert(Round::new(minute_start, samples_planned))
    }

    /// Record a sample into the current round.
    pub fn record_sample(&mut self, digit: u8) -> Option<&Round> {
        let round = self.current.as_mut()?;
        if round.push_sample(digit) {
            Some(&*round)
        } else {
            None
        }
    }

    /// Lock the current round's final digit and make it the previous round.
    pub fn seal(&mut self, final_digit: u8, locked_at: DateTime<Utc>) -> Option<&SealedRound> {
        let round = self.current.take()?;
        Some(&*self.previous.insert(round.seal(final_digit, locked_at)))
    }
}
