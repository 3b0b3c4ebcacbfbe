//! Typed score weights
//!
//! Weights are stored as `key -> float` rows so operators can tune them at
//! runtime. They are read into [`ScoreWeights`] once per tick: missing keys
//! fall back to the documented defaults, unknown keys are reported and
//! ignored, and the result is validated before use.

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::SettingsRepository;

/// Every tunable parameter the core reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightKey {
    RotationDefaultSec,
    UpvoteTimeBonusSec,
    DownvoteTimePenaltySec,
    DownvoteSkipThreshold,
    MomentumWindowMin,
    FatigueLookback,
    PoolFresh,
    PoolRerun,
    PoolWildcard,
    SatelliteCount,
    RevealIntervalSec,
    VoteToTag,
}

impl WeightKey {
    pub const ALL: [WeightKey; 12] = [
        WeightKey::RotationDefaultSec,
        WeightKey::UpvoteTimeBonusSec,
        WeightKey::DownvoteTimePenaltySec,
        WeightKey::DownvoteSkipThreshold,
        WeightKey::MomentumWindowMin,
        WeightKey::FatigueLookback,
        WeightKey::PoolFresh,
        WeightKey::PoolRerun,
        WeightKey::PoolWildcard,
        WeightKey::SatelliteCount,
        WeightKey::RevealIntervalSec,
        WeightKey::VoteToTag,
    ];

    /// Stored key name
    pub fn name(&self) -> &'static str {
        match self {
            Self::RotationDefaultSec => "rotation_default_sec",
            Self::UpvoteTimeBonusSec => "upvote_time_bonus_sec",
            Self::DownvoteTimePenaltySec => "downvote_time_penalty_sec",
            Self::DownvoteSkipThreshold => "downvote_skip_threshold",
            Self::MomentumWindowMin => "momentum_window_min",
            Self::FatigueLookback => "fatigue_lookback",
            Self::PoolFresh => "pool_fresh",
            Self::PoolRerun => "pool_rerun",
            Self::PoolWildcard => "pool_wildcard",
            Self::SatelliteCount => "satellite_count",
            Self::RevealIntervalSec => "reveal_interval_sec",
            Self::VoteToTag => "vote_to_tag",
        }
    }

    /// Largest accepted value. Durations stay within a day and counts within
    /// what a rotation can use, so timestamp arithmetic cannot overflow.
    pub fn max_value(&self) -> f64 {
        match self {
            Self::RotationDefaultSec
            | Self::UpvoteTimeBonusSec
            | Self::DownvoteTimePenaltySec
            | Self::RevealIntervalSec => 86_400.0,
            Self::DownvoteSkipThreshold => 1_000.0,
            Self::MomentumWindowMin => 10_080.0,
            Self::FatigueLookback => 10_000.0,
            Self::PoolFresh | Self::PoolRerun | Self::PoolWildcard => 1_000_000.0,
            Self::SatelliteCount => 20.0,
            Self::VoteToTag => 100.0,
        }
    }

    /// Value used when the key is not stored
    pub fn default_value(&self) -> f64 {
        match self {
            Self::RotationDefaultSec => 120.0,
            Self::UpvoteTimeBonusSec => 15.0,
            Self::DownvoteTimePenaltySec => 20.0,
            Self::DownvoteSkipThreshold => 3.0,
            Self::MomentumWindowMin => 30.0,
            Self::FatigueLookback => 20.0,
            Self::PoolFresh => 0.6,
            Self::PoolRerun => 0.3,
            Self::PoolWildcard => 0.1,
            Self::SatelliteCount => 5.0,
            Self::RevealIntervalSec => 20.0,
            Self::VoteToTag => 0.3,
        }
    }
}

impl fmt::Display for WeightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WeightKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown weight key '{s}'"))
    }
}

/// Resolved, validated weight set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreWeights {
    pub rotation_default_sec: f64,
    pub upvote_time_bonus_sec: f64,
    pub downvote_time_penalty_sec: f64,
    pub downvote_skip_threshold: f64,
    pub momentum_window_min: f64,
    pub fatigue_lookback: f64,
    pub pool_fresh: f64,
    pub pool_rerun: f64,
    pub pool_wildcard: f64,
    pub satellite_count: f64,
    pub reveal_interval_sec: f64,
    pub vote_to_tag: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        let mut weights = Self {
            rotation_default_sec: 0.0,
            upvote_time_bonus_sec: 0.0,
            downvote_time_penalty_sec: 0.0,
            downvote_skip_threshold: 0.0,
            momentum_window_min: 0.0,
            fatigue_lookback: 0.0,
            pool_fresh: 0.0,
            pool_rerun: 0.0,
            pool_wildcard: 0.0,
            satellite_count: 0.0,
            reveal_interval_sec: 0.0,
            vote_to_tag: 0.0,
        };
        for key in WeightKey::ALL {
            weights.set(key, key.default_value());
        }
        weights
    }
}

impl ScoreWeights {
    /// Read weights from the store and validate them
    pub fn load<S: SettingsRepository + ?Sized>(store: &S) -> Result<Self> {
        let weights = Self::from_pairs(store.score_weights()?);
        weights.validate()?;
        Ok(weights)
    }

    /// Build from stored pairs; unknown keys are logged and skipped
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut weights = Self::default();
        for (key, value) in pairs {
            match key.as_ref().parse::<WeightKey>() {
                Ok(k) => weights.set(k, value),
                Err(_) => tracing::warn!(key = key.as_ref(), "Ignoring unknown score weight"),
            }
        }
        weights
    }

    pub fn get(&self, key: WeightKey) -> f64 {
        match key {
            WeightKey::RotationDefaultSec => self.rotation_default_sec,
            WeightKey::UpvoteTimeBonusSec => self.upvote_time_bonus_sec,
            WeightKey::DownvoteTimePenaltySec => self.downvote_time_penalty_sec,
            WeightKey::DownvoteSkipThreshold => self.downvote_skip_threshold,
            WeightKey::MomentumWindowMin => self.momentum_window_min,
            WeightKey::FatigueLookback => self.fatigue_lookback,
            WeightKey::PoolFresh => self.pool_fresh,
            WeightKey::PoolRerun => self.pool_rerun,
            WeightKey::PoolWildcard => self.pool_wildcard,
            WeightKey::SatelliteCount => self.satellite_count,
            WeightKey::RevealIntervalSec => self.reveal_interval_sec,
            WeightKey::VoteToTag => self.vote_to_tag,
        }
    }

    pub fn set(&mut self, key: WeightKey, value: f64) {
        let slot = match key {
            WeightKey::RotationDefaultSec => &mut self.rotation_default_sec,
            WeightKey::UpvoteTimeBonusSec => &mut self.upvote_time_bonus_sec,
            WeightKey::DownvoteTimePenaltySec => &mut self.downvote_time_penalty_sec,
            WeightKey::DownvoteSkipThreshold => &mut self.downvote_skip_threshold,
            WeightKey::MomentumWindowMin => &mut self.momentum_window_min,
            WeightKey::FatigueLookback => &mut self.fatigue_lookback,
            WeightKey::PoolFresh => &mut self.pool_fresh,
            WeightKey::PoolRerun => &mut self.pool_rerun,
            WeightKey::PoolWildcard => &mut self.pool_wildcard,
            WeightKey::SatelliteCount => &mut self.satellite_count,
            WeightKey::RevealIntervalSec => &mut self.reveal_interval_sec,
            WeightKey::VoteToTag => &mut self.vote_to_tag,
        };
        *slot = value;
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        for key in WeightKey::ALL {
            let value = self.get(key);
            if !value.is_finite() || value < 0.0 {
                return Err(Error::config(format!(
                    "score weight {key} must be a finite non-negative number, got {value}"
                )));
            }
            if value > key.max_value() {
                return Err(Error::config(format!(
                    "score weight {key} must be at most {}, got {value}",
                    key.max_value()
                )));
            }
        }

        if self.rotation_default_sec <= 0.0 {
            return Err(Error::config("score weight rotation_default_sec must be positive"));
        }

        if self.downvote_skip_threshold < 1.0 {
            return Err(Error::config(
                "score weight downvote_skip_threshold must be at least 1",
            ));
        }

        if self.pool_fresh + self.pool_rerun + self.pool_wildcard <= 0.0 {
            return Err(Error::config("pool weights must not all be zero"));
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    pub fn rotation_default(&self) -> Duration {
        secs(self.rotation_default_sec)
    }

    pub fn upvote_bonus(&self) -> Duration {
        secs(self.upvote_time_bonus_sec)
    }

    pub fn downvote_penalty(&self) -> Duration {
        secs(self.downvote_time_penalty_sec)
    }

    /// Downvotes from one user that force a rotation
    pub fn skip_threshold(&self) -> usize {
        self.downvote_skip_threshold.ceil() as usize
    }

    pub fn momentum_window(&self) -> Duration {
        Duration::milliseconds((self.momentum_window_min * 60_000.0).round() as i64)
    }

    pub fn fatigue_lookback(&self) -> usize {
        self.fatigue_lookback as usize
    }

    pub fn satellite_count(&self) -> usize {
        self.satellite_count as usize
    }

    pub fn reveal_interval(&self) -> Duration {
        secs(self.reveal_interval_sec)
    }

    /// `[fresh, rerun, wildcard]`
    pub fn pool_weights(&self) -> [f64; 3] {
        [self.pool_fresh, self.pool_rerun, self.pool_wildcard]
    }
}

fn secs(value: f64) -> Duration {
    Duration::milliseconds((value * 1000.0).round() as i64)
}
