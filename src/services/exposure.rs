//! Three-valued exposure logic.
//!
//! Every exposure answer is Exposed, Shaded or Unknown. Combining clear-sky
//! geometry with the sky state uses Kleene conjunction: Shaded dominates,
//! Unknown is absorbing otherwise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Exposure {
    Exposed,
    Shaded,
    Unknown,
}

impl Exposure {
    /// Kleene AND.
    pub fn and(self, other: Exposure) -> Exposure {
        match (self, other) {
            (Exposure::Shaded, _) | (_, Exposure::Shaded) => Exposure::Shaded,
            (Exposure::Exposed, Exposure::Exposed) => Exposure::Exposed,
            _ => Exposure::Unknown,
        }
    }

    /// Nullable boolean form used for storage and JSON (`NULL` = unknown).
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Exposure::Exposed => Some(true),
            Exposure::Shaded => Some(false),
            Exposure::Unknown => None,
        }
    }

    pub fn from_bool(value: Option<bool>) -> Exposure {
        match value {
            Some(true) => Exposure::Exposed,
            Some(false) => Exposure::Shaded,
            None => Exposure::Unknown,
        }
    }
}

/// End-user-facing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SunStatus {
    Sunny,
    Shady,
    Unknown,
}

impl From<Exposure> for SunStatus {
    fn from(e: Exposure) -> Self {
        match e {
            Exposure::Exposed => SunStatus::Sunny,
            Exposure::Shaded => SunStatus::Shady,
            Exposure::Unknown => SunStatus::Unknown,
        }
    }
}

/// Outcome of a forward search over the time grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextInstant {
    Found(DateTime<Utc>),
    /// Every instant of the horizon is known and none matched.
    NoneWithinHorizon,
    /// Nothing matched, but missing data leaves the answer open.
    Unknown,
}

/// Wire form of [`NextInstant`] without the timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LookaheadStatus {
    Found,
    NoneWithinHorizon,
    Unknown,
}

impl NextInstant {
    pub fn instant(self) -> Option<DateTime<Utc>> {
        match self {
            NextInstant::Found(ts) => Some(ts),
            _ => None,
        }
    }

    pub fn status(self) -> LookaheadStatus {
        match self {
            NextInstant::Found(_) => LookaheadStatus::Found,
            NextInstant::NoneWithinHorizon => LookaheadStatus::NoneWithinHorizon,
            NextInstant::Unknown => LookaheadStatus::Unknown,
        }
    }
}
