use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// When a scheduled pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Once {
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    At {
        at: DateTime<Utc>,
    },
    /// First run after one interval. `max_runs: None` repeats until cancelled.
    Interval {
        #[serde(with = "duration_ms")]
        every: Duration,
        #[serde(default)]
        max_runs: Option<u32>,
    },
}

impl Schedule {
    /// Delay before the next run given the runs completed so far; `None` when finished.
    pub fn next_delay(&self, completed_runs: u32, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Once { delay } => (completed_runs == 0).then_some(*delay),
            Schedule::At { at } => {
                if completed_runs > 0 {
                    return None;
                }
                Some((*at - now).to_std().unwrap_or(Duration::ZERO))
            }
            Schedule::Interval { every, max_runs } => {
                if max_runs.map_or(false, |max| completed_runs >= max) {
                    return None;
                }
                Some(*every)
            }
        }
    }
}

/// A registered schedule as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledJob {
    pub job_id: Uuid,
    pub pipeline_id: String,
    pub schedule: Schedule,
    pub created_at: DateTime<Utc>,
    pub runs: u32,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
