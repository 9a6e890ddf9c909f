//! Cost and token burn-rate derivation.
//!
//! Rates are computed over a sliding trailing window of store samples: each
//! `compute` call records one (time, total cost, total tokens) observation,
//! prunes observations that fell out of the window, and derives $/hr and
//! tokens/min from the oldest retained observation. Spans shorter than the
//! window extrapolate from what was observed; spans under five seconds read
//! as zero.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::state::{MemoryStore, SessionData, API_REQUEST_EVENT};

/// Trailing window over which rates are derived.
const WINDOW: Duration = Duration::from_secs(5 * 60);

/// Minimum observed span; below it rates read zero instead of noise.
const MIN_SPAN: Duration = Duration::from_secs(5);

/// Hourly-rate changes smaller than this count as flat.
const TREND_EPSILON: f64 = 0.01;

/// Direction of the hourly rate relative to the previous computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Flat,
    Down,
}

/// Per-model cost breakdown entry.
#[derive(Debug, Clone)]
pub struct ModelBurnRate {
    pub model: String,
    pub hourly_rate: f64,
    pub total_cost: f64,
}

/// Derived burn-rate statistics for one point in time.
#[derive(Debug, Clone)]
pub struct BurnRate {
    pub total_cost: f64,
    pub hourly_rate: f64,
    pub trend: Trend,
    /// Tokens per minute over the same window.
    pub token_velocity: f64,
    pub daily_projection: f64,
    pub monthly_projection: f64,
    /// Sorted by total cost, highest first.
    pub per_model: Vec<ModelBurnRate>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: SystemTime,
    total_cost: f64,
    total_tokens: i64,
}

/// Burn-rate calculator. Stateless across calls except for the sample window
/// and the memoized previous rate used for the trend comparison.
pub struct Calculator {
    samples: Mutex<VecDeque<Sample>>,
    prev_rate: Mutex<Option<f64>>,
}

impl Default for Calculator {
    fn default() -> Self {
        Self::new()
    }
}

impl Calculator {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            prev_rate: Mutex::new(None),
        }
    }

    /// Computes burn rate against the current wall time.
    pub fn compute(&self, store: &MemoryStore) -> BurnRate {
        self.compute_at(store, SystemTime::now())
    }

    /// Computes burn rate at an explicit time. Deterministic-test entry
    /// point; `now` must not move backwards between calls.
    pub fn compute_at(&self, store: &MemoryStore, now: SystemTime) -> BurnRate {
        let sessions = store.list_sessions();
        let total_cost: f64 = sessions.iter().map(|s| s.total_cost).sum();
        let total_tokens: i64 = sessions.iter().map(|s| s.total_tokens).sum();

        let window_start = now.checked_sub(WINDOW).unwrap_or(SystemTime::UNIX_EPOCH);

        let (hourly_rate, token_velocity, span) = {
            let mut samples = self.samples.lock();
            samples.push_back(Sample {
                at: now,
                total_cost,
                total_tokens,
            });
            while samples.front().is_some_and(|s| s.at < window_start) {
                samples.pop_front();
            }

            let oldest = *samples.front().expect("just pushed");
            let span = now
                .duration_since(oldest.at)
                .unwrap_or(Duration::ZERO);

            if span < MIN_SPAN {
                (0.0, 0.0, span)
            } else {
                let hours = span.as_secs_f64() / 3600.0;
                let minutes = span.as_secs_f64() / 60.0;
                let delta_cost = (total_cost - oldest.total_cost).max(0.0);
                let delta_tokens = (total_tokens - oldest.total_tokens).max(0) as f64;
                (delta_cost / hours, delta_tokens / minutes, span)
            }
        };

        let trend = {
            let mut prev = self.prev_rate.lock();
            let trend = match *prev {
                Some(prev_rate) if hourly_rate > prev_rate + TREND_EPSILON => Trend::Up,
                Some(prev_rate) if hourly_rate < prev_rate - TREND_EPSILON => Trend::Down,
                Some(_) => Trend::Flat,
                None => Trend::Flat,
            };
            *prev = Some(hourly_rate);
            trend
        };

        BurnRate {
            total_cost,
            hourly_rate,
            trend,
            token_velocity,
            daily_projection: hourly_rate * 24.0,
            monthly_projection: hourly_rate * 24.0 * 30.0,
            per_model: per_model_breakdown(&sessions, window_start, span),
        }
    }
}

/// Groups `api_request` events by model: lifetime cost plus an hourly rate
/// derived from the events inside the trailing window, over the same span as
/// the global rate.
fn per_model_breakdown(
    sessions: &[SessionData],
    window_start: SystemTime,
    span: Duration,
) -> Vec<ModelBurnRate> {
    struct Agg {
        total_cost: f64,
        window_cost: f64,
    }

    let mut models: HashMap<String, Agg> = HashMap::new();

    for session in sessions {
        for event in &session.events {
            if event.name != API_REQUEST_EVENT {
                continue;
            }
            let Some(model) = event.attributes.get("model").filter(|m| !m.is_empty()) else {
                continue;
            };
            let cost: f64 = event
                .attributes
                .get("cost_usd")
                .and_then(|c| c.parse().ok())
                .unwrap_or(0.0);

            let agg = models.entry(model.clone()).or_insert(Agg {
                total_cost: 0.0,
                window_cost: 0.0,
            });
            agg.total_cost += cost;
            if event.timestamp >= window_start {
                agg.window_cost += cost;
            }
        }
    }

    let hours = span.as_secs_f64() / 3600.0;
    let mut result: Vec<ModelBurnRate> = models
        .into_iter()
        .map(|(model, agg)| ModelBurnRate {
            model,
            hourly_rate: if span < MIN_SPAN {
                0.0
            } else {
                agg.window_cost / hours
            },
            total_cost: agg.total_cost,
        })
        .collect();

    result.sort_by(|a, b| {
        b.total_cost
            .partial_cmp(&a.total_cost)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    result
}
