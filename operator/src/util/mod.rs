use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::jiff::Timestamp;
use std::time::Duration;

pub mod leader;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "arl-operator";

pub fn now() -> Time {
    Time(Timestamp::now())
}

/// Age of a timestamp; `None` when the clock ran backwards.
pub fn age_of(t: &Time) -> Option<Duration> {
    Timestamp::now().duration_since(t.0).try_into().ok()
}

/// Seconds from `a` to `b`, clamped at zero.
pub fn seconds_between(a: &Time, b: &Time) -> f64 {
    let span = b.0.duration_since(a.0);
    let Ok(d): Result<Duration, _> = span.try_into() else {
        return 0.0;
    };
    d.as_secs_f64()
}

/// Build a `metav1.Condition`; status is the usual "True"/"False" string pair.
pub fn condition(type_: &str, status: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now(),
        observed_generation: None,
    }
}

/// Replace the condition of the same type, or append. `InvalidTransition`
/// entries are append-only so each rejected edge stays visible.
pub fn upsert_condition(conditions: &mut Vec<Condition>, cond: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => *existing = cond,
        None => conditions.push(cond),
    }
}
