//! Deterministic identifiers for runs and their operations.
//!
//! Step and hook ids are derived from `(run_id, logical name, call_index)`
//! so that the n-th encounter of an operation maps to the same id on every
//! tick, regardless of which worker replays the body. Sleep ids only need
//! to be unique within a run and are keyed by call index alone.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a fresh run id (`run_` + 16 hex chars).
pub fn new_run_id() -> String {
    format!("run_{}", short_uuid())
}

/// Generate a fresh event id (`evt_` + 16 hex chars).
pub fn new_event_id() -> String {
    format!("evt_{}", short_uuid())
}

/// Generate a fresh schedule id (`sched_` + 16 hex chars).
pub fn new_schedule_id() -> String {
    format!("sched_{}", short_uuid())
}

/// Deterministic step id for the `call_index`-th step call of a run.
pub fn step_id(run_id: &str, step_name: &str, call_index: u32) -> String {
    format!("step_{}", digest16(run_id, step_name, call_index))
}

/// Deterministic hook id for the `call_index`-th hook await of a run.
pub fn hook_id(run_id: &str, hook_name: &str, call_index: u32) -> String {
    format!("hook_{}", digest16(run_id, hook_name, call_index))
}

/// Deterministic sleep id for the `call_index`-th sleep of a run.
pub fn sleep_id(call_index: u32) -> String {
    format!("sleep_{call_index}")
}

fn short_uuid() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..16].to_string()
}

fn digest16(run_id: &str, name: &str, call_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(call_index.to_string().as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_ids_are_stable() {
        let a = step_id("run_1", "charge", 2);
        let b = step_id("run_1", "charge", 2);
        assert_eq!(a, b);
        assert!(a.starts_with("step_"));
        assert_eq!(a.len(), "step_".len() + 16);
    }

    #[test]
    fn step_ids_vary_by_index_and_run() {
        assert_ne!(step_id("run_1", "charge", 0), step_id("run_1", "charge", 1));
        assert_ne!(step_id("run_1", "charge", 0), step_id("run_2", "charge", 0));
    }

    #[test]
    fn sleep_ids_use_call_index() {
        assert_eq!(sleep_id(0), "sleep_0");
        assert_eq!(sleep_id(3), "sleep_3");
    }

    #[test]
    fn fresh_ids_have_prefixes() {
        assert!(new_run_id().starts_with("run_"));
        assert!(new_event_id().starts_with("evt_"));
        assert_eq!(new_run_id().len(), 20);
    }
}
