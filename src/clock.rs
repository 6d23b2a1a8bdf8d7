//! Time and identifier capabilities injected into the hub service.
//!
//! Both are trait objects so tests can pin time and ids without touching the
//! service logic.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// UTC time source with nanosecond resolution.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Opaque unique identifier generator.
pub trait IdGen: Send + Sync {
    fn new_id(&self, prefix: &str) -> String;
}

/// UUIDv4-backed generator producing `<prefix>_<32 hex chars>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn new_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_gen_prefixes_and_is_unique() {
        let ids = UuidGen;
        let a = ids.new_id("run");
        let b = ids.new_id("run");
        assert!(a.starts_with("run_"));
        assert_ne!(a, b);
    }
}
