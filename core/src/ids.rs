//! Identifier & Clock (§4.1): monotonic timestamps and id minting.
//!
//! Ids are a millisecond timestamp prefix from a `Clock` plus a random hex
//! suffix, so ids sort roughly by creation order and journal replay sees a
//! stable ordering without needing a separate sequence counter.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of monotonic time for id minting and journal timestamps.
///
/// A trait rather than a bare `SystemTime::now()` call so tests can
/// substitute a `FixedClock` and assert on exact id/timestamp values.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time, adjusted to never go backwards within one process.
#[derive(Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// A fixed, manually-advanced clock for deterministic tests.
pub struct FixedClock {
    current: AtomicI64,
}

impl FixedClock {
    pub fn new(start_millis: i64) -> Self {
        Self { current: AtomicI64::new(start_millis) }
    }

    pub fn advance(&self, millis: i64) {
        self.current.fetch_add(millis, Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.current.fetch_add(1, Ordering::Relaxed)
    }
}

/// Mints ids from a shared clock. Collisions within one process are
/// astronomically unlikely (64 bits of randomness per millisecond) and are
/// treated as a fatal bug elsewhere, per §4.1.
pub struct IdGenerator<C: Clock> {
    clock: C,
}

impl<C: Clock> IdGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    pub fn mint(&self) -> String {
        let millis = self.clock.now_millis();
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        format!("{:013x}-{}", millis.max(0) as u64, hex::encode(suffix))
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}

impl IdGenerator<SystemClock> {
    pub fn system() -> Self {
        Self::new(SystemClock::new())
    }
}

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

newtype_id!(ConversationId);
newtype_id!(AgentId);
newtype_id!(MessageId);
newtype_id!(TaskId);
newtype_id!(ProviderId);
newtype_id!(FileId);
newtype_id!(SessionId);

/// A participant in a conversation is either a known `AgentId` or a bare
/// user identifier string (users are not registered with the Agent Manager).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<AgentId> for ParticipantId {
    fn from(value: AgentId) -> Self {
        Self(value.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_within_a_process() {
        let gen = IdGenerator::system();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(gen.mint()));
        }
    }

    #[test]
    fn fixed_clock_advances_on_request() {
        let clock = FixedClock::new(1_000);
        let gen = IdGenerator::new(clock);
        let first = gen.now_millis();
        assert_eq!(first, 1_000);
    }

    #[test]
    fn system_clock_never_goes_backwards() {
        let clock = SystemClock::new();
        let mut last = clock.now_millis();
        for _ in 0..1000 {
            let next = clock.now_millis();
            assert!(next > last);
            last = next;
        }
    }
}
