//! ringkv-common: shared types for the ringkv project.
//!
//! Provides the cluster member identifier [`NodeId`], the write
//! [`Timestamp`] used for latest-timestamp-wins reconciliation, and the
//! [`MonotonicClock`] coordinators use to stamp accepted writes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Identifier of a cluster member: its base URL, e.g. `http://127.0.0.1:7000`.
///
/// Identifiers are compared as plain strings; a trailing `/` is stripped on
/// construction so `http://a:1/` and `http://a:1` name the same node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        let mut id = id.into();
        while id.ends_with('/') {
            id.pop();
        }
        Self(id)
    }

    /// Identifier derived from a bare `host:port` listen address.
    pub fn from_addr(addr: impl fmt::Display) -> Self {
        Self::new(format!("http://{}", addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Write timestamp in nanoseconds since the Unix epoch.
///
/// Assigned once by the coordinator that accepts a write and carried
/// unchanged to every replica, so all copies of one logical write agree.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Smaller than any timestamp a clock can produce.
    pub const ZERO: Self = Self(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Nanoseconds elapsed from `self` until `later`, saturating at zero.
    pub fn nanos_until(&self, later: Timestamp) -> u64 {
        later.0.saturating_sub(self.0)
    }

    /// Current wall-clock time, without the monotonicity guarantee of
    /// [`MonotonicClock`]. Used for retention decisions, not for stamping.
    pub fn wall_clock() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
        )
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid timestamp: {0:?}")]
pub struct ParseTimestampError(String);

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| ParseTimestampError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MonotonicClock
// ---------------------------------------------------------------------------

/// Nanosecond wall clock that never goes backwards and never repeats.
///
/// The wall-clock reading is taken once at construction; later readings add
/// the elapsed monotonic time to it, so NTP steps cannot reorder writes
/// accepted by the same process. Consecutive calls are strictly increasing.
#[derive(Debug)]
pub struct MonotonicClock {
    anchor_wall: u64,
    anchor_instant: Instant,
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Timestamp::wall_clock().as_nanos(),
            anchor_instant: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Return the next timestamp.
    pub fn now(&self) -> Timestamp {
        let reading = self
            .anchor_wall
            .saturating_add(self.anchor_instant.elapsed().as_nanos() as u64);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = reading.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Timestamp(next),
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
