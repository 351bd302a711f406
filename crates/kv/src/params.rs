//! Replication parameters (N, R, W).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("invalid replicas parameter {0:?}, expected <ack>/<from>")]
    Syntax(String),
    #[error("invalid replication N={n} R={r} W={w} for {cluster_size} nodes: need 1 <= R,W <= N <= cluster size")]
    OutOfRange {
        n: usize,
        r: usize,
        w: usize,
        cluster_size: usize,
    },
}

/// N replicas hold each key; reads need R answers and writes need W acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationParams {
    pub n: usize,
    pub r: usize,
    pub w: usize,
}

impl ReplicationParams {
    pub fn new(n: usize, r: usize, w: usize) -> Self {
        Self { n, r, w }
    }

    /// Majority of `n`.
    pub fn majority(n: usize) -> usize {
        n / 2 + 1
    }

    /// Every node holds every key; reads and writes need a majority.
    pub fn default_for(cluster_size: usize) -> Self {
        let quorum = Self::majority(cluster_size).min(cluster_size);
        Self::new(cluster_size, quorum, quorum)
    }

    /// Check `1 <= R,W <= N <= cluster_size`.
    pub fn validate(&self, cluster_size: usize) -> Result<(), ParamsError> {
        let ok = self.r >= 1
            && self.w >= 1
            && self.r <= self.n
            && self.w <= self.n
            && self.n <= cluster_size;
        if ok {
            Ok(())
        } else {
            Err(ParamsError::OutOfRange {
                n: self.n,
                r: self.r,
                w: self.w,
                cluster_size,
            })
        }
    }
}

impl fmt::Display for ReplicationParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N={} R={} W={}", self.n, self.r, self.w)
    }
}

/// Parses the client form `<ack>/<from>`: N = from, R = W = ack. Both parts
/// are positive decimal integers without leading zeros.
impl FromStr for ReplicationParams {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syntax = || ParamsError::Syntax(s.to_string());
        let (ack, from) = s.split_once('/').ok_or_else(syntax)?;
        let ack = parse_positive(ack).ok_or_else(syntax)?;
        let from = parse_positive(from).ok_or_else(syntax)?;
        Ok(Self::new(from, ack, ack))
    }
}

fn parse_positive(s: &str) -> Option<usize> {
    let mut chars = s.chars();
    let first = chars.next()?;
    if !('1'..='9').contains(&first) || !chars.all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
