//! Shared types for Trellis policy CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Admission outcome of a policy CRD
///
/// Every policy CRD starts Pending, and transitions to Accepted only after
/// every object reference it contains is confirmed to exist. Any unresolved
/// reference forces Rejected, and the CRD's effects are excluded from the
/// graph while Rejected.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CrdPhase {
    /// Initial state, not yet validated
    #[default]
    Pending,
    /// All references resolved; effects are active in the graph
    Accepted,
    /// Validation failed; effects are excluded from the graph
    Rejected,
}

impl std::fmt::Display for CrdPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Accepted => write!(f, "Accepted"),
            Self::Rejected => write!(f, "Rejected"),
        }
    }
}

/// Status carried by every Trellis policy CRD
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrdStatus {
    /// Admission outcome
    #[serde(default)]
    pub status: CrdPhase,

    /// Human-readable reason when Rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<DateTime<Utc>>,
}

impl CrdStatus {
    /// An Accepted status with no error
    pub fn accepted() -> Self {
        Self {
            status: CrdPhase::Accepted,
            error: None,
            transition_time: Some(Utc::now()),
        }
    }

    /// A Rejected status carrying the validation error
    pub fn rejected(err: impl Into<String>) -> Self {
        Self {
            status: CrdPhase::Rejected,
            error: Some(err.into()),
            transition_time: Some(Utc::now()),
        }
    }

    /// True when phase and error match, ignoring the transition timestamp
    ///
    /// Used to skip no-op status patches.
    pub fn same_outcome(&self, other: &CrdStatus) -> bool {
        self.status == other.status && self.error == other.error
    }
}

/// One listener port carried by a HostOverride
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    /// TCP port the virtual service listens on
    pub port: u16,

    /// Whether TLS is terminated on this port
    #[serde(default)]
    pub enable_ssl: bool,
}

/// Load-balancing algorithms selectable per pool
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbAlgorithm {
    /// Round-robin across servers
    RoundRobin,
    /// Fewest open connections first
    LeastConnections,
    /// Fastest observed response first
    FastestResponse,
    /// Consistent hash; requires a hash key
    ConsistentHash,
}

impl std::fmt::Display for LbAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RoundRobin => "LB_ALGORITHM_ROUND_ROBIN",
            Self::LeastConnections => "LB_ALGORITHM_LEAST_CONNECTIONS",
            Self::FastestResponse => "LB_ALGORITHM_FASTEST_RESPONSE",
            Self::ConsistentHash => "LB_ALGORITHM_CONSISTENT_HASH",
        };
        f.write_str(s)
    }
}
