//! Policy Custom Resource Definitions for Trellis
//!
//! These CRDs carry load-balancer policy that cannot be expressed on core
//! Kubernetes objects. Each carries the shared Pending/Accepted/Rejected
//! status; a CRD's effects reach the graph only while it is Accepted.

mod host_override;
mod infra_setting;
mod path_override;
mod sso_policy;
mod types;

pub use host_override::{HostOverride, HostOverrideSpec, TlsOverride};
pub use infra_setting::{InfraSetting, InfraSettingSpec};
pub use path_override::{PathOverride, PathOverrideSpec, PathRule, PathTls};
pub use sso_policy::{AcsType, OauthConfig, SamlConfig, SsoPolicy, SsoPolicySpec};
pub use types::{CrdPhase, CrdStatus, LbAlgorithm, ListenerSpec};
