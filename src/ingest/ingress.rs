//! Ingress snapshot parsing and backend resolution
//!
//! Turns Ingress object snapshots into host/path routing models and resolves
//! Service + Endpoints snapshots into concrete server lists. Pure functions
//! over snapshots; all cross-object stitching lives in the ingestor.

use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::networking::v1::Ingress;
use tracing::warn;

use crate::graph::{MatchCriteria, Server};

/// One path routing rule extracted from an Ingress
#[derive(Clone, Debug, PartialEq)]
pub struct PathModel {
    /// The path, normalized to start with `/`
    pub path: String,
    /// How the path is matched, from the Ingress pathType
    pub criteria: MatchCriteria,
    /// Backend service name
    pub service: String,
    /// Backend service port number, when given by number
    pub port: Option<i32>,
    /// Backend service port name, when given by name
    pub port_name: Option<String>,
}

/// One host extracted from an Ingress, with its paths and TLS secret
#[derive(Clone, Debug, PartialEq)]
pub struct HostModel {
    /// The hostname
    pub host: String,
    /// Path rules under this host
    pub paths: Vec<PathModel>,
    /// TLS secret name when the host appears in the Ingress TLS section
    pub tls_secret: Option<String>,
}

/// Extract host/path routing models from an Ingress snapshot
///
/// Rules without a host or without an HTTP section are skipped. A path
/// backend without a service reference is skipped with a warning, matching
/// what the upstream object validation would reject anyway.
pub fn parse_ingress(ingress: &Ingress) -> Vec<HostModel> {
    let name = ingress.metadata.name.as_deref().unwrap_or_default();
    let Some(spec) = &ingress.spec else {
        return vec![];
    };

    // Hosts listed under a TLS block terminate TLS with that block's secret
    let mut tls_secrets: std::collections::HashMap<&str, &str> = Default::default();
    for tls in spec.tls.as_deref().unwrap_or_default() {
        let Some(secret) = tls.secret_name.as_deref() else {
            continue;
        };
        for host in tls.hosts.as_deref().unwrap_or_default() {
            tls_secrets.insert(host.as_str(), secret);
        }
    }

    let mut hosts = Vec::new();
    for rule in spec.rules.as_deref().unwrap_or_default() {
        let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) else {
            continue;
        };
        let Some(http) = &rule.http else {
            continue;
        };

        let mut paths = Vec::new();
        for path in &http.paths {
            let Some(service) = &path.backend.service else {
                warn!(ingress = name, host, "ingress path backend has no service, skipping");
                continue;
            };
            let criteria = match path.path_type.as_str() {
                "Exact" => MatchCriteria::Equals,
                // ImplementationSpecific behaves as a prefix match
                _ => MatchCriteria::BeginsWith,
            };
            let (port, port_name) = match &service.port {
                Some(p) => (p.number, p.name.clone()),
                None => (None, None),
            };
            paths.push(PathModel {
                path: path.path.clone().unwrap_or_else(|| "/".to_string()),
                criteria,
                service: service.name.clone(),
                port,
                port_name,
            });
        }
        if paths.is_empty() {
            continue;
        }
        hosts.push(HostModel {
            host: host.to_string(),
            paths,
            tls_secret: tls_secrets.get(host).map(|s| s.to_string()),
        });
    }
    hosts
}

/// Resolve a path backend against Service and Endpoints snapshots
///
/// The Ingress names a service port (by number or name); the Endpoints
/// object carries target ports keyed by the service port's name. Returns the
/// full server list for the resolved port, replaced wholesale on every
/// update.
pub fn resolve_servers(service: &Service, endpoints: &Endpoints, path: &PathModel) -> Vec<Server> {
    // Find the service port the ingress refers to, to learn its name
    let port_name: Option<String> = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| {
            ports.iter().find(|p| {
                path.port.is_some_and(|n| n == p.port)
                    || path
                        .port_name
                        .as_deref()
                        .is_some_and(|n| Some(n) == p.name.as_deref())
            })
        })
        .and_then(|p| p.name.clone());

    let mut servers = Vec::new();
    for subset in endpoints.subsets.as_deref().unwrap_or_default() {
        let ports = subset.ports.as_deref().unwrap_or_default();
        // Single-port endpoints match implicitly; otherwise match the
        // endpoints port by the service port's name
        let target = if ports.len() == 1 {
            Some(&ports[0])
        } else {
            ports.iter().find(|p| p.name == port_name)
        };
        let Some(target) = target else {
            continue;
        };
        let Ok(port) = u16::try_from(target.port) else {
            continue;
        };
        for addr in subset.addresses.as_deref().unwrap_or_default() {
            servers.push(Server {
                ip: addr.ip.clone(),
                port,
            });
        }
    }
    servers
}

/// Snapshot builders shared by ingestion and sync tests
#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Secret, ServicePort, ServiceSpec,
    };
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    };

    pub(crate) fn ingress_with(
        host: &str,
        path: &str,
        service: &str,
        port: i32,
        tls_secret: Option<&str>,
    ) -> Ingress {
        Ingress {
            metadata: kube::api::ObjectMeta {
                name: Some("test-ingress".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some(path.to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: service.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(port),
                                        name: None,
                                    }),
                                }),
                                resource: None,
                            },
                        }],
                    }),
                }]),
                tls: tls_secret.map(|secret| {
                    vec![IngressTLS {
                        hosts: Some(vec![host.to_string()]),
                        secret_name: Some(secret.to_string()),
                    }]
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub(crate) fn service_with(name: &str, port: i32) -> Service {
        Service {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub(crate) fn endpoints_with(name: &str, ips: &[&str], port: i32) -> Endpoints {
        Endpoints {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_string()),
                    port,
                    ..Default::default()
                }]),
                not_ready_addresses: None,
            }]),
        }
    }

    pub(crate) fn secret_with(name: &str) -> Secret {
        Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(
                [
                    ("tls.crt".to_string(), k8s_openapi::ByteString(b"---CERT---".to_vec())),
                    ("tls.key".to_string(), k8s_openapi::ByteString(b"---KEY---".to_vec())),
                ]
                .into(),
            ),
            ..Default::default()
        }
    }
}
