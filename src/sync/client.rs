//! reqwest-backed implementation of the remote controller boundary
//!
//! Mechanical CRUD against the controller's REST API: JSON bodies, basic
//! auth, tenant header, bounded request timeout. Transport failures map to
//! the transient error class, HTTP error statuses to the API error class;
//! classification into retry lanes happens in the sync engine.
//!
//! Each created or updated object carries the sync engine's checksum in its
//! `cloud_config_cksum` field, so inventory pulls can rebuild the cache with
//! comparable checksums.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use super::rest::{CreateResponse, LbApi, RemoteObject, RestPatch};
use crate::cache::ObjectKind;
use crate::{Error, Result};

/// Remote controller REST client
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestClient {
    /// Connect to the controller at `base_url`
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::transient(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, kind: ObjectKind, uuid: Option<&str>) -> String {
        match uuid {
            Some(uuid) => format!("{}/api/{}/{}", self.base_url, kind.api_path(), uuid),
            None => format!("{}/api/{}", self.base_url, kind.api_path()),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str, tenant: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header("X-Tenant", tenant)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::api(status.as_u16(), message));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("invalid controller response: {e}")))
    }
}

fn map_transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::transient(format!("controller request timed out: {err}"))
    } else if err.is_connect() {
        Error::transient(format!("controller connection failed: {err}"))
    } else {
        Error::transient(err.to_string())
    }
}

/// Extract the VIP address from a VsVip body, when allocated
fn vip_of(body: &Value) -> Option<String> {
    body.get("vip")?
        .get(0)?
        .get("ip_address")?
        .get("addr")?
        .as_str()
        .map(String::from)
}

#[async_trait]
impl LbApi for RestClient {
    async fn create(&self, kind: ObjectKind, tenant: &str, body: &Value) -> Result<CreateResponse> {
        let url = self.url(kind, None);
        debug!(kind = kind.api_path(), %url, "POST");
        let response = self
            .send(self.request(reqwest::Method::POST, &url, tenant).json(body))
            .await?;
        let uuid = response
            .get("uuid")
            .and_then(|u| u.as_str())
            .ok_or_else(|| Error::serialization("create response missing uuid"))?
            .to_string();
        Ok(CreateResponse {
            uuid,
            vip: vip_of(&response),
        })
    }

    async fn update(&self, kind: ObjectKind, tenant: &str, uuid: &str, body: &Value) -> Result<()> {
        let url = self.url(kind, Some(uuid));
        debug!(kind = kind.api_path(), %url, "PUT");
        self.send(self.request(reqwest::Method::PUT, &url, tenant).json(body))
            .await?;
        Ok(())
    }

    async fn patch(&self, kind: ObjectKind, tenant: &str, uuid: &str, patch: &RestPatch) -> Result<()> {
        let url = self.url(kind, Some(uuid));
        debug!(kind = kind.api_path(), %url, "PATCH");
        self.send(
            self.request(reqwest::Method::PATCH, &url, tenant)
                .json(&serde_json::json!({ "replace": patch.body() })),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, tenant: &str, uuid: &str) -> Result<()> {
        let url = self.url(kind, Some(uuid));
        debug!(kind = kind.api_path(), %url, "DELETE");
        self.send(self.request(reqwest::Method::DELETE, &url, tenant))
            .await?;
        Ok(())
    }

    async fn list_by_tenant(&self, kind: ObjectKind, tenant: &str) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut url = format!("{}?page_size=200", self.url(kind, None));
        loop {
            let page = self
                .send(self.request(reqwest::Method::GET, &url, tenant))
                .await?;
            for result in page
                .get("results")
                .and_then(|r| r.as_array())
                .into_iter()
                .flatten()
            {
                let Some(name) = result.get("name").and_then(|n| n.as_str()) else {
                    continue;
                };
                let Some(uuid) = result.get("uuid").and_then(|u| u.as_str()) else {
                    continue;
                };
                let checksum = result
                    .get("cloud_config_cksum")
                    .and_then(|c| c.as_str())
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                let parent = result
                    .get("vh_parent_vs_ref")
                    .and_then(|r| r.as_str())
                    .and_then(|r| r.split("name=").nth(1))
                    .map(String::from);
                objects.push(RemoteObject {
                    name: name.to_string(),
                    uuid: uuid.to_string(),
                    checksum,
                    vip: vip_of(result),
                    parent,
                });
            }
            match page.get("next").and_then(|n| n.as_str()) {
                Some(next) => url = next.to_string(),
                None => break,
            }
        }
        debug!(kind = kind.api_path(), count = objects.len(), "listed tenant inventory");
        Ok(objects)
    }
}
