//! HTTP implementations of [`ServerApi`] and [`RemoteStore`].
//!
//! Every request injects the bearer token when one is configured and pings
//! the sync-activity indicator, so the UI's arrows move whenever the engine
//! talks to a server.

use crate::remote::{ChangeBatch, RemoteChange, RemoteError, RemoteStore};
use crate::server_api::ServerApi;
use crate::status::ThrottledStatus;
use async_trait::async_trait;
use outpost_model::{ConnectionInfo, Listing, ListingId, ProjectDoc, ProjectId};
use serde_json::{json, Value as Json};
use std::sync::Arc;
use tracing::debug;
use url::Url;

fn join_url(base: &str, path: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

fn map_status(status: reqwest::StatusCode, body: String) -> RemoteError {
    match status {
        reqwest::StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        reqwest::StatusCode::FORBIDDEN => RemoteError::Denied(body),
        _ => RemoteError::Network(format!("http {}: {}", status, body)),
    }
}

fn map_transport(error: reqwest::Error) -> RemoteError {
    RemoteError::Network(error.to_string())
}

/// Server API client over reqwest.
pub struct HttpServerApi {
    client: reqwest::Client,
    status: Arc<ThrottledStatus>,
}

impl HttpServerApi {
    pub fn new(status: Arc<ThrottledStatus>) -> Self {
        Self {
            client: reqwest::Client::new(),
            status,
        }
    }

    fn get(&self, url: &str, token: Option<&str>) -> reqwest::RequestBuilder {
        self.status.ping_down();
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<T, RemoteError> {
        let response = self.get(url, token).send().await.map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn fetch_info(&self, url: &str) -> Result<Listing, RemoteError> {
        let mut listing: Listing = self.get_json(&join_url(url, "api/info"), None).await?;
        if listing.base_url.is_none() {
            listing.base_url = Some(url.to_string());
        }
        if listing.id.as_str().is_empty() {
            let host = Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_else(|| url.to_string());
            listing.id = ListingId::from(host);
        }
        Ok(listing)
    }

    async fn fetch_directory(
        &self,
        listing: &Listing,
        token: Option<&str>,
    ) -> Result<Vec<ProjectDoc>, RemoteError> {
        let base = listing
            .base_url
            .as_deref()
            .ok_or_else(|| RemoteError::Misconfigured(format!("listing {}", listing.id)))?;
        self.get_json(&join_url(base, "api/directory"), token).await
    }

    async fn fetch_project_metadata(
        &self,
        listing: &Listing,
        project_id: &ProjectId,
        token: Option<&str>,
    ) -> Result<Json, RemoteError> {
        let base = listing
            .base_url
            .as_deref()
            .ok_or_else(|| RemoteError::Misconfigured(format!("listing {}", listing.id)))?;
        let url = join_url(base, &format!("api/projects/{}/metadata", project_id));
        self.get_json(&url, token).await
    }

    fn open_remote(&self, info: &ConnectionInfo) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        let url = info
            .database_url()
            .ok_or_else(|| RemoteError::Misconfigured(format!("database {}", info.db_name)))?;
        Ok(Arc::new(HttpRemoteStore {
            client: self.client.clone(),
            name: info.db_name.clone(),
            url,
            token: info.jwt_token.clone(),
            status: self.status.clone(),
        }))
    }
}

/// A remote document database spoken to over HTTP.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    name: String,
    url: String,
    token: Option<String>,
    status: Arc<ThrottledStatus>,
}

impl HttpRemoteStore {
    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        self.status.ping_up();
        self.status.ping_down();
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn changes_since(
        &self,
        since: u64,
        limit: usize,
        skip_attachments: bool,
    ) -> Result<ChangeBatch, RemoteError> {
        let mut url = format!(
            "{}?since={}&limit={}&include_docs=true",
            join_url(&self.url, "_changes"),
            since,
            limit
        );
        if skip_attachments {
            url.push_str("&skip_attachments=true");
        }
        debug!(remote = %self.name, since, "pulling changes");
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        let body: Json = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        let results = body
            .get("results")
            .and_then(Json::as_array)
            .ok_or_else(|| RemoteError::Protocol("changes feed without results".into()))?;
        let mut changes = Vec::with_capacity(results.len());
        for row in results {
            let id = row
                .get("id")
                .and_then(Json::as_str)
                .ok_or_else(|| RemoteError::Protocol("change row without id".into()))?;
            changes.push(RemoteChange {
                seq: row.get("seq").and_then(Json::as_u64).unwrap_or(0),
                id: id.to_string(),
                deleted: row.get("deleted").and_then(Json::as_bool).unwrap_or(false),
                doc: row.get("doc").cloned().filter(|d| !d.is_null()),
            });
        }
        Ok(ChangeBatch {
            changes,
            last_seq: body.get("last_seq").and_then(Json::as_u64).unwrap_or(since),
            pending: body.get("pending").and_then(Json::as_u64).unwrap_or(0) > 0,
        })
    }

    async fn push(&self, docs: Vec<RemoteChange>) -> Result<(), RemoteError> {
        let rows: Vec<Json> = docs
            .into_iter()
            .map(|change| {
                json!({
                    "id": change.id,
                    "deleted": change.deleted,
                    "doc": change.doc,
                })
            })
            .collect();
        let response = self
            .request(self.client.post(join_url(&self.url, "_bulk_docs")))
            .json(&json!({ "docs": rows }))
            .send()
            .await
            .map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_trailing_slash() {
        assert_eq!(join_url("https://x/", "api/info"), "https://x/api/info");
        assert_eq!(join_url("https://x", "api/info"), "https://x/api/info");
    }

    #[test]
    fn open_remote_requires_base_url() {
        let api = HttpServerApi::new(Arc::new(ThrottledStatus::new(Arc::new(
            crate::status::NullStatusSink,
        ))));
        let incomplete = ConnectionInfo {
            db_name: "data-x".to_string(),
            ..ConnectionInfo::default()
        };
        assert!(matches!(
            api.open_remote(&incomplete),
            Err(RemoteError::Misconfigured(_))
        ));
    }
}
