use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::domain::{Entity, EntityId};
use crate::error::HarvestError;

/// Read access to the metadata portal.
pub trait PortalClient: Send + Sync {
    /// Runs a search (absolute URL or path relative to the portal API) and
    /// returns the entities listed under `@graph`.
    fn search(&self, query: &str) -> Result<Vec<Entity>, HarvestError>;

    /// Fetches one fully-embedded entity. `Ok(None)` means the portal does not
    /// know the id.
    fn fetch_by_id(&self, id: &EntityId) -> Result<Option<Entity>, HarvestError>;
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(rename = "@graph", default)]
    graph: Vec<Entity>,
}

#[derive(Clone)]
pub struct PortalHttpClient {
    client: Client,
    base_url: String,
}

impl PortalHttpClient {
    pub fn new(base_url: &str) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("portal-harvester/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::PortalHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| HarvestError::PortalHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn resolve_url(&self, query: &str) -> String {
        if query.starts_with("http://") || query.starts_with("https://") {
            query.to_string()
        } else {
            format!("{}{}", self.base_url, query)
        }
    }

    fn object_url(&self, id: &EntityId) -> String {
        format!("{}{}?frame=object", self.base_url, id.as_str())
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, HarvestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "portal request failed".to_string());
        Err(HarvestError::PortalStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, HarvestError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, attempt, "retrying portal request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(error = %err, attempt, "retrying portal request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(HarvestError::PortalHttp(err.to_string()));
                }
            }
        }
    }
}

impl PortalClient for PortalHttpClient {
    fn search(&self, query: &str) -> Result<Vec<Entity>, HarvestError> {
        let url = self.resolve_url(query);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let response = Self::handle_status(response)?;
        let envelope: SearchEnvelope = response
            .json()
            .map_err(|err| HarvestError::PortalHttp(format!("decode {url}: {err}")))?;
        tracing::info!(results = envelope.graph.len(), query, "portal search");
        Ok(envelope.graph)
    }

    fn fetch_by_id(&self, id: &EntityId) -> Result<Option<Entity>, HarvestError> {
        let url = self.object_url(id);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::handle_status(response)?;
        let entity: Entity = response
            .json()
            .map_err(|err| HarvestError::PortalHttp(format!("decode {url}: {err}")))?;
        Ok(Some(entity))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_and_absolute_queries() {
        let client = PortalHttpClient::new("https://api.data.igvf.org/").unwrap();
        assert_eq!(
            client.resolve_url("/search/?type=File"),
            "https://api.data.igvf.org/search/?type=File"
        );
        assert_eq!(
            client.resolve_url("https://other.example/search/"),
            "https://other.example/search/"
        );
        assert_eq!(
            client.object_url(&EntityId::new("/donors/D1/")),
            "https://api.data.igvf.org/donors/D1/?frame=object"
        );
    }

    #[test]
    fn search_envelope_reads_graph() {
        let envelope: SearchEnvelope = serde_json::from_str(
            r#"{"@graph": [{"@id": "/tissues/S1/", "accession": "S1"}], "total": 1}"#,
        )
        .unwrap();
        assert_eq!(envelope.graph.len(), 1);
        assert_eq!(envelope.graph[0].accession(), Some("S1"));
    }
}
