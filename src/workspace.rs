use std::thread;
use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use tracing::info;

use crate::error::HarvestError;
use crate::transfer::ACCESS_TOKEN_VAR;

const FIRECLOUD_API: &str = "https://api.firecloud.org/api";

pub trait WorkspaceClient: Send + Sync {
    fn delete_table(&self, namespace: &str, name: &str, table: &str) -> Result<(), HarvestError>;
    fn upload_table(&self, namespace: &str, name: &str, tsv: &str) -> Result<(), HarvestError>;
}

/// Pauses the workspace service needs before deleted tables can be recreated
/// and between consecutive imports.
#[derive(Debug, Clone, Copy)]
pub struct SettleDelays {
    pub after_delete: Duration,
    pub between_uploads: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            after_delete: Duration::from_secs(15),
            between_uploads: Duration::from_secs(1),
        }
    }
}

/// Entity type a TSV imports into: its first header cell without `_id`.
pub fn table_name_from_tsv(tsv: &str) -> &str {
    let first = tsv
        .split(['\t', '\n'])
        .next()
        .unwrap_or_default();
    first.strip_suffix("_id").unwrap_or(first)
}

/// Imports `tables` in order. With `overwrite`, every existing table is
/// deleted first.
pub fn upload_tables<W, I, S>(
    client: &W,
    namespace: &str,
    name: &str,
    tables: I,
    overwrite: bool,
    delays: SettleDelays,
) -> Result<usize, HarvestError>
where
    W: WorkspaceClient + ?Sized,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let tables: Vec<S> = tables.into_iter().collect();
    if overwrite {
        for tsv in &tables {
            let table = table_name_from_tsv(tsv.as_ref());
            info!(table, namespace, workspace = name, "deleting table");
            client.delete_table(namespace, name, table)?;
        }
        thread::sleep(delays.after_delete);
    }
    for tsv in &tables {
        let table = table_name_from_tsv(tsv.as_ref());
        info!(table, namespace, workspace = name, "writing table");
        client.upload_table(namespace, name, tsv.as_ref())?;
        thread::sleep(delays.between_uploads);
    }
    Ok(tables.len())
}

/// Firecloud workspace API, authorized with the same Google bearer token as
/// the transfer service.
#[derive(Clone)]
pub struct FirecloudHttpClient {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl FirecloudHttpClient {
    pub fn new(access_token: Option<String>) -> Result<Self, HarvestError> {
        Self::with_base_url(FIRECLOUD_API, access_token)
    }

    pub fn from_env() -> Result<Self, HarvestError> {
        Self::new(std::env::var(ACCESS_TOKEN_VAR).ok())
    }

    pub fn with_base_url(base_url: &str, access_token: Option<String>) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("portal-harvester/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::WorkspaceHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| HarvestError::WorkspaceHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn workspace_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/workspaces/{namespace}/{name}", self.base_url)
    }

    fn request(&self, method: Method, url: String) -> Result<RequestBuilder, HarvestError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| HarvestError::MissingCredentials(ACCESS_TOKEN_VAR.to_string()))?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    fn handle_status(response: Response) -> Result<Response, HarvestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "workspace request failed".to_string());
        Err(HarvestError::WorkspaceStatus { status, message })
    }
}

impl WorkspaceClient for FirecloudHttpClient {
    fn delete_table(&self, namespace: &str, name: &str, table: &str) -> Result<(), HarvestError> {
        let url = format!("{}/entityTypes/{table}", self.workspace_url(namespace, name));
        let response = self
            .request(Method::DELETE, url)?
            .send()
            .map_err(|err| HarvestError::WorkspaceHttp(err.to_string()))?;
        // Nothing to delete on a fresh workspace.
        if response.status() == StatusCode::NOT_FOUND {
            info!(table, "table did not exist");
            return Ok(());
        }
        let response = Self::handle_status(response)?;
        info!(table, status = response.status().as_u16(), "deleted table");
        Ok(())
    }

    fn upload_table(&self, namespace: &str, name: &str, tsv: &str) -> Result<(), HarvestError> {
        let url = format!(
            "{}/flexibleImportEntities",
            self.workspace_url(namespace, name)
        );
        let part = Part::text(tsv.to_string())
            .file_name("entities.tsv")
            .mime_str("text/tab-separated-values")
            .map_err(|err| HarvestError::WorkspaceHttp(err.to_string()))?;
        let response = self
            .request(Method::POST, url)?
            .multipart(Form::new().part("entities", part))
            .send()
            .map_err(|err| HarvestError::WorkspaceHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        info!(status = response.status().as_u16(), "imported table");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Default)]
    struct RecordingWorkspace {
        calls: Mutex<Vec<String>>,
        fail_upload_of: Option<&'static str>,
    }

    impl WorkspaceClient for RecordingWorkspace {
        fn delete_table(&self, _: &str, _: &str, table: &str) -> Result<(), HarvestError> {
            self.calls.lock().unwrap().push(format!("delete {table}"));
            Ok(())
        }

        fn upload_table(&self, _: &str, _: &str, tsv: &str) -> Result<(), HarvestError> {
            let table = table_name_from_tsv(tsv).to_string();
            self.calls.lock().unwrap().push(format!("upload {table}"));
            if self.fail_upload_of == Some(table.as_str()) {
                return Err(HarvestError::WorkspaceStatus {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    fn no_delay() -> SettleDelays {
        SettleDelays {
            after_delete: Duration::ZERO,
            between_uploads: Duration::ZERO,
        }
    }

    const TABLES: [&str; 2] = [
        "file_id\tfile_path\tportal_url\nF1\tgs://b/x\thttps://p/files/F1/",
        "donor_id\tportal_url\nD1\thttps://p/donors/D1/",
    ];

    #[test]
    fn table_name_strips_id_suffix() {
        assert_eq!(table_name_from_tsv(TABLES[0]), "file");
        assert_eq!(table_name_from_tsv("sample_id\tportal_url"), "sample");
        assert_eq!(table_name_from_tsv("entity:thing\tx"), "entity:thing");
    }

    #[test]
    fn overwrite_deletes_every_table_before_uploading() {
        let workspace = RecordingWorkspace::default();
        let uploaded = upload_tables(&workspace, "ns", "ws", TABLES, true, no_delay()).unwrap();
        assert_eq!(uploaded, 2);
        assert_eq!(
            *workspace.calls.lock().unwrap(),
            vec!["delete file", "delete donor", "upload file", "upload donor"]
        );
    }

    #[test]
    fn upload_without_overwrite_never_deletes() {
        let workspace = RecordingWorkspace::default();
        upload_tables(&workspace, "ns", "ws", TABLES, false, no_delay()).unwrap();
        assert_eq!(
            *workspace.calls.lock().unwrap(),
            vec!["upload file", "upload donor"]
        );
    }

    #[test]
    fn failed_upload_stops_remaining_tables() {
        let workspace = RecordingWorkspace {
            fail_upload_of: Some("file"),
            ..Default::default()
        };
        let result = upload_tables(&workspace, "ns", "ws", TABLES, false, no_delay());
        assert_matches!(result, Err(HarvestError::WorkspaceStatus { status: 500, .. }));
        assert_eq!(*workspace.calls.lock().unwrap(), vec!["upload file"]);
    }
}
