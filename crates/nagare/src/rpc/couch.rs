//! HTTP client for CouchDB-compatible servers.

use super::{
    Ack, DatabaseClient, DatabaseInfo, DocRef, Document, JobRef, ReplicationOptions,
    ReplicationState, ReplicationStatus, RpcError, RpcResult,
};
use crate::config::{ClientConfig, ConfigError};
use async_trait::async_trait;
use nagare_core::PermanentKind;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const REPLICATOR_DB: &str = "_replicator";

/// Client for a CouchDB-compatible HTTP API.
///
/// Replication jobs are documents in the `_replicator` database; stopping a
/// job deletes its document, which requires the document's current revision.
#[derive(Debug, Clone)]
pub struct CouchClient {
    base: Url,
    client: Client,
    config: ClientConfig,
}

/// Error body returned by the server
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct OkBody {
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct WriteBody {
    id: String,
    rev: String,
}

/// Request payload for a `_replicator` document
#[derive(Debug, Serialize)]
struct ReplicationRequest<'a> {
    source: &'a str,
    target: &'a str,
    create_target: bool,
    continuous: bool,
}

#[derive(Debug, Deserialize)]
struct ReplicatorDoc {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_rev")]
    rev: String,
    #[serde(default)]
    source: Value,
    #[serde(default)]
    target: Value,
    #[serde(rename = "_replication_state", default)]
    state: Option<ReplicationState>,
}

impl CouchClient {
    /// Creates a client from configuration.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            ConfigError::Invalid(format!("invalid base_url '{}': {}", config.base_url, e))
        })?;
        if base.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "base_url '{}' cannot carry a path",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;

        Ok(Self {
            base,
            client,
            config,
        })
    }

    /// Base URL of the server.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> RpcResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                RpcError::permanent(PermanentKind::InvalidInput, "base URL cannot carry a path")
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Replication endpoints are given as absolute URLs; bare names are
    /// resolved against this server.
    fn endpoint(&self, database: &str) -> RpcResult<String> {
        if database.starts_with("http://") || database.starts_with("https://") {
            Ok(database.to_string())
        } else {
            self.url(&[database]).map(String::from)
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_deref()),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> RpcResult<T> {
        let response = request.send().await.map_err(map_http_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_http_error)?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            RpcError::permanent(PermanentKind::Other, format!("malformed response: {}", e))
        })
    }
}

/// Maps an unsuccessful HTTP status (and the server's error body) to an [`RpcError`].
pub fn classify_status(status: StatusCode, body: &str) -> RpcError {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error, reason }) if reason.is_empty() => error,
        Ok(ErrorBody { error, reason }) => format!("{}: {}", error, reason),
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => body.trim().to_string(),
    };

    let kind = match status {
        StatusCode::BAD_REQUEST => PermanentKind::InvalidInput,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PermanentKind::Unauthorized,
        StatusCode::NOT_FOUND => PermanentKind::NotFound,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => PermanentKind::Conflict,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            return RpcError::Transient(message)
        }
        s if s.is_server_error() => return RpcError::Transient(message),
        _ => PermanentKind::Other,
    };
    RpcError::Permanent { kind, message }
}

fn map_http_error(error: reqwest::Error) -> RpcError {
    if error.is_timeout() {
        RpcError::Transient(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        RpcError::Transient(format!("Connection error: {}", error))
    } else if error.is_builder() {
        RpcError::permanent(PermanentKind::InvalidInput, format!("Invalid request: {}", error))
    } else {
        RpcError::Transient(format!("HTTP error: {}", error))
    }
}

fn endpoint_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

#[async_trait]
impl DatabaseClient for CouchClient {
    #[instrument(skip(self))]
    async fn create_database(&self, name: &str) -> RpcResult<DatabaseInfo> {
        let url = self.url(&[name])?;
        let body: OkBody = self.send(self.request(Method::PUT, url)).await?;
        debug!("Created database {}", name);
        Ok(DatabaseInfo {
            name: name.to_string(),
            ok: body.ok,
        })
    }

    #[instrument(skip(self))]
    async fn delete_database(&self, name: &str) -> RpcResult<Ack> {
        let url = self.url(&[name])?;
        let body: OkBody = self.send(self.request(Method::DELETE, url)).await?;
        debug!("Deleted database {}", name);
        Ok(Ack { ok: body.ok })
    }

    #[instrument(skip(self))]
    async fn start_replication(
        &self,
        source: &str,
        target: &str,
        options: ReplicationOptions,
    ) -> RpcResult<JobRef> {
        let source = self.endpoint(source)?;
        let target = self.endpoint(target)?;
        let payload = ReplicationRequest {
            source: &source,
            target: &target,
            create_target: options.create_target,
            continuous: options.continuous,
        };

        let url = self.url(&[REPLICATOR_DB])?;
        let body: WriteBody = self
            .send(self.request(Method::POST, url).json(&payload))
            .await?;
        debug!("Started replication job {}", body.id);
        Ok(JobRef {
            id: body.id,
            rev: body.rev,
        })
    }

    #[instrument(skip(self), fields(job_id = %job.id))]
    async fn stop_replication(&self, job: &JobRef) -> RpcResult<Ack> {
        let mut url = self.url(&[REPLICATOR_DB, &job.id])?;
        url.query_pairs_mut().append_pair("rev", &job.rev);
        let body: OkBody = self.send(self.request(Method::DELETE, url)).await?;
        debug!("Stopped replication job {}", job.id);
        Ok(Ack { ok: body.ok })
    }

    #[instrument(skip(self))]
    async fn replication_status(&self, job_id: &str) -> RpcResult<ReplicationStatus> {
        let url = self.url(&[REPLICATOR_DB, job_id])?;
        let doc: ReplicatorDoc = self.send(self.request(Method::GET, url)).await?;
        Ok(ReplicationStatus {
            id: doc.id,
            rev: doc.rev,
            state: doc.state,
            source: endpoint_label(&doc.source),
            target: endpoint_label(&doc.target),
        })
    }

    #[instrument(skip(self, doc))]
    async fn save_doc(&self, db: &str, doc: &Value) -> RpcResult<DocRef> {
        let url = self.url(&[db])?;
        let body: WriteBody = self.send(self.request(Method::POST, url).json(doc)).await?;
        Ok(DocRef {
            id: body.id,
            rev: body.rev,
        })
    }

    #[instrument(skip(self))]
    async fn get_doc(&self, db: &str, id: &str) -> RpcResult<Document> {
        let url = self.url(&[db, id])?;
        let body: Value = self.send(self.request(Method::GET, url)).await?;
        let field = |name: &str| {
            body.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    RpcError::permanent(
                        PermanentKind::Other,
                        format!("document {} has no {}", id, name),
                    )
                })
        };
        let id = field("_id")?;
        let rev = field("_rev")?;
        Ok(Document { id, rev, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> CouchClient {
        CouchClient::new(ClientConfig {
            base_url: base_url.to_string(),
            ..ClientConfig::default()
        })
        .expect("valid config")
    }

    #[test]
    fn test_classify_status() {
        let body = r#"{"error":"not_found","reason":"Database does not exist."}"#;
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, body),
            RpcError::not_found("not_found: Database does not exist.")
        );

        let body = r#"{"error":"file_exists","reason":"The database could not be created, the file already exists."}"#;
        assert!(matches!(
            classify_status(StatusCode::PRECONDITION_FAILED, body),
            RpcError::Permanent {
                kind: PermanentKind::Conflict,
                ..
            }
        ));

        assert_eq!(
            classify_status(StatusCode::CONFLICT, r#"{"error":"conflict"}"#),
            RpcError::conflict("conflict")
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            RpcError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            RpcError::Transient(m) if m == "slow down"
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "{}"),
            RpcError::Permanent {
                kind: PermanentKind::Unauthorized,
                ..
            }
        ));
    }

    #[test]
    fn test_url_segments_are_encoded() {
        let couch = client("http://localhost:5984");
        let url = couch.url(&["a/b", "doc 1"]).expect("url");
        assert_eq!(url.as_str(), "http://localhost:5984/a%2Fb/doc%201");

        let couch = client("http://localhost:5984/couch/");
        let url = couch.url(&["_replicator"]).expect("url");
        assert_eq!(url.as_str(), "http://localhost:5984/couch/_replicator");
    }

    #[test]
    fn test_endpoint_resolution() {
        let couch = client("http://localhost:5984");
        assert_eq!(
            couch.endpoint("source_db").expect("endpoint"),
            "http://localhost:5984/source_db"
        );
        assert_eq!(
            couch.endpoint("https://remote.example/db").expect("endpoint"),
            "https://remote.example/db"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = CouchClient::new(ClientConfig {
            base_url: "not a url".to_string(),
            ..ClientConfig::default()
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_replicator_doc_parsing() {
        let doc: ReplicatorDoc = serde_json::from_str(
            r#"{"_id":"job1","_rev":"2-abc","source":{"url":"http://h/a"},"target":"http://h/b","_replication_state":"triggered"}"#,
        )
        .expect("valid doc");
        assert_eq!(doc.state, Some(ReplicationState::Triggered));
        assert_eq!(endpoint_label(&doc.source), "http://h/a");
        assert_eq!(endpoint_label(&doc.target), "http://h/b");

        let doc: ReplicatorDoc =
            serde_json::from_str(r#"{"_id":"job2","_rev":"1-abc","source":"a","target":"b"}"#)
                .expect("valid doc");
        assert_eq!(doc.state, None);
    }
}
