//! Remote API transport.
//!
//! One CRUD endpoint family per entity kind:
//! ```text
//! Create  POST    {base}/{collection}
//! Update  PATCH   {base}/{collection}/{serverId}
//! Delete  DELETE  {base}/{collection}/{serverId}
//! ```
//! Bodies are JSON, or multipart (`data` part + one part per image) when
//! the entity carries images that need uploading.

use async_trait::async_trait;
use brewline_core::{EntityKind, ServerId, SyncMethod};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection refused, timeout, DNS failure.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Response body could not be read as the expected shape.
    #[error("Unreadable {kind} response: {reason}")]
    Body { kind: EntityKind, reason: String },
}

/// A binary image ready to be attached to a multipart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlob {
    pub field_name: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Empty,
    Json(Value),
    Multipart { data: Value, images: Vec<ImageBlob> },
}

impl RequestPayload {
    /// The JSON document carried by the payload, if any.
    pub fn data(&self) -> Option<&Value> {
        match self {
            RequestPayload::Empty => None,
            RequestPayload::Json(data) | RequestPayload::Multipart { data, .. } => Some(data),
        }
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self, RequestPayload::Multipart { .. })
    }
}

/// One remote call for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub kind: EntityKind,
    pub method: SyncMethod,
    /// Server id of the target document; absent for `Create`.
    pub target: Option<ServerId>,
    pub payload: RequestPayload,
    pub credential: Option<String>,
}

/// Issues remote calls. Returns the server's copy of the document
/// (`Value::Null` for deletes).
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send(&self, request: RemoteRequest) -> Result<Value, RemoteError>;
}

/// HTTP implementation of [`RemoteApi`].
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, kind: EntityKind, target: Option<&ServerId>) -> String {
        match target {
            Some(sid) => format!("{}/{}/{}", self.base_url, kind.collection_path(), sid),
            None => format!("{}/{}", self.base_url, kind.collection_path()),
        }
    }

    fn multipart_form(data: &Value, images: &[ImageBlob]) -> Result<reqwest::multipart::Form, RemoteError> {
        let mut form = reqwest::multipart::Form::new().text("data", data.to_string());
        for image in images {
            let part = reqwest::multipart::Part::bytes(image.bytes.clone())
                .file_name(image.file_name.clone())
                .mime_str("application/octet-stream")
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            form = form.part(image.field_name.clone(), part);
        }
        Ok(form)
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn send(&self, request: RemoteRequest) -> Result<Value, RemoteError> {
        let url = self.url(request.kind, request.target.as_ref());
        let mut builder = match request.method {
            SyncMethod::Create => self.client.post(&url),
            SyncMethod::Update => self.client.patch(&url),
            SyncMethod::Delete => self.client.delete(&url),
        };
        if let Some(token) = &request.credential {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.payload {
            RequestPayload::Empty => builder,
            RequestPayload::Json(data) => builder.json(data),
            RequestPayload::Multipart { data, images } => {
                builder.multipart(Self::multipart_form(data, images)?)
            }
        };

        log::debug!("{} {} ({})", request.method, url, request.kind);
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if request.method == SyncMethod::Delete {
            return Ok(Value::Null);
        }
        response.json::<Value>().await.map_err(|e| RemoteError::Body {
            kind: request.kind,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let remote = HttpRemote::new("https://api.example.test/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            remote.url(EntityKind::Recipe, None),
            "https://api.example.test/recipes"
        );
        assert_eq!(
            remote.url(EntityKind::Batch, Some(&ServerId::new("65a1f0c2e4b0a1b2c3d4e5f6"))),
            "https://api.example.test/process/batch/65a1f0c2e4b0a1b2c3d4e5f6"
        );
    }

    #[test]
    fn test_payload_accessors() {
        let json = RequestPayload::Json(serde_json::json!({ "name": "x" }));
        assert_eq!(json.data().unwrap()["name"], "x");
        assert!(!json.is_multipart());

        let multipart = RequestPayload::Multipart {
            data: serde_json::json!({}),
            images: Vec::new(),
        };
        assert!(multipart.is_multipart());
        assert!(RequestPayload::Empty.data().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let remote = HttpRemote::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = remote
            .send(RemoteRequest {
                kind: EntityKind::Recipe,
                method: SyncMethod::Create,
                target: None,
                payload: RequestPayload::Json(serde_json::json!({})),
                credential: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
    }
}
