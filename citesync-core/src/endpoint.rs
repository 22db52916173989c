use reqwest::Method;
use serde_json::Value;
use thiserror::Error;

use crate::model::{EntityKind, MutationType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestShapeError {
    #[error("{kind} {mutation} requires a non-empty entity id")]
    MissingEntityId {
        kind: EntityKind,
        mutation: MutationType,
    },
    #[error("{kind} {mutation} requires a parent list id")]
    MissingParent {
        kind: EntityKind,
        mutation: MutationType,
    },
    #[error("{kind} {mutation} requires a payload")]
    MissingPayload {
        kind: EntityKind,
        mutation: MutationType,
    },
}

/// A backend call derived from a queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub segments: Vec<String>,
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Slash-joined path, unencoded. Used for logs and error messages.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

/// Maps a mutation onto the backend endpoint table.
///
/// Lists and projects live under `/{collection}` and `/{collection}/{id}`;
/// citations are scoped under their parent list. Create and update carry the
/// payload as the body, delete never has one.
pub fn build_request(
    mutation: MutationType,
    kind: EntityKind,
    entity_id: &str,
    parent_id: Option<&str>,
    payload: Option<&Value>,
) -> Result<ApiRequest, RequestShapeError> {
    let mut segments = match kind {
        EntityKind::List => vec!["lists".to_string()],
        EntityKind::Project => vec!["projects".to_string()],
        EntityKind::Citation => {
            let parent = parent_id
                .filter(|id| !id.trim().is_empty())
                .ok_or(RequestShapeError::MissingParent { kind, mutation })?;
            vec![
                "lists".to_string(),
                parent.to_string(),
                "citations".to_string(),
            ]
        }
    };

    let (method, body) = match mutation {
        MutationType::Create => (
            Method::POST,
            Some(
                payload
                    .cloned()
                    .ok_or(RequestShapeError::MissingPayload { kind, mutation })?,
            ),
        ),
        MutationType::Update => (
            Method::PUT,
            Some(
                payload
                    .cloned()
                    .ok_or(RequestShapeError::MissingPayload { kind, mutation })?,
            ),
        ),
        MutationType::Delete => (Method::DELETE, None),
    };

    if mutation != MutationType::Create {
        if entity_id.trim().is_empty() {
            return Err(RequestShapeError::MissingEntityId { kind, mutation });
        }
        segments.push(entity_id.to_string());
    }

    Ok(ApiRequest {
        method,
        segments,
        body,
    })
}
