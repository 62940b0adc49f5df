//! # Backend REST Collaborators
//!
//! The console talks to the exploration backend for two things only: creating
//! the exploration record that scopes a session, and posting detection frames
//! against it. [`ExplorationApi`] is the seam; [`http::HttpExplorationApi`] is
//! the reqwest implementation used at runtime.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Backend answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Backend rejected the request: {0}")]
    Rejected(String),
}

/// Identifier the backend assigns to an exploration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExplorationId(pub String);

impl fmt::Display for ExplorationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateExplorationRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExplorationResponse {
    #[serde(default)]
    pub message: String,
    pub exploration_id: ExplorationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectDetectionUpload {
    pub exploration_id: ExplorationId,
    /// Base64 of the annotated frame
    pub image_blob: String,
}

#[async_trait]
pub trait ExplorationApi: Send + Sync + 'static {
    async fn create_exploration(
        &self,
        request: &CreateExplorationRequest,
    ) -> Result<CreateExplorationResponse, BackendError>;

    async fn post_object_detection(&self, upload: &ObjectDetectionUpload)
        -> Result<(), BackendError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shapes_match_backend() {
        let response: CreateExplorationResponse =
            serde_json::from_str(r#"{"message":"ok","explorationId":"abc-1"}"#).unwrap();
        assert_eq!(response.exploration_id, ExplorationId("abc-1".to_string()));

        let upload = ObjectDetectionUpload {
            exploration_id: ExplorationId("abc-1".to_string()),
            image_blob: "QQ==".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&upload).unwrap(),
            serde_json::json!({"exploration_id": "abc-1", "image_blob": "QQ=="})
        );
    }
}
