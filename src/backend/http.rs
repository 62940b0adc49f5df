use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    BackendError, CreateExplorationRequest, CreateExplorationResponse, ExplorationApi,
    ObjectDetectionUpload,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// reqwest client for the exploration backend.
#[derive(Clone)]
pub struct HttpExplorationApi {
    client: Client,
    base_url: String,
}

impl HttpExplorationApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ExplorationApi for HttpExplorationApi {
    async fn create_exploration(
        &self,
        request: &CreateExplorationRequest,
    ) -> Result<CreateExplorationResponse, BackendError> {
        let url = self.url("explorations");
        debug!("POST {}", url);
        let response = self.client.post(&url).json(request).send().await?;
        let created: CreateExplorationResponse = Self::check(response).await?.json().await?;
        info!(
            "Exploration '{}' created with id {}",
            request.name, created.exploration_id
        );
        Ok(created)
    }

    async fn post_object_detection(
        &self,
        upload: &ObjectDetectionUpload,
    ) -> Result<(), BackendError> {
        let url = self.url("explorations/object-detection");
        debug!(
            "POST {} ({} base64 chars for {})",
            url,
            upload.image_blob.len(),
            upload.exploration_id
        );
        let response = self.client.post(&url).json(upload).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_without_double_slash() {
        let api = HttpExplorationApi::new("http://localhost:8000/api/").unwrap();
        assert_eq!(api.url("explorations"), "http://localhost:8000/api/explorations");
    }
}
