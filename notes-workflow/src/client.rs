use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use interfaces::defs::{BatchInferenceRequest, LabelSubmission, TrainingAck};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::service::InferenceService;
use crate::types::{
    BatchInferenceResponse, ClientConfig, DashboardStats, InferenceRequest, InferenceResult, LabelableItem, Model,
    Note, Result, SentenceLabel, TrainingConfig, TrainingProgress, WorkflowError,
};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<Value>,
}

/// Talks to the notes API over HTTP
pub struct HttpInferenceService {
    client: Client,
    base_url: Url,
    config: ClientConfig,
}

impl HttpInferenceService {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(WorkflowError::Validation(format!("{} cannot be used as an API base", config.base_url)));
        }
        // Relative joins keep any path prefix only when the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn label_endpoint(&self, item_id: &str) -> Result<Url> {
        let mut url = self.endpoint("api/sentences")?;
        url.path_segments_mut()
            .map_err(|_| WorkflowError::Validation(format!("{} cannot carry path segments", self.base_url)))?
            .push(item_id)
            .push("label");
        Ok(url)
    }

    fn note_search_endpoint(&self, query: &str) -> Result<Url> {
        let mut url = self.endpoint("api/notes/search")?;
        url.query_pairs_mut().append_pair("q", query);
        Ok(url)
    }

    /// Turn a non-success response into a `Remote` error carrying the server's detail.
    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = match response.json::<ErrorBody>().await.ok().and_then(|body| body.detail) {
            Some(Value::String(detail)) => detail,
            Some(other) => other.to_string(),
            None => status.canonical_reason().unwrap_or("Unknown error").to_string(),
        };
        Err(WorkflowError::Remote {
            status: status.as_u16(),
            detail,
        })
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Retry `attempt` with exponential backoff while the error is retryable.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: delay,
            initial_interval: delay,
            max_interval: delay * 32,
            multiplier: 2.0,
            max_elapsed_time: Some(delay * 60),
            ..Default::default()
        };

        let mut tries = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if tries < self.config.max_retries && e.is_retryable() => match backoff.next_backoff() {
                    Some(wait) => {
                        tries += 1;
                        warn!("Attempt {} of {} failed: {}, retrying in {:?}", tries, what, e, wait);
                        tokio::time::sleep(wait).await;
                    }
                    None => return Err(e),
                },
                Err(e) => {
                    error!("{} failed after {} attempt(s): {}", what, tries + 1, e);
                    return Err(e);
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        self.get_url_json(path, url).await
    }

    async fn get_url_json<T: DeserializeOwned + Send>(&self, what: &str, url: Url) -> Result<T> {
        self.with_retries(what, || {
            let request = self.client.get(url.clone());
            async move {
                let response = Self::check_status(request.send().await?).await?;
                Self::read_json(response).await
            }
        })
        .await
    }
}

#[async_trait]
impl InferenceService for HttpInferenceService {
    fn service_name(&self) -> String {
        format!("http:{}", self.base_url)
    }

    async fn run_inference(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        let url = self.endpoint("api/infer")?;
        debug!("POST {} ({} chars)", url, request.text.chars().count());
        self.with_retries("inference", || {
            let call = self.client.post(url.clone()).json(request);
            async move {
                let response = Self::check_status(call.send().await?).await?;
                Self::read_json(response).await
            }
        })
        .await
    }

    async fn run_batch_inference(
        &self,
        texts: &[String],
        model_id: Option<&str>,
        keep_threshold: f64,
    ) -> Result<BatchInferenceResponse> {
        let url = self.endpoint("api/infer/batch/export")?;
        let body = BatchInferenceRequest {
            texts: texts.to_vec(),
            model_id: model_id.map(str::to_string),
            keep_threshold,
        };
        info!("Submitting batch of {} notes", texts.len());
        self.with_retries("batch inference", || {
            let call = self.client.post(url.clone()).json(&body);
            async move {
                let response = Self::check_status(call.send().await?).await?;
                Self::read_json(response).await
            }
        })
        .await
    }

    // Single attempt: the caller rolls back on failure.
    async fn submit_label(&self, item_id: &str, label: SentenceLabel) -> Result<()> {
        let url = self.label_endpoint(item_id)?;
        debug!("POST {} label={}", url, label);
        let response = self.client.post(url).json(&LabelSubmission { label }).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn list_labelable_items(&self) -> Result<Vec<LabelableItem>> {
        self.get_json("api/sentences").await
    }

    async fn fetch_models(&self) -> Result<Vec<Model>> {
        self.get_json("api/models").await
    }

    async fn start_training(&self, config: &TrainingConfig) -> Result<bool> {
        let url = self.endpoint("api/train")?;
        let response = self.client.post(url).json(config).send().await?;
        let ack: TrainingAck = Self::read_json(Self::check_status(response).await?).await?;
        info!("Training request answered with status {}", ack.status);
        Ok(ack.accepted())
    }

    async fn fetch_training_progress(&self) -> Result<TrainingProgress> {
        self.get_json("api/train/progress").await
    }

    async fn list_notes(&self) -> Result<Vec<Note>> {
        self.get_json("api/notes/all").await
    }

    async fn search_notes(&self, query: &str) -> Result<Vec<Note>> {
        let url = self.note_search_endpoint(query)?;
        debug!("GET {}", url);
        self.get_url_json("note search", url).await
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats> {
        self.get_json("api/dashboard/stats").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_the_base_path() {
        let config = ClientConfig {
            base_url: "http://notes.local:8000/proxy".to_string(),
            ..ClientConfig::default()
        };
        let service = HttpInferenceService::new(config).unwrap();
        assert_eq!(service.endpoint("api/infer").unwrap().as_str(), "http://notes.local:8000/proxy/api/infer");
        assert_eq!(
            service.label_endpoint("s/1 a").unwrap().as_str(),
            "http://notes.local:8000/proxy/api/sentences/s%2F1%20a/label"
        );
        assert_eq!(
            service.note_search_endpoint("fever & chills").unwrap().as_str(),
            "http://notes.local:8000/proxy/api/notes/search?q=fever+%26+chills"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        let bad = ClientConfig {
            base_url: "not a url".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(HttpInferenceService::new(bad), Err(WorkflowError::InvalidUrl(_))));

        let opaque = ClientConfig {
            base_url: "mailto:notes@example.com".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(HttpInferenceService::new(opaque), Err(WorkflowError::Validation(_))));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_failure() {
        let config = ClientConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_seconds: 2,
            max_retries: 0,
            ..ClientConfig::default()
        };
        let service = HttpInferenceService::new(config).unwrap();
        let err = service
            .submit_label("s1", SentenceLabel::Keep)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
