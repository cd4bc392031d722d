use std::time::Duration;

// Use the interfaces crate for the collaborator data model
pub use interfaces::defs::{BatchInferenceResponse, BatchResultItem, Entity, InferenceRequest, InferenceResult};
pub use interfaces::defs::{LabelableItem, Model, SentenceLabel, TrainingConfig, TrainingProgress, TrainingStatus};
pub use interfaces::defs::DEFAULT_KEEP_THRESHOLD;
pub use interfaces::defs::{DashboardStats, LabelingDay, Note};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const API_URL_ENV: &str = "NOTES_API_URL";
pub const DEFAULT_FAN_OUT: usize = 8;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            user_agent: "Notes-Workflow/0.1".to_string(),
            timeout_seconds: 30,
            max_retries: 2,
            retry_delay_ms: 250,
        }
    }
}

impl ClientConfig {
    /// Defaults, with the base URL taken from `NOTES_API_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var(API_URL_ENV) {
            if !base_url.trim().is_empty() {
                config.base_url = base_url;
            }
        }
        config
    }
}

/// How a batch is sent to the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDispatch {
    /// One round trip to the batch endpoint; results correlate by position.
    Aggregate,
    /// One inference call per input, at most `max_in_flight` at a time.
    FanOut { max_in_flight: usize },
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub debounce_ms: u64,
    pub min_trigger_chars: usize,
    pub default_keep_threshold: f64,
    pub progress_poll_ms: u64,
    pub batch_dispatch: BatchDispatch,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 800,
            // Live inference only kicks in once the note is longer than ten characters.
            min_trigger_chars: 11,
            default_keep_threshold: DEFAULT_KEEP_THRESHOLD,
            progress_poll_ms: 2000,
            batch_dispatch: BatchDispatch::Aggregate,
        }
    }
}

impl WorkflowConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn progress_poll_period(&self) -> Duration {
        Duration::from_millis(self.progress_poll_ms)
    }

    pub fn with_fan_out(mut self, max_in_flight: usize) -> Self {
        self.batch_dispatch = BatchDispatch::FanOut {
            max_in_flight: max_in_flight.max(1),
        };
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collaborator returned HTTP {status}: {detail}")]
    Remote { status: u16, detail: String },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// The collaborator could not be reached or answered with a non-success outcome.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            WorkflowError::Http(_) | WorkflowError::Remote { .. } | WorkflowError::Transport(_)
        )
    }

    /// No answer came back at all, as opposed to the collaborator rejecting the request.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, WorkflowError::Http(_) | WorkflowError::Transport(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, WorkflowError::Validation(_))
    }

    /// Worth another attempt: connection trouble, timeouts and 5xx answers.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            WorkflowError::Remote { status, .. } => *status >= 500,
            WorkflowError::Transport(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
