use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_KEEP_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SentenceLabel {
    Keep,
    Remove,
}

impl SentenceLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentenceLabel::Keep => "KEEP",
            SentenceLabel::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for SentenceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub text: String,
    #[serde(rename = "model_version_id")]
    pub model_id: Option<String>,
    pub keep_threshold: f64,
}

impl InferenceRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_id: None,
            keep_threshold: DEFAULT_KEEP_THRESHOLD,
        }
    }

    pub fn with_model(mut self, model_id: Option<String>) -> Self {
        self.model_id = model_id;
        self
    }

    pub fn with_threshold(mut self, keep_threshold: f64) -> Self {
        self.keep_threshold = keep_threshold;
        self
    }
}

impl AsRef<str> for InferenceRequest {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceKeepProbability {
    pub sentence: String,
    #[serde(rename = "prob_keep")]
    pub probability: f64,
}

/// A labelled span of the source text. Offsets count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub label: String,
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    #[serde(rename = "prob")]
    pub probability: f64,
    #[serde(default)]
    pub negated: bool,
    #[serde(default, deserialize_with = "temporal_flag")]
    pub temporal: bool,
}

impl Entity {
    /// True when the span is non-empty and ends inside a source of `source_chars` characters.
    pub fn offsets_within(&self, source_chars: usize) -> bool {
        self.start_char < self.end_char && self.end_char <= source_chars
    }
}

// Older servers send the temporal category ("history", "plan", "current") or null.
fn temporal_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Temporal {
        Flag(bool),
        Category(String),
    }

    Ok(match Option::<Temporal>::deserialize(deserializer)? {
        Some(Temporal::Flag(flag)) => flag,
        Some(Temporal::Category(_)) => true,
        None => false,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    #[serde(rename = "sentence_keep_probs", default)]
    pub sentence_keep_probabilities: Vec<SentenceKeepProbability>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceMeta {
    #[serde(rename = "model_version_id")]
    pub model_id: Option<String>,
    pub keep_threshold: f64,
    pub kept_sentence_count: usize,
    pub total_sentence_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub cleaned_text: String,
    #[serde(rename = "structured_json")]
    pub structured_fields: Map<String, Value>,
    pub confidence: Confidence,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub meta: InferenceMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInferenceRequest {
    pub texts: Vec<String>,
    #[serde(rename = "model_version_id")]
    pub model_id: Option<String>,
    pub keep_threshold: f64,
}

/// One element of a batch response. Servers may report a per-item failure as `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchResultItem {
    Completed(InferenceResult),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInferenceResponse {
    pub count: usize,
    pub results: Vec<BatchResultItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelableItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub last_label: Option<SentenceLabel>,
    #[serde(rename = "idx", alias = "ordinal_position", default)]
    pub ordinal_position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelSubmission {
    pub label: SentenceLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub base_model: String,
    #[serde(default)]
    pub is_active: bool,
    pub max_steps: Option<u32>,
    pub lr: Option<f64>,
    #[serde(default)]
    pub created_at: String,
}

/// A stored clinical note as listed by the history endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub text: String,
    /// Creation timestamp as the server formats it.
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelingDay {
    pub day: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    #[serde(default)]
    pub notes: u64,
    #[serde(default)]
    pub models: u64,
    #[serde(default)]
    pub total_sentences: u64,
    #[serde(default)]
    pub labeled_sentences: u64,
    #[serde(default)]
    pub span_annotations: u64,
    /// Labels recorded per day over the last week, oldest first.
    #[serde(default)]
    pub labeling_history: Vec<LabelingDay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub base_model: String,
    pub max_steps: u32,
    pub lr: f64,
    pub dropout: f64,
    pub batch_size: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            base_model: "en_core_web_sm".to_string(),
            max_steps: 200,
            lr: 0.001,
            dropout: 0.2,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    Idle,
    Running,
    Done,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    pub status: TrainingStatus,
    #[serde(default)]
    pub progress: u8,
}

impl TrainingProgress {
    pub fn idle() -> Self {
        Self {
            status: TrainingStatus::Idle,
            progress: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TrainingStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingAck {
    pub status: String,
}

impl TrainingAck {
    pub fn accepted(&self) -> bool {
        self.status == "started"
    }
}

// Object style note:
// Implementations of InferenceModel are stateless unit types, the same way the
// baseline is written. Anything a model needs is derived from the request.

pub trait InferenceModel {
    fn infer(request: &InferenceRequest) -> Result<InferenceResult>;
}
