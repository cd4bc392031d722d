use async_trait::async_trait;
use chrono::Utc;
use interfaces::{BaselineInferenceModel, InferenceModel};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::types::{
    BatchInferenceResponse, BatchResultItem, DashboardStats, InferenceRequest, InferenceResult, LabelableItem,
    LabelingDay, Model, Note, Result, SentenceLabel, TrainingConfig, TrainingProgress, TrainingStatus, WorkflowError,
};

/// The notes API caps a search at this many matches.
pub const NOTE_SEARCH_LIMIT: usize = 50;

/// The remote model-serving collaborator, seen from the controllers
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Get the name of this service
    fn service_name(&self) -> String;

    /// Run inference on a single note
    async fn run_inference(&self, request: &InferenceRequest) -> Result<InferenceResult>;

    /// Run inference on many notes in one round trip; results are positional
    async fn run_batch_inference(
        &self,
        texts: &[String],
        model_id: Option<&str>,
        keep_threshold: f64,
    ) -> Result<BatchInferenceResponse>;

    /// Record a human decision for one sentence
    async fn submit_label(&self, item_id: &str, label: SentenceLabel) -> Result<()>;

    async fn list_labelable_items(&self) -> Result<Vec<LabelableItem>>;

    async fn fetch_models(&self) -> Result<Vec<Model>>;

    /// Ask for a training run. Returns false if the service declined to start one.
    async fn start_training(&self, config: &TrainingConfig) -> Result<bool>;

    async fn fetch_training_progress(&self) -> Result<TrainingProgress>;

    /// Every stored note, newest first
    async fn list_notes(&self) -> Result<Vec<Note>>;

    /// Notes whose text contains `query`, newest first, at most [`NOTE_SEARCH_LIMIT`]
    async fn search_notes(&self, query: &str) -> Result<Vec<Note>>;

    async fn dashboard_stats(&self) -> Result<DashboardStats>;
}

/// In-process service backed by the rule-based baseline, for offline runs and tests
pub struct MockInferenceService {
    name: String,
    response_delay_ms: u64,
    keyed_delays_ms: HashMap<String, u64>,
    failing_texts: HashSet<String>,
    failing_items: Mutex<HashSet<String>>,
    offline: AtomicBool,
    items: RwLock<Vec<LabelableItem>>,
    notes: Vec<Note>,
    models: RwLock<Vec<Model>>,
    training: RwLock<TrainingProgress>,
    training_config: Mutex<Option<TrainingConfig>>,
    training_step: u8,
    inference_log: Mutex<Vec<String>>,
    batch_log: Mutex<Vec<Vec<String>>>,
    label_log: Mutex<Vec<(String, SentenceLabel)>>,
}

impl MockInferenceService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response_delay_ms: 0,
            keyed_delays_ms: HashMap::new(),
            failing_texts: HashSet::new(),
            failing_items: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
            items: RwLock::new(Vec::new()),
            notes: Vec::new(),
            models: RwLock::new(Vec::new()),
            training: RwLock::new(TrainingProgress::idle()),
            training_config: Mutex::new(None),
            training_step: 25,
            inference_log: Mutex::new(Vec::new()),
            batch_log: Mutex::new(Vec::new()),
            label_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.response_delay_ms = delay_ms;
        self
    }

    /// Override the delay for one note text or one item id.
    pub fn with_delay_for(mut self, key: impl Into<String>, delay_ms: u64) -> Self {
        self.keyed_delays_ms.insert(key.into(), delay_ms);
        self
    }

    /// Inference on this exact text fails; inside a batch it becomes a per-item failure.
    pub fn with_failing_text(mut self, text: impl Into<String>) -> Self {
        self.failing_texts.insert(text.into());
        self
    }

    pub fn with_items(mut self, items: Vec<LabelableItem>) -> Self {
        self.items = RwLock::new(items);
        self
    }

    pub fn with_notes(mut self, mut notes: Vec<Note>) -> Self {
        notes.sort_by(|a, b| b.date.cmp(&a.date));
        self.notes = notes;
        self
    }

    pub fn with_models(mut self, models: Vec<Model>) -> Self {
        self.models = RwLock::new(models);
        self
    }

    /// Progress added on every poll of a running training job.
    pub fn with_training_step(mut self, step: u8) -> Self {
        self.training_step = step.max(1);
        self
    }

    /// Label submissions for this item id fail until cleared.
    pub fn fail_labels_for(&self, item_id: impl Into<String>) {
        lock(&self.failing_items).insert(item_id.into());
    }

    pub fn clear_label_failures(&self) {
        lock(&self.failing_items).clear();
    }

    /// While offline every call fails as unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Overwrite the training state the service reports, e.g. a run the server lost.
    pub async fn set_training_progress(&self, progress: TrainingProgress) {
        *self.training.write().await = progress;
    }

    /// Texts of every single-note inference call received, in arrival order.
    pub fn inference_requests(&self) -> Vec<String> {
        lock(&self.inference_log).clone()
    }

    pub fn batch_requests(&self) -> Vec<Vec<String>> {
        lock(&self.batch_log).clone()
    }

    pub fn submitted_labels(&self) -> Vec<(String, SentenceLabel)> {
        lock(&self.label_log).clone()
    }

    async fn simulate_latency(&self, key: Option<&str>) {
        let delay = key
            .and_then(|key| self.keyed_delays_ms.get(key).copied())
            .unwrap_or(self.response_delay_ms);
        if delay > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
        }
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(WorkflowError::Transport(format!("{} is unreachable", self.name)));
        }
        Ok(())
    }

    fn infer_one(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        if self.failing_texts.contains(&request.text) {
            return Err(WorkflowError::Remote {
                status: 500,
                detail: "Inference failed".to_string(),
            });
        }
        BaselineInferenceModel::infer(request).map_err(|e| WorkflowError::Remote {
            status: 422,
            detail: e.to_string(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl InferenceService for MockInferenceService {
    fn service_name(&self) -> String {
        self.name.clone()
    }

    async fn run_inference(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        lock(&self.inference_log).push(request.text.clone());
        debug!("Mock inference on {} chars", request.text.chars().count());
        self.simulate_latency(Some(&request.text)).await;
        self.ensure_reachable()?;
        self.infer_one(request)
    }

    async fn run_batch_inference(
        &self,
        texts: &[String],
        model_id: Option<&str>,
        keep_threshold: f64,
    ) -> Result<BatchInferenceResponse> {
        lock(&self.batch_log).push(texts.to_vec());
        self.simulate_latency(None).await;
        self.ensure_reachable()?;

        let requests: Vec<InferenceRequest> = texts
            .iter()
            .map(|text| {
                InferenceRequest::new(text.clone())
                    .with_model(model_id.map(str::to_string))
                    .with_threshold(keep_threshold)
            })
            .collect();
        let outcomes = BaselineInferenceModel::infer_batch(&requests).await;

        let results: Vec<BatchResultItem> = requests
            .iter()
            .zip(outcomes)
            .map(|(request, outcome)| {
                if self.failing_texts.contains(&request.text) {
                    return BatchResultItem::Failed {
                        error: "Inference failed".to_string(),
                    };
                }
                match outcome {
                    Ok(result) => BatchResultItem::Completed(result),
                    Err(e) => BatchResultItem::Failed { error: e.to_string() },
                }
            })
            .collect();

        Ok(BatchInferenceResponse {
            count: results.len(),
            results,
        })
    }

    async fn submit_label(&self, item_id: &str, label: SentenceLabel) -> Result<()> {
        self.simulate_latency(Some(item_id)).await;
        self.ensure_reachable()?;
        if lock(&self.failing_items).contains(item_id) {
            return Err(WorkflowError::Remote {
                status: 503,
                detail: format!("Could not store label for {}", item_id),
            });
        }

        let mut items = self.items.write().await;
        let item = items
            .iter_mut()
            .find(|item| item.id == item_id)
            .ok_or_else(|| WorkflowError::Remote {
                status: 404,
                detail: "Sentence not found".to_string(),
            })?;
        item.last_label = Some(label);
        lock(&self.label_log).push((item_id.to_string(), label));
        Ok(())
    }

    async fn list_labelable_items(&self) -> Result<Vec<LabelableItem>> {
        self.simulate_latency(None).await;
        self.ensure_reachable()?;
        Ok(self.items.read().await.clone())
    }

    async fn fetch_models(&self) -> Result<Vec<Model>> {
        self.simulate_latency(None).await;
        self.ensure_reachable()?;
        Ok(self.models.read().await.clone())
    }

    async fn start_training(&self, config: &TrainingConfig) -> Result<bool> {
        self.simulate_latency(None).await;
        self.ensure_reachable()?;
        let mut training = self.training.write().await;
        if training.is_running() {
            return Ok(false);
        }
        debug!("Mock training started on {} for {} steps", config.base_model, config.max_steps);
        *lock(&self.training_config) = Some(config.clone());
        *training = TrainingProgress {
            status: TrainingStatus::Running,
            progress: 0,
        };
        Ok(true)
    }

    /// Each poll of a running job advances it; reaching 100 registers a new active model.
    async fn fetch_training_progress(&self) -> Result<TrainingProgress> {
        self.ensure_reachable()?;
        let mut training = self.training.write().await;
        if training.is_running() {
            let progress = training.progress.saturating_add(self.training_step).min(100);
            training.progress = progress;
            if progress == 100 {
                training.status = TrainingStatus::Done;
                let mut models = self.models.write().await;
                for model in models.iter_mut() {
                    model.is_active = false;
                }
                let config = lock(&self.training_config).take().unwrap_or_default();
                let version = format!("v{}", models.len() + 1);
                models.push(Model {
                    id: Uuid::new_v4().to_string(),
                    version,
                    base_model: config.base_model,
                    is_active: true,
                    max_steps: Some(config.max_steps),
                    lr: Some(config.lr),
                    created_at: Utc::now().to_rfc3339(),
                });
            }
        }
        Ok(*training)
    }

    async fn list_notes(&self) -> Result<Vec<Note>> {
        self.simulate_latency(None).await;
        self.ensure_reachable()?;
        Ok(self.notes.clone())
    }

    async fn search_notes(&self, query: &str) -> Result<Vec<Note>> {
        self.simulate_latency(None).await;
        self.ensure_reachable()?;
        let needle = query.to_lowercase();
        Ok(self
            .notes
            .iter()
            .filter(|note| note.text.to_lowercase().contains(&needle))
            .take(NOTE_SEARCH_LIMIT)
            .cloned()
            .collect())
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats> {
        self.simulate_latency(None).await;
        self.ensure_reachable()?;
        let items = self.items.read().await;
        let submitted = lock(&self.label_log).len() as u64;
        let labeling_history = if submitted > 0 {
            vec![LabelingDay {
                day: Utc::now().format("%Y-%m-%d").to_string(),
                count: submitted,
            }]
        } else {
            Vec::new()
        };

        Ok(DashboardStats {
            notes: self.notes.len() as u64,
            models: self.models.read().await.len() as u64,
            total_sentences: items.len() as u64,
            labeled_sentences: items.iter().filter(|item| item.last_label.is_some()).count() as u64,
            span_annotations: 0,
            labeling_history,
        })
    }
}
