use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::events::{EventSender, WorkflowEvent};
use crate::export;
use crate::service::InferenceService;
use crate::types::{BatchDispatch, BatchResultItem, InferenceRequest, InferenceResult, Result, WorkflowConfig, WorkflowError};

/// One non-blank line per note.
pub fn split_batch_input(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed(InferenceResult),
    Failed { reason: String },
}

impl BatchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, BatchOutcome::Failed { .. })
    }
}

impl From<BatchResultItem> for BatchOutcome {
    fn from(item: BatchResultItem) -> Self {
        match item {
            BatchResultItem::Completed(result) => BatchOutcome::Completed(result),
            BatchResultItem::Failed { error } => BatchOutcome::Failed { reason: error },
        }
    }
}

/// Inputs plus one write-once slot per input, filled in completion order.
#[derive(Debug, Clone)]
pub struct BatchJob {
    id: Uuid,
    inputs: Vec<String>,
    slots: Vec<Option<BatchOutcome>>,
}

impl BatchJob {
    pub fn new(inputs: Vec<String>) -> Result<Self> {
        if inputs.is_empty() {
            return Err(WorkflowError::Validation("a batch needs at least one note".to_string()));
        }
        let slots = vec![None; inputs.len()];
        Ok(Self {
            id: Uuid::new_v4(),
            inputs,
            slots,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn fill(&mut self, index: usize, outcome: BatchOutcome) -> Result<()> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| WorkflowError::Validation(format!("slot {} is outside a batch of {}", index, len)))?;
        if slot.is_some() {
            return Err(WorkflowError::Validation(format!("slot {} was already filled", index)));
        }
        *slot = Some(outcome);
        Ok(())
    }

    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Pair every input with its outcome, in input order.
    pub fn into_rows(self) -> Result<Vec<CorrelatedRow>> {
        if !self.is_complete() {
            return Err(WorkflowError::Validation(format!(
                "batch {} has {} of {} results",
                self.id,
                self.filled(),
                self.len()
            )));
        }
        Ok(self
            .inputs
            .into_iter()
            .zip(self.slots.into_iter().flatten())
            .map(|(input, outcome)| CorrelatedRow { input, outcome })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedRow {
    pub input: String,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedBatch {
    pub job_id: Uuid,
    pub rows: Vec<CorrelatedRow>,
}

impl CompletedBatch {
    pub fn failed_count(&self) -> usize {
        self.rows.iter().filter(|row| row.outcome.is_failed()).count()
    }

    pub fn to_csv(&self) -> Result<String> {
        export::export_csv(&self.rows)
    }
}

/// Sends a list of notes through inference and lines the results back up with their inputs.
pub struct BatchCorrelator {
    service: Arc<dyn InferenceService>,
    dispatch: BatchDispatch,
    model_id: Option<String>,
    keep_threshold: f64,
    events: EventSender,
    last_inputs: RwLock<Vec<String>>,
    last_completed: RwLock<Option<CompletedBatch>>,
}

impl BatchCorrelator {
    pub fn new(service: Arc<dyn InferenceService>, config: &WorkflowConfig, events: EventSender) -> Self {
        Self {
            service,
            dispatch: config.batch_dispatch,
            model_id: None,
            keep_threshold: config.default_keep_threshold,
            events,
            last_inputs: RwLock::new(Vec::new()),
            last_completed: RwLock::new(None),
        }
    }

    pub fn with_model(mut self, model_id: Option<String>) -> Self {
        self.model_id = model_id;
        self
    }

    pub fn with_threshold(mut self, keep_threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&keep_threshold) {
            return Err(WorkflowError::Validation(format!(
                "keep threshold {} is outside [0, 1]",
                keep_threshold
            )));
        }
        self.keep_threshold = keep_threshold;
        Ok(self)
    }

    pub fn dispatch(&self) -> BatchDispatch {
        self.dispatch
    }

    pub async fn run(&self, inputs: Vec<String>) -> Result<CompletedBatch> {
        let mut job = BatchJob::new(inputs)?;
        let job_id = job.id();
        *self.last_inputs.write().await = job.inputs().to_vec();
        *self.last_completed.write().await = None;
        info!("Batch {} started with {} notes ({:?})", job_id, job.len(), self.dispatch);

        let dispatched = match self.dispatch {
            BatchDispatch::Aggregate => self.run_aggregate(&mut job).await,
            BatchDispatch::FanOut { max_in_flight } => self.run_fan_out(&mut job, max_in_flight).await,
        };
        if let Err(e) = dispatched {
            error!("Batch {} failed: {}", job_id, e);
            self.events.emit(WorkflowEvent::BatchFailed {
                job_id,
                reason: e.to_string(),
            });
            return Err(e);
        }

        let completed = CompletedBatch {
            job_id,
            rows: job.into_rows()?,
        };
        let failed = completed.failed_count();
        info!("Batch {} finished: {} rows, {} failed", job_id, completed.rows.len(), failed);
        self.events.emit(WorkflowEvent::BatchCompleted {
            job_id,
            rows: completed.rows.len(),
            failed,
        });
        *self.last_completed.write().await = Some(completed.clone());
        Ok(completed)
    }

    /// Run the most recent inputs again as a new batch.
    pub async fn retry(&self) -> Result<CompletedBatch> {
        let inputs = self.last_inputs.read().await.clone();
        self.run(inputs).await
    }

    pub async fn last_inputs(&self) -> Vec<String> {
        self.last_inputs.read().await.clone()
    }

    pub async fn last_completed(&self) -> Option<CompletedBatch> {
        self.last_completed.read().await.clone()
    }

    async fn run_aggregate(&self, job: &mut BatchJob) -> Result<()> {
        let response = self
            .service
            .run_batch_inference(job.inputs(), self.model_id.as_deref(), self.keep_threshold)
            .await?;

        if response.results.len() != job.len() {
            return Err(WorkflowError::Transport(format!(
                "batch response has {} results for {} notes",
                response.results.len(),
                job.len()
            )));
        }
        if response.count != response.results.len() {
            warn!("Batch response count {} disagrees with {} results", response.count, response.results.len());
        }

        for (index, item) in response.results.into_iter().enumerate() {
            job.fill(index, item.into())?;
        }
        Ok(())
    }

    async fn run_fan_out(&self, job: &mut BatchJob, max_in_flight: usize) -> Result<()> {
        let requests: Vec<(usize, InferenceRequest)> = job
            .inputs()
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let request = InferenceRequest::new(text.clone())
                    .with_model(self.model_id.clone())
                    .with_threshold(self.keep_threshold);
                (index, request)
            })
            .collect();

        let service = &self.service;
        let mut completions = stream::iter(requests)
            .map(|(index, request)| async move { (index, service.run_inference(&request).await) })
            .buffer_unordered(max_in_flight.max(1));

        let mut unreachable = Vec::new();
        while let Some((index, outcome)) = completions.next().await {
            let outcome = match outcome {
                Ok(result) => BatchOutcome::Completed(result),
                Err(e) => {
                    warn!("Note {} of batch {} failed: {}", index, job.id(), e);
                    if e.is_unreachable() {
                        unreachable.push(e.to_string());
                    }
                    BatchOutcome::Failed { reason: e.to_string() }
                }
            };
            job.fill(index, outcome)?;
        }

        // Nothing reached the service, so there is no table to correlate.
        if unreachable.len() == job.len() {
            return Err(WorkflowError::Transport(format!(
                "none of the {} notes reached the service: {}",
                job.len(),
                unreachable.first().map(String::as_str).unwrap_or("no answer")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_non_blank_lines() {
        let inputs = split_batch_input("MAP 70 on norepi.\n\n   \nNo focal deficit.\r\n");
        assert_eq!(inputs, vec!["MAP 70 on norepi.", "No focal deficit."]);
    }

    #[test]
    fn slots_fill_once_in_any_order() {
        let mut job = BatchJob::new(vec!["a".to_string(), "b".to_string()]).unwrap();
        job.fill(1, BatchOutcome::Failed { reason: "x".to_string() }).unwrap();
        assert!(!job.is_complete());
        assert!(job.fill(1, BatchOutcome::Failed { reason: "y".to_string() }).is_err());
        assert!(job.fill(2, BatchOutcome::Failed { reason: "z".to_string() }).is_err());
        job.fill(0, BatchOutcome::Failed { reason: "w".to_string() }).unwrap();

        let rows = job.into_rows().unwrap();
        assert_eq!(rows[0].input, "a");
        assert_eq!(rows[1].outcome, BatchOutcome::Failed { reason: "x".to_string() });
    }

    #[test]
    fn empty_batches_are_rejected() {
        assert!(BatchJob::new(Vec::new()).unwrap_err().is_validation());
    }
}
