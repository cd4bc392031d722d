use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::events::{EventSender, WorkflowEvent};
use crate::gate::{GateOutcome, GatedOperation, RequestGate};
use crate::service::InferenceService;
use crate::types::{InferenceRequest, InferenceResult, Result, WorkflowConfig, WorkflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    /// Nothing to show and nothing in flight.
    Awaiting,
    /// A call is in flight and there is no earlier result.
    Pending,
    Ready,
    /// A call is in flight; the previous result stays on screen.
    Refreshing,
    /// The newest call failed; any earlier result stays on screen.
    Failed,
}

/// What the live inference panel shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveInferenceView {
    pub result: Option<InferenceResult>,
    /// The note text `result` was computed from.
    pub source_text: Option<String>,
    pub applied_sequence: Option<u64>,
    pub outstanding: usize,
    pub last_failure: Option<String>,
}

impl LiveInferenceView {
    pub fn phase(&self) -> ViewPhase {
        if self.outstanding > 0 {
            return if self.result.is_some() { ViewPhase::Refreshing } else { ViewPhase::Pending };
        }
        if self.last_failure.is_some() {
            return ViewPhase::Failed;
        }
        if self.result.is_some() {
            ViewPhase::Ready
        } else {
            ViewPhase::Awaiting
        }
    }
}

/// Drop entities whose offsets do not fit the source text, noting each drop as a warning.
/// Returns how many were dropped.
pub fn retain_valid_entities(result: &mut InferenceResult, source_text: &str) -> usize {
    let source_chars = source_text.chars().count();
    let before = result.confidence.entities.len();
    let mut dropped = Vec::new();
    result.confidence.entities.retain(|entity| {
        let valid = entity.offsets_within(source_chars);
        if !valid {
            dropped.push(format!(
                "Dropped entity '{}' with invalid offsets {}..{}",
                entity.label, entity.start_char, entity.end_char
            ));
        }
        valid
    });
    result.warnings.extend(dropped);
    before - result.confidence.entities.len()
}

/// The gated operation behind live inference: call the service and merge into the view.
pub struct LiveInference {
    service: Arc<dyn InferenceService>,
    view: RwLock<LiveInferenceView>,
    events: EventSender,
}

impl LiveInference {
    pub fn new(service: Arc<dyn InferenceService>, events: EventSender) -> Self {
        Self {
            service,
            view: RwLock::new(LiveInferenceView::default()),
            events,
        }
    }

    pub async fn view(&self) -> LiveInferenceView {
        self.view.read().await.clone()
    }
}

#[async_trait]
impl GatedOperation for LiveInference {
    type Input = InferenceRequest;
    type Output = InferenceResult;

    async fn run(&self, sequence: u64, input: InferenceRequest) -> Result<InferenceResult> {
        self.view.write().await.outstanding += 1;
        debug!("Live inference #{} issued", sequence);
        self.service.run_inference(&input).await
    }

    async fn apply(&self, sequence: u64, input: &InferenceRequest, outcome: Result<InferenceResult>) {
        let mut view = self.view.write().await;
        view.outstanding = view.outstanding.saturating_sub(1);
        match outcome {
            Ok(mut result) => {
                let dropped = retain_valid_entities(&mut result, &input.text);
                if dropped > 0 {
                    warn!("Live inference #{} carried {} entities with invalid offsets", sequence, dropped);
                }
                info!(
                    "Applied live inference #{} ({}/{} sentences kept)",
                    sequence, result.meta.kept_sentence_count, result.meta.total_sentence_count
                );
                view.result = Some(result);
                view.source_text = Some(input.text.clone());
                view.applied_sequence = Some(sequence);
                view.last_failure = None;
                self.events.emit(WorkflowEvent::LiveInferenceApplied { sequence });
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Live inference #{} failed: {}", sequence, reason);
                view.last_failure = Some(reason.clone());
                self.events.emit(WorkflowEvent::LiveInferenceFailed { sequence, reason });
            }
        }
    }

    async fn discard(&self, _sequence: u64, _input: &InferenceRequest) {
        let mut view = self.view.write().await;
        view.outstanding = view.outstanding.saturating_sub(1);
    }
}

#[derive(Debug, Clone)]
struct TriggerInputs {
    text: String,
    keep_threshold: f64,
    model_id: Option<String>,
}

/// Debounced live inference over an editable note.
pub struct InferenceTrigger {
    gate: RequestGate<LiveInference>,
    inputs: RwLock<TriggerInputs>,
    debounce: Duration,
}

impl InferenceTrigger {
    pub fn new(service: Arc<dyn InferenceService>, config: &WorkflowConfig, events: EventSender) -> Self {
        let operation = Arc::new(LiveInference::new(service, events));
        Self {
            gate: RequestGate::new(operation, config.min_trigger_chars),
            inputs: RwLock::new(TriggerInputs {
                text: String::new(),
                keep_threshold: config.default_keep_threshold,
                model_id: None,
            }),
            debounce: config.debounce(),
        }
    }

    /// Replace the note text. Returns whether a call is now scheduled.
    pub async fn edit(&self, text: impl Into<String>) -> bool {
        self.inputs.write().await.text = text.into();
        self.reschedule().await
    }

    pub async fn set_threshold(&self, keep_threshold: f64) -> Result<bool> {
        if !(0.0..=1.0).contains(&keep_threshold) {
            return Err(WorkflowError::Validation(format!(
                "keep threshold {} is outside [0, 1]",
                keep_threshold
            )));
        }
        self.inputs.write().await.keep_threshold = keep_threshold;
        Ok(self.reschedule().await)
    }

    pub async fn set_model(&self, model_id: Option<String>) -> bool {
        self.inputs.write().await.model_id = model_id;
        self.reschedule().await
    }

    /// Skip the debounce and run on the current text. Supersedes any scheduled call.
    pub async fn run_now(&self) -> GateOutcome {
        self.gate.cancel_pending();
        let request = self.current_request().await;
        self.gate.fire(request).await
    }

    pub async fn text(&self) -> String {
        self.inputs.read().await.text.clone()
    }

    pub async fn view(&self) -> LiveInferenceView {
        self.gate.operation().view().await
    }

    /// Calls issued so far, debounced and manual alike.
    pub fn requests_issued(&self) -> u64 {
        self.gate.last_issued()
    }

    pub fn has_pending(&self) -> bool {
        self.gate.has_pending()
    }

    pub fn cancel_pending(&self) -> bool {
        self.gate.cancel_pending()
    }

    async fn current_request(&self) -> InferenceRequest {
        let inputs = self.inputs.read().await.clone();
        InferenceRequest::new(inputs.text)
            .with_model(inputs.model_id)
            .with_threshold(inputs.keep_threshold)
    }

    async fn reschedule(&self) -> bool {
        let request = self.current_request().await;
        self.gate.schedule(request, self.debounce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::defs::{Confidence, Entity, InferenceMeta};
    use serde_json::Map;

    fn entity(start_char: usize, end_char: usize) -> Entity {
        Entity {
            label: "VENT".to_string(),
            text: "PEEP".to_string(),
            start_char,
            end_char,
            probability: 0.7,
            negated: false,
            temporal: false,
        }
    }

    #[test]
    fn drops_entities_outside_the_source() {
        let mut result = InferenceResult {
            cleaned_text: "PEEP 5.".to_string(),
            structured_fields: Map::new(),
            confidence: Confidence {
                sentence_keep_probabilities: Vec::new(),
                entities: vec![entity(0, 4), entity(3, 40), entity(5, 5)],
            },
            warnings: Vec::new(),
            meta: InferenceMeta {
                model_id: None,
                keep_threshold: 0.5,
                kept_sentence_count: 1,
                total_sentence_count: 1,
            },
        };

        assert_eq!(retain_valid_entities(&mut result, "PEEP 5."), 2);
        assert_eq!(result.confidence.entities, vec![entity(0, 4)]);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn phase_keeps_prior_result_while_refreshing() {
        let mut view = LiveInferenceView::default();
        assert_eq!(view.phase(), ViewPhase::Awaiting);
        view.outstanding = 1;
        assert_eq!(view.phase(), ViewPhase::Pending);
        view.last_failure = Some("down".to_string());
        assert_eq!(view.phase(), ViewPhase::Pending);
        view.outstanding = 0;
        assert_eq!(view.phase(), ViewPhase::Failed);
    }
}
