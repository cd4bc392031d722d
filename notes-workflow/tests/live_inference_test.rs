use async_trait::async_trait;
use notes_workflow::{
    EventBus, GateOutcome, GatedOperation, InferenceService, InferenceTrigger, MockInferenceService, RequestGate,
    Result, ViewPhase, WorkflowConfig, WorkflowError, WorkflowEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, Once};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::info;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .try_init()
            .ok();
    });
}

/// Upper-cases its input after a per-input delay; inputs containing "fail" fail.
#[derive(Default)]
struct RecordingOperation {
    delays_ms: HashMap<String, u64>,
    applied: Mutex<Vec<(u64, std::result::Result<String, String>)>>,
    discarded: Mutex<Vec<u64>>,
}

impl RecordingOperation {
    fn with_delays(delays: &[(&str, u64)]) -> Self {
        Self {
            delays_ms: delays.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl GatedOperation for RecordingOperation {
    type Input = String;
    type Output = String;

    async fn run(&self, _sequence: u64, input: String) -> Result<String> {
        let delay = self.delays_ms.get(&input).copied().unwrap_or(0);
        sleep(Duration::from_millis(delay)).await;
        if input.contains("fail") {
            return Err(WorkflowError::Transport(format!("could not process {}", input)));
        }
        Ok(input.to_uppercase())
    }

    async fn apply(&self, sequence: u64, _input: &String, outcome: Result<String>) {
        self.applied.lock().await.push((sequence, outcome.map_err(|e| e.to_string())));
    }

    async fn discard(&self, sequence: u64, _input: &String) {
        self.discarded.lock().await.push(sequence);
    }
}

fn trigger_with(mock: &Arc<MockInferenceService>, bus: &EventBus) -> InferenceTrigger {
    let service: Arc<dyn InferenceService> = mock.clone();
    InferenceTrigger::new(service, &WorkflowConfig::default(), bus.sender())
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_completion_applies_newest() -> Result<()> {
    init_tracing();

    let operation = Arc::new(RecordingOperation::with_delays(&[
        ("first note text", 500),
        ("second note text", 100),
    ]));
    let gate = RequestGate::new(operation.clone(), 11);

    let (first, second) = tokio::join!(
        gate.fire("first note text".to_string()),
        gate.fire("second note text".to_string())
    );

    assert_eq!(first, GateOutcome::Stale { sequence: 1 });
    assert_eq!(second, GateOutcome::Applied { sequence: 2 });
    assert_eq!(
        *operation.applied.lock().await,
        vec![(2, Ok("SECOND NOTE TEXT".to_string()))]
    );
    assert_eq!(*operation.discarded.lock().await, vec![1]);
    assert_eq!(gate.latest_applied().await, Some(2));

    info!("Stale completion was discarded");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_newest_failure_supersedes_older_success() -> Result<()> {
    init_tracing();

    let operation = Arc::new(RecordingOperation::with_delays(&[
        ("older note text", 500),
        ("newest fail text", 100),
    ]));
    let gate = RequestGate::new(operation.clone(), 11);

    let (older, newest) = tokio::join!(
        gate.fire("older note text".to_string()),
        gate.fire("newest fail text".to_string())
    );

    assert_eq!(older, GateOutcome::Stale { sequence: 1 });
    assert_eq!(newest, GateOutcome::Applied { sequence: 2 });
    let applied = operation.applied.lock().await;
    assert_eq!(applied.len(), 1);
    assert!(applied[0].1.is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_gate_schedule_respects_minimum_length() -> Result<()> {
    init_tracing();

    let operation = Arc::new(RecordingOperation::default());
    let gate = RequestGate::new(operation.clone(), 11);

    assert!(!gate.schedule("ten chars!".to_string(), Duration::from_millis(800)));
    assert!(!gate.schedule("            ".to_string(), Duration::from_millis(800)));
    assert!(gate.schedule("eleven char".to_string(), Duration::from_millis(800)));
    assert!(gate.has_pending());

    sleep(Duration::from_secs(1)).await;
    assert_eq!(*operation.applied.lock().await, vec![(1, Ok("ELEVEN CHAR".to_string()))]);
    assert_eq!(gate.fire("   ".to_string()).await, GateOutcome::Skipped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_only_last_edit_in_window_issues_call() -> Result<()> {
    init_tracing();

    let mock = Arc::new(MockInferenceService::new("live"));
    let bus = EventBus::new();
    let trigger = trigger_with(&mock, &bus);

    assert!(trigger.edit("Patient is awake").await);
    sleep(Duration::from_millis(300)).await;
    assert!(trigger.edit("Patient is awake and alert").await);
    sleep(Duration::from_millis(300)).await;
    assert!(trigger.edit("Patient is awake and alert. MAP 70 on norepi.").await);
    assert!(trigger.has_pending());

    sleep(Duration::from_secs(2)).await;

    assert_eq!(
        mock.inference_requests(),
        vec!["Patient is awake and alert. MAP 70 on norepi.".to_string()]
    );
    assert_eq!(trigger.requests_issued(), 1);
    let view = trigger.view().await;
    assert_eq!(view.phase(), ViewPhase::Ready);
    assert_eq!(view.applied_sequence, Some(1));
    assert_eq!(
        view.source_text.as_deref(),
        Some("Patient is awake and alert. MAP 70 on norepi.")
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_short_or_empty_text_never_schedules() -> Result<()> {
    init_tracing();

    let mock = Arc::new(MockInferenceService::new("live"));
    let bus = EventBus::new();
    let trigger = trigger_with(&mock, &bus);

    assert!(trigger.edit("Patient is stable overnight.").await);
    sleep(Duration::from_millis(100)).await;
    // Shrinking below the minimum drops the pending call too.
    assert!(!trigger.edit("Pt ok").await);
    assert!(!trigger.edit("").await);
    sleep(Duration::from_secs(2)).await;
    assert!(mock.inference_requests().is_empty());
    assert_eq!(trigger.view().await.phase(), ViewPhase::Awaiting);

    // A manual run is allowed on short text, but never on blank text.
    trigger.edit("Pt ok").await;
    assert_eq!(trigger.run_now().await, GateOutcome::Applied { sequence: 1 });
    trigger.edit("   ").await;
    assert_eq!(trigger.run_now().await, GateOutcome::Skipped);
    assert_eq!(mock.inference_requests(), vec!["Pt ok".to_string()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_manual_run_beats_slow_debounced_call() -> Result<()> {
    init_tracing();

    let slow = "CT head: no acute hemorrhage.";
    let fast = "CT head: no acute hemorrhage. Pupils equal and reactive.";
    let mock = Arc::new(
        MockInferenceService::new("live")
            .with_delay_for(slow, 1000)
            .with_delay_for(fast, 10),
    );
    let bus = EventBus::new();
    let trigger = trigger_with(&mock, &bus);

    trigger.edit(slow).await;
    sleep(Duration::from_millis(900)).await;
    assert_eq!(trigger.view().await.phase(), ViewPhase::Pending);

    trigger.edit(fast).await;
    assert_eq!(trigger.run_now().await, GateOutcome::Applied { sequence: 2 });
    assert!(!trigger.has_pending());

    sleep(Duration::from_secs(2)).await;
    let view = trigger.view().await;
    assert_eq!(view.applied_sequence, Some(2));
    assert_eq!(view.source_text.as_deref(), Some(fast));
    assert_eq!(view.outstanding, 0);
    assert_eq!(mock.inference_requests(), vec![slow.to_string(), fast.to_string()]);
    assert_eq!(trigger.requests_issued(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refresh_keeps_previous_result_visible() -> Result<()> {
    init_tracing();

    let mock = Arc::new(MockInferenceService::new("live").with_delay(200));
    let bus = EventBus::new();
    let trigger = Arc::new(trigger_with(&mock, &bus));

    trigger.edit("MAP 70 on norepi.").await;
    trigger.run_now().await;
    assert_eq!(trigger.view().await.phase(), ViewPhase::Ready);

    trigger.edit("MAP 70 on norepi. No focal deficit.").await;
    let running = {
        let trigger = trigger.clone();
        tokio::spawn(async move { trigger.run_now().await })
    };
    sleep(Duration::from_millis(50)).await;

    let view = trigger.view().await;
    assert_eq!(view.phase(), ViewPhase::Refreshing);
    assert_eq!(view.source_text.as_deref(), Some("MAP 70 on norepi."));

    assert_eq!(running.await.unwrap(), GateOutcome::Applied { sequence: 2 });
    let view = trigger.view().await;
    assert_eq!(view.phase(), ViewPhase::Ready);
    assert_eq!(
        view.result.map(|result| result.cleaned_text),
        Some("MAP 70 on norepi.\nNo focal deficit.".to_string())
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failure_keeps_last_good_result_and_buffer() -> Result<()> {
    init_tracing();

    let mock = Arc::new(MockInferenceService::new("live"));
    let bus = EventBus::new();
    let trigger = trigger_with(&mock, &bus);

    trigger.edit("Na 131, K 3.2.").await;
    trigger.run_now().await;
    assert_eq!(trigger.view().await.phase(), ViewPhase::Ready);

    mock.set_offline(true);
    trigger.edit("Na 131, K 3.2. Replete K.").await;
    assert_eq!(trigger.run_now().await, GateOutcome::Applied { sequence: 2 });

    let view = trigger.view().await;
    assert_eq!(view.phase(), ViewPhase::Failed);
    assert_eq!(view.source_text.as_deref(), Some("Na 131, K 3.2."));
    assert!(view.last_failure.is_some());
    assert_eq!(trigger.text().await, "Na 131, K 3.2. Replete K.");

    let events = bus.drain().await;
    assert!(events
        .iter()
        .any(|event| matches!(event, WorkflowEvent::LiveInferenceFailed { sequence: 2, .. })));

    mock.set_offline(false);
    trigger.run_now().await;
    let view = trigger.view().await;
    assert_eq!(view.phase(), ViewPhase::Ready);
    assert_eq!(view.source_text.as_deref(), Some("Na 131, K 3.2. Replete K."));
    assert!(view.last_failure.is_none());
    Ok(())
}

#[tokio::test]
async fn test_threshold_outside_unit_interval_is_rejected() -> Result<()> {
    init_tracing();

    let mock = Arc::new(MockInferenceService::new("live"));
    let bus = EventBus::new();
    let trigger = trigger_with(&mock, &bus);

    assert!(trigger.set_threshold(1.5).await.unwrap_err().is_validation());
    assert!(trigger.set_threshold(-0.1).await.unwrap_err().is_validation());
    assert!(!trigger.set_threshold(0.8).await?);
    trigger.cancel_pending();
    Ok(())
}
