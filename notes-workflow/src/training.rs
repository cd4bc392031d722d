use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{EventSender, WorkflowEvent};
use crate::scheduler::PeriodicTask;
use crate::service::InferenceService;
use crate::types::{Model, Result, TrainingConfig, TrainingProgress, TrainingStatus, WorkflowConfig, WorkflowError};

/// Starts training runs and keeps the latest progress and model list for a session.
pub struct TrainingMonitor {
    service: Arc<dyn InferenceService>,
    latest: Arc<RwLock<TrainingProgress>>,
    models: Arc<RwLock<Vec<Model>>>,
    events: EventSender,
    poll_period: Duration,
    poller: Mutex<Option<PeriodicTask>>,
}

impl TrainingMonitor {
    pub fn new(service: Arc<dyn InferenceService>, config: &WorkflowConfig, events: EventSender) -> Self {
        Self {
            service,
            latest: Arc::new(RwLock::new(TrainingProgress::idle())),
            models: Arc::new(RwLock::new(Vec::new())),
            events,
            poll_period: config.progress_poll_period(),
            poller: Mutex::new(None),
        }
    }

    pub async fn refresh_models(&self) -> Result<Vec<Model>> {
        let models = self.service.fetch_models().await?;
        *self.models.write().await = models.clone();
        Ok(models)
    }

    pub async fn models(&self) -> Vec<Model> {
        self.models.read().await.clone()
    }

    pub async fn active_model(&self) -> Option<Model> {
        self.models.read().await.iter().find(|model| model.is_active).cloned()
    }

    pub async fn latest_progress(&self) -> TrainingProgress {
        *self.latest.read().await
    }

    /// Ask the service for a run and make sure progress is being polled.
    /// Returns false when a run is already going or the service declined.
    pub async fn start_training(&self, config: &TrainingConfig) -> Result<bool> {
        if self.latest.read().await.is_running() {
            debug!("Training already running, not starting another");
            return Ok(false);
        }
        let accepted = self.service.start_training(config).await?;
        if accepted {
            info!("Training started on {} ({} steps)", config.base_model, config.max_steps);
            *self.latest.write().await = TrainingProgress {
                status: TrainingStatus::Running,
                progress: 0,
            };
            self.start_polling();
        } else {
            warn!("Training request was not accepted");
        }
        Ok(accepted)
    }

    /// Wait until the run is no longer running, whatever status it ends in.
    /// A run that never leaves `running` fails with `Timeout` once `limit` passes.
    pub async fn wait_until_finished(&self, limit: Duration) -> Result<TrainingProgress> {
        let watch = async {
            let mut ticker = interval(self.poll_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let progress = self.latest_progress().await;
                if !progress.is_running() {
                    return progress;
                }
            }
        };

        match timeout(limit, watch).await {
            Ok(progress) => {
                if progress.status != TrainingStatus::Done {
                    warn!("Training stopped as {:?} at {}%", progress.status, progress.progress);
                }
                Ok(progress)
            }
            Err(_) => Err(WorkflowError::Timeout(format!(
                "training still running after {}s at {}%",
                limit.as_secs(),
                self.latest_progress().await.progress
            ))),
        }
    }

    /// Poll progress every period until stopped or this monitor is dropped.
    pub fn start_polling(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.as_ref().is_some_and(PeriodicTask::is_running) {
            return;
        }

        let service = self.service.clone();
        let latest = self.latest.clone();
        let models = self.models.clone();
        let events = self.events.clone();
        *poller = Some(PeriodicTask::spawn(self.poll_period, move || {
            let service = service.clone();
            let latest = latest.clone();
            let models = models.clone();
            let events = events.clone();
            async move {
                poll_once(service.as_ref(), &latest, &models, &events).await;
                ControlFlow::Continue(())
            }
        }));
    }

    pub fn stop_polling(&self) -> bool {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        match poller.take() {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(PeriodicTask::is_running)
    }
}

async fn poll_once(
    service: &dyn InferenceService,
    latest: &RwLock<TrainingProgress>,
    models: &RwLock<Vec<Model>>,
    events: &EventSender,
) {
    let progress = match service.fetch_training_progress().await {
        Ok(progress) => progress,
        Err(e) => {
            // Polling carries on; the next tick may reach the service again.
            debug!("Training progress poll failed: {}", e);
            return;
        }
    };

    let previous = {
        let mut latest = latest.write().await;
        std::mem::replace(&mut *latest, progress)
    };
    if previous == progress {
        return;
    }

    info!("Training {:?} at {}%", progress.status, progress.progress);
    events.emit(WorkflowEvent::TrainingProgressed(progress));

    if progress.status == TrainingStatus::Done && previous.status != TrainingStatus::Done {
        match service.fetch_models().await {
            Ok(fresh) => *models.write().await = fresh,
            Err(e) => warn!("Could not refresh models after training: {}", e),
        }
    }
}
