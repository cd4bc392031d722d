pub mod types;
pub mod events;
pub mod scheduler;
pub mod gate;
pub mod service;
pub mod client;
pub mod trigger;
pub mod labeling;
pub mod batch;
pub mod export;
pub mod training;

pub use types::*;
pub use events::{EventBus, EventRecord, EventSender, WorkflowEvent};
pub use scheduler::{Debouncer, PeriodicTask};
pub use gate::{GateOutcome, GatedOperation, RequestGate, SequenceGate};
pub use service::{InferenceService, MockInferenceService, NOTE_SEARCH_LIMIT};
pub use client::HttpInferenceService;
pub use trigger::{InferenceTrigger, LiveInferenceView, ViewPhase};
pub use labeling::{InputFocus, KeyInput, OptimisticQueueController, QueueEntry, SubmitHandle, SubmitOutcome, SyncState};
pub use batch::{split_batch_input, BatchCorrelator, BatchJob, BatchOutcome, CompletedBatch, CorrelatedRow};
pub use export::{export_csv, export_file_name};
pub use training::TrainingMonitor;
