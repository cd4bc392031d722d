use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use interfaces::baseline::segment_text;
use notes_workflow::{
    export_file_name, split_batch_input, BatchCorrelator, ClientConfig, EventBus, HttpInferenceService,
    InferenceService, InferenceTrigger, InputFocus, KeyInput, LabelableItem, MockInferenceService, Note,
    OptimisticQueueController, SubmitOutcome, TrainingConfig, TrainingMonitor, TrainingStatus, ViewPhase,
    WorkflowConfig, WorkflowEvent, API_URL_ENV, DEFAULT_API_URL, DEFAULT_FAN_OUT,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const SAMPLE_NOTE: &str = "Pt intubated overnight, PEEP 8 FiO2 40%.\n\
MAP 62 on norepi 0.08, vasopressin added.\n\
CT head: no acute hemorrhage.\n\
Neuro: pupils equal and reactive, no focal deficit.\n\
Na 131, K 3.2, replete K.\n\
Plan: wean sedation and SBT in AM.";

#[derive(Parser)]
#[command(name = "notes-workflow", about = "Clinical note curation workflow")]
struct Cli {
    /// Base URL of the notes API
    #[arg(long, env = API_URL_ENV, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Use the built-in baseline instead of the API
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Clean one note and extract structured findings
    Infer {
        /// File with the note text
        #[arg(long)]
        input: PathBuf,
        /// Write the structured findings JSON here
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write the cleaned note here
        #[arg(long)]
        cleaned: Option<PathBuf>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = notes_workflow::DEFAULT_KEEP_THRESHOLD)]
        threshold: f64,
    },
    /// Run every non-blank line of a file through inference and export a CSV
    Batch {
        #[arg(long)]
        input: PathBuf,
        /// Defaults to batch_export_<millis>.csv
        #[arg(long)]
        out: Option<PathBuf>,
        /// One inference call per note instead of a single batch call
        #[arg(long)]
        fan_out: bool,
        /// Calls in flight at once with --fan-out
        #[arg(long, default_value_t = DEFAULT_FAN_OUT)]
        max_in_flight: usize,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = notes_workflow::DEFAULT_KEEP_THRESHOLD)]
        threshold: f64,
    },
    /// Label sentences from stdin: k/r decide, u/d move, q quits
    Label,
    /// Start a training run and follow its progress
    Train {
        #[arg(long, default_value = "en_core_web_sm")]
        base_model: String,
        #[arg(long, default_value_t = 200)]
        max_steps: u32,
        #[arg(long, default_value_t = 0.001)]
        lr: f64,
        #[arg(long, default_value_t = 0.2)]
        dropout: f64,
        #[arg(long, default_value_t = 32)]
        batch_size: u32,
        /// Give up if the run is still going after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
    },
    /// List trained models
    Models,
    /// List stored notes, or only those containing --query
    History {
        #[arg(long)]
        query: Option<String>,
    },
    /// Show collection and labeling counts
    Stats,
}

fn offline_service() -> MockInferenceService {
    let items = segment_text(SAMPLE_NOTE)
        .into_iter()
        .map(|segment| LabelableItem {
            id: format!("sample-{}", segment.idx),
            text: segment.text,
            last_label: None,
            ordinal_position: segment.idx,
        })
        .collect();
    let sample = Note {
        id: "sample".to_string(),
        text: SAMPLE_NOTE.to_string(),
        date: Utc::now().to_rfc3339(),
    };
    MockInferenceService::new("offline-baseline")
        .with_delay(50)
        .with_items(items)
        .with_notes(vec![sample])
}

fn build_service(cli: &Cli) -> anyhow::Result<Arc<dyn InferenceService>> {
    if cli.offline {
        info!("Running offline against the baseline engine");
        return Ok(Arc::new(offline_service()));
    }
    let config = ClientConfig {
        base_url: cli.api_url.clone(),
        ..ClientConfig::from_env()
    };
    info!("Using notes API at {}", config.base_url);
    Ok(Arc::new(HttpInferenceService::new(config)?))
}

async fn report_events(bus: &EventBus) {
    while let Some(record) = bus.next_event().await {
        match record.event {
            WorkflowEvent::LabelSubmitFailed { item_id, label, reason, .. } => {
                error!("Saving {} for {} failed: {}", label, item_id, reason)
            }
            WorkflowEvent::LiveInferenceFailed { reason, .. } => error!("Inference failed: {}", reason),
            WorkflowEvent::BatchFailed { reason, .. } => error!("Batch failed: {}", reason),
            other => tracing::debug!("{:?}", other),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let service = build_service(&cli)?;
    let bus = EventBus::new();
    let config = WorkflowConfig::default();

    match cli.command {
        Command::Infer {
            input,
            out,
            cleaned,
            model,
            threshold,
        } => {
            let text = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let trigger = InferenceTrigger::new(service, &config, bus.sender());
            trigger.set_threshold(threshold).await?;
            trigger.set_model(model).await;
            trigger.edit(text).await;
            trigger.run_now().await;

            let view = trigger.view().await;
            report_events(&bus).await;
            let result = match (view.phase(), view.result) {
                (ViewPhase::Ready, Some(result)) => result,
                _ => bail!(
                    "inference did not complete: {}",
                    view.last_failure.unwrap_or_else(|| "empty note".to_string())
                ),
            };
            for warning in &result.warnings {
                warn!("{}", warning);
            }

            let findings = serde_json::to_string_pretty(&result.structured_fields)?;
            match out {
                Some(path) => tokio::fs::write(&path, &findings).await?,
                None => println!("{}", findings),
            }
            match cleaned {
                Some(path) => tokio::fs::write(&path, &result.cleaned_text).await?,
                None => println!("{}", result.cleaned_text),
            }
            info!(
                "Kept {} of {} sentences after {} request(s)",
                result.meta.kept_sentence_count,
                result.meta.total_sentence_count,
                trigger.requests_issued()
            );
        }
        Command::Batch {
            input,
            out,
            fan_out,
            max_in_flight,
            model,
            threshold,
        } => {
            let text = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let config = if fan_out { config.with_fan_out(max_in_flight) } else { config };
            let correlator = BatchCorrelator::new(service, &config, bus.sender())
                .with_model(model)
                .with_threshold(threshold)?;

            let completed = correlator.run(split_batch_input(&text)).await;
            report_events(&bus).await;
            let completed = completed?;

            let path = out.unwrap_or_else(|| PathBuf::from(export_file_name(Utc::now())));
            tokio::fs::write(&path, completed.to_csv()?).await?;
            info!(
                "Exported {} rows ({} failed) to {}",
                completed.rows.len(),
                completed.failed_count(),
                path.display()
            );
        }
        Command::Label => {
            let session = OptimisticQueueController::load(service, bus.sender()).await?;
            if session.is_empty().await {
                info!("Nothing to label");
                return Ok(());
            }

            let mut pending = Vec::new();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                if let Some(entry) = session.active_entry().await {
                    let label = entry.item.last_label.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string());
                    println!(
                        "[{}%] #{} ({}) {}",
                        session.progress_percent().await,
                        entry.item.ordinal_position,
                        label,
                        entry.item.text
                    );
                }
                let Some(line) = lines.next_line().await? else { break };
                let key = match line.trim() {
                    "q" => break,
                    "u" => KeyInput::ArrowUp,
                    "d" => KeyInput::ArrowDown,
                    other => other.chars().next().map(KeyInput::Char).unwrap_or(KeyInput::Other),
                };
                if let Some(handle) = session.handle_key(key, InputFocus::Document).await? {
                    pending.push(handle);
                }
                report_events(&bus).await;
            }

            let mut failed = 0;
            for handle in pending {
                if let SubmitOutcome::RolledBack { .. } = handle.outcome().await {
                    failed += 1;
                }
            }
            report_events(&bus).await;
            info!(
                "Session finished at {}% ({} of {} labeled) with {} unsaved decision(s)",
                session.progress_percent().await,
                session.labeled_count().await,
                session.len().await,
                failed
            );
        }
        Command::Train {
            base_model,
            max_steps,
            lr,
            dropout,
            batch_size,
            timeout_secs,
        } => {
            let monitor = TrainingMonitor::new(service, &config, bus.sender());
            let training = TrainingConfig {
                base_model,
                max_steps,
                lr,
                dropout,
                batch_size,
            };
            if !monitor.start_training(&training).await? {
                bail!("the service did not start a training run");
            }

            let finished = monitor.wait_until_finished(Duration::from_secs(timeout_secs)).await;
            monitor.stop_polling();
            report_events(&bus).await;
            let finished = finished?;
            if finished.status != TrainingStatus::Done {
                bail!("training ended as {:?} at {}%", finished.status, finished.progress);
            }
            if let Some(model) = monitor.refresh_models().await?.into_iter().find(|m| m.is_active) {
                info!("Active model is now {} ({})", model.id, model.version);
            }
        }
        Command::Models => {
            let monitor = TrainingMonitor::new(service, &config, bus.sender());
            for model in monitor.refresh_models().await? {
                println!(
                    "{}\t{}\t{}\t{}{}",
                    model.id,
                    model.version,
                    model.base_model,
                    model.created_at,
                    if model.is_active { "\tactive" } else { "" }
                );
            }
        }
        Command::History { query } => {
            let notes = match query.as_deref().map(str::trim) {
                Some(query) if !query.is_empty() => service.search_notes(query).await?,
                _ => service.list_notes().await?,
            };
            for note in &notes {
                let preview: String = note.text.chars().take(80).collect();
                println!("{}\t{}\t{}", note.id, note.date, preview.replace('\n', " "));
            }
            info!("{} note(s) from {}", notes.len(), service.service_name());
        }
        Command::Stats => {
            let stats = service.dashboard_stats().await?;
            println!("notes\t{}", stats.notes);
            println!("models\t{}", stats.models);
            println!("sentences\t{}", stats.total_sentences);
            println!("labeled\t{}", stats.labeled_sentences);
            println!("spans\t{}", stats.span_annotations);
            for day in &stats.labeling_history {
                println!("{}\t{}", day.day, day.count);
            }
        }
    }

    Ok(())
}
