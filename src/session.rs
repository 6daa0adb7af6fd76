//! Session wiring and lifecycle.
//!
//! Builds the component graph for one session (repositories, Fabric service,
//! broker, command processor, supervisor, persistence) and owns the ordered
//! shutdown: flush the broker, drain the processor, stop every process, then
//! finalize metadata.

use crate::config::Config;
use crate::error::{PersistError, Result};
use crate::fabric::broker::{BrokerConfig, EventBroker, NotificationBatch, Notifier};
use crate::fabric::repo::{
    AckRepo, DependencyRepo, ParticipantRepo, ReactionRepo, SubscriptionRepo, ThreadRepo,
};
use crate::fabric::service::{chain_sinks, FabricService};
use crate::logging::{LogCategory, LogSink};
use crate::mcp::fabric_tools::FabricTools;
use crate::mcp::{CoordinatorToolset, WorkerToolset};
use crate::persist::event_log::EventLogger;
use crate::persist::sessions::{SessionMetadata, SessionStatus, SessionStore};
use crate::persist::{load_persisted_events, restore_fabric_state};
use crate::processor::command::{
    Command, CommandQueue, InMemoryTaskTracker, TaskTracker,
};
use crate::processor::enforcement::TurnTracker;
use crate::processor::machine::ProcessRole;
use crate::processor::{
    submit_and_wait, CommandProcessor, ProcessView, WorkflowOutcome,
};
use crate::supervisor::accountability::AccountabilityWriter;
use crate::supervisor::readiness::ReadinessTracker;
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::{worker_id, AgentId, OrchestratorEvent, COORDINATOR_ID};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

pub struct SessionRuntime {
    pub metadata: SessionMetadata,
    pub fabric: Arc<FabricService>,
    pub queue: CommandQueue,
    pub view: ProcessView,
    pub events: broadcast::Sender<OrchestratorEvent>,
    pub log: LogSink,
    store: SessionStore,
    broker: EventBroker,
    processor: CommandProcessor,
    supervisor: Arc<Supervisor>,
    logger: Arc<EventLogger>,
    turns: Arc<TurnTracker>,
    tracker: Arc<dyn TaskTracker>,
    cancel: CancellationToken,
    terminal: watch::Receiver<Option<WorkflowOutcome>>,
    session_dir: std::path::PathBuf,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl SessionRuntime {
    /// Start a fresh session, spawning the coordinator and the configured
    /// number of workers.
    pub async fn start(config: &Config) -> Result<SessionRuntime> {
        let store = SessionStore::new(&config.base_dir, &config.app_name);
        let metadata = store.create_session(config.initial_workers, None)?;
        Self::build(config, store, metadata, false).await
    }

    /// Resume a persisted session by replaying its event log.
    pub async fn resume(config: &Config, session_id: &str) -> Result<SessionRuntime> {
        let store = SessionStore::new(&config.base_dir, &config.app_name);
        let mut metadata = store.load_metadata(session_id)?;
        if !metadata.resumable || !metadata.status.is_terminal() {
            return Err(PersistError::SessionNotFound {
                id: format!("{session_id} (not resumable)"),
            }
            .into());
        }
        metadata.status = SessionStatus::Running;
        metadata.ended_at = None;
        store.finalize(&metadata)?;
        Self::build(config, store, metadata, true).await
    }

    async fn build(
        config: &Config,
        store: SessionStore,
        metadata: SessionMetadata,
        replay: bool,
    ) -> Result<SessionRuntime> {
        let session_dir = store.session_dir(&metadata.id);
        let log = LogSink::buffered(config.log_buffer_capacity);
        let cancel = CancellationToken::new();

        // Repositories, optionally rebuilt from the event log.
        let threads = Arc::new(ThreadRepo::new());
        let deps = Arc::new(DependencyRepo::new());
        let subs = Arc::new(SubscriptionRepo::new());
        let acks = Arc::new(AckRepo::new());
        let participants = Arc::new(ParticipantRepo::new());
        let reactions = Arc::new(ReactionRepo::new());
        if replay {
            let events = load_persisted_events(&session_dir)?;
            let restored =
                restore_fabric_state(&events, &threads, &deps, &subs, &acks, &reactions)?;
            log.info(
                LogCategory::Session,
                "state replayed",
                &[
                    "events",
                    &events.len().to_string(),
                    "channels",
                    &restored.len().to_string(),
                ],
            );
        }

        let fabric = Arc::new(FabricService::new(
            threads,
            deps,
            Arc::clone(&subs),
            acks,
            participants,
            reactions,
            log.clone(),
        ));

        let (events_tx, _) = broadcast::channel(256);
        let (command_tx, command_rx) = mpsc::channel(config.command_queue_capacity);
        let queue = CommandQueue::new(command_tx);

        // Broker: events in, debounced DeliverNotification commands out.
        let notifier_queue = queue.clone();
        let notifier: Notifier = Arc::new(move |recipient: AgentId, batch: NotificationBatch| {
            notifier_queue.submit_nowait(Command::DeliverNotification {
                process_id: recipient,
                batch,
            });
        });
        let broker = EventBroker::spawn(
            BrokerConfig {
                debounce: config.debounce,
                queue_capacity: config.event_queue_capacity,
            },
            subs,
            fabric.slug_lookup(),
            Some(fabric.participant_lister()),
            notifier,
            log.clone(),
        );

        // Persistence logger and broker observe events through one chained sink.
        let logger = EventLogger::open(&session_dir, log.clone())?;
        fabric.set_event_sink(chain_sinks(vec![logger.sink(), broker.sink()]));

        let supervisor = Arc::new(Supervisor::new(
            SupervisorConfig {
                session_dir: session_dir.clone(),
                runtime: config.runtime.clone(),
                grace_period: config.grace_period,
                port_start: config.port_start,
                port_end: config.port_end,
            },
            ReadinessTracker::new(metadata.worker_count),
            queue.clone(),
            events_tx.clone(),
            cancel.clone(),
            log.clone(),
        ));

        let turns = Arc::new(TurnTracker::new());
        let tracker: Arc<dyn TaskTracker> = Arc::new(InMemoryTaskTracker::new());
        let (processor, view, terminal) = CommandProcessor::spawn(
            command_rx,
            Arc::clone(&supervisor),
            Arc::clone(&tracker),
            Arc::clone(&turns),
            events_tx.clone(),
            cancel.clone(),
            log.clone(),
        );

        fabric.init_session(COORDINATOR_ID)?;

        Ok(SessionRuntime {
            metadata,
            fabric,
            queue,
            view,
            events: events_tx,
            log,
            store,
            broker,
            processor,
            supervisor,
            logger,
            turns,
            tracker,
            cancel,
            terminal,
            session_dir,
        })
    }

    /// Spawn the coordinator and workers, then hand the coordinator its goal
    /// once every worker has signalled ready.
    pub async fn launch(&self, goal: &str) -> Result<()> {
        for n in 1..=self.metadata.worker_count {
            submit_and_wait(
                &self.queue,
                Command::SpawnProcess {
                    process_id: worker_id(n),
                    role: ProcessRole::Worker,
                },
                self.cancel.clone(),
            )
            .await?;
        }
        submit_and_wait(
            &self.queue,
            Command::SpawnProcess {
                process_id: COORDINATOR_ID.to_string(),
                role: ProcessRole::Coordinator,
            },
            self.cancel.clone(),
        )
        .await?;

        // The boot prompt waits for the worker-readiness gate; the coordinator
        // hands off and ends its turns from then on.
        let readiness = self.supervisor.readiness().clone();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        let goal = goal.to_string();
        let log = self.log.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = readiness.wait_complete() => {}
            }
            log.info(LogCategory::Session, "all workers ready", &[]);
            queue.submit_nowait(Command::SendToProcess {
                process_id: COORDINATOR_ID.to_string(),
                text: format!(
                    "All workers are ready. Your goal:\n\n{goal}\n\n\
                     Break the goal into tracker tasks, assign them with \
                     assign_task, and route every implementation through review \
                     before approving commits. Post progress to #tasks."
                ),
            });
        });
        Ok(())
    }

    /// Toolset for one worker's `/worker/<id>` namespace.
    pub fn worker_toolset(&self, id: &str) -> WorkerToolset {
        WorkerToolset::new(
            id.to_string(),
            FabricTools {
                agent_id: id.to_string(),
                fabric: Arc::clone(&self.fabric),
                turns: Arc::clone(&self.turns),
            },
            self.queue.clone(),
            Arc::clone(&self.turns),
            AccountabilityWriter::new(&self.session_dir),
            self.cancel.clone(),
        )
    }

    /// Toolset for the coordinator's `/mcp` namespace.
    pub fn coordinator_toolset(&self) -> CoordinatorToolset {
        CoordinatorToolset::new(
            FabricTools {
                agent_id: COORDINATOR_ID.to_string(),
                fabric: Arc::clone(&self.fabric),
                turns: Arc::clone(&self.turns),
            },
            self.queue.clone(),
            Arc::clone(&self.turns),
            Arc::clone(&self.view),
            Arc::clone(&self.tracker),
            AccountabilityWriter::new(&self.session_dir),
            self.cancel.clone(),
        )
    }

    /// Resolve when the coordinator signals workflow completion.
    pub async fn wait_complete(&self) -> Option<WorkflowOutcome> {
        let mut terminal = self.terminal.clone();
        loop {
            if let Some(outcome) = terminal.borrow_and_update().clone() {
                return Some(outcome);
            }
            if terminal.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Ordered shutdown. Broker first (flush pending notifications), then the
    /// processor drains, then processes stop, then persistence closes.
    pub async fn shutdown(self, status: SessionStatus) -> Result<()> {
        self.log.info(
            LogCategory::Session,
            "shutting down",
            &["status", status.as_str()],
        );

        self.broker.shutdown().await;
        self.supervisor.shutdown_all().await;
        // Give exit watchers a beat to report before the drain.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        self.cancel.cancel();
        self.processor.join().await;

        let mut metadata = self.metadata;
        metadata.status = status;
        metadata.ended_at = Some(chrono::Utc::now());
        metadata.resumable = status.is_terminal();
        {
            let view = self.view.read();
            metadata.coordinator_session_ref = view
                .get(COORDINATOR_ID)
                .and_then(|record| record.session_ref.clone());
            metadata.tokens_used = view.values().map(|record| record.tokens_used).sum();
            metadata.cost_usd = view.values().map(|record| record.cost_usd).sum();
        }
        if self.logger.error_count() > 0 {
            tracing::warn!(
                errors = self.logger.error_count(),
                last = self.logger.last_error().unwrap_or_default(),
                "event log saw write failures"
            );
        }
        self.store.finalize(&metadata)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::fabric::service::SendMessageInput;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            base_dir: dir.to_path_buf(),
            runtime: RuntimeConfig {
                command: "cat".into(),
                args: Vec::new(),
            },
            grace_period: Duration::from_millis(50),
            debounce: Duration::from_millis(20),
            initial_workers: 1,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn fresh_session_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());

        let session_id = {
            let runtime = SessionRuntime::start(&config).await.expect("start");
            runtime
                .fabric
                .send_message(SendMessageInput {
                    channel_slug: "tasks".into(),
                    content: "kickoff".into(),
                    created_by: "USER".into(),
                    mentions: Vec::new(),
                })
                .expect("message");
            let id = runtime.metadata.id.clone();
            runtime
                .shutdown(SessionStatus::Completed)
                .await
                .expect("shutdown");
            id
        };

        // The completed session is resumable and replays its state.
        let runtime = SessionRuntime::resume(&config, &session_id)
            .await
            .expect("resume");
        let history = runtime.fabric.history("tasks", None, None).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "kickoff");
        runtime
            .shutdown(SessionStatus::Completed)
            .await
            .expect("second shutdown");
    }

    #[tokio::test]
    async fn running_session_cannot_be_resumed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let runtime = SessionRuntime::start(&config).await.expect("start");
        let id = runtime.metadata.id.clone();

        let error = SessionRuntime::resume(&config, &id)
            .await
            .expect_err("running session is not resumable");
        assert!(error.to_string().contains("not resumable"));

        runtime
            .shutdown(SessionStatus::Interrupted)
            .await
            .expect("shutdown");
    }

    #[tokio::test]
    async fn worker_tools_drive_the_state_machine_end_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let runtime = SessionRuntime::start(&config).await.expect("start");
        let coordinator = runtime.coordinator_toolset();

        // Two workers via the coordinator tool surface.
        for _ in 0..2 {
            let result = coordinator
                .dispatch("spawn_worker", serde_json::json!({}))
                .await
                .expect("spawn dispatch");
            assert!(!result.is_error, "{}", result.message());
        }

        // Both workers come up and signal ready.
        let w1 = runtime.worker_toolset("WORKER.1");
        let w2 = runtime.worker_toolset("WORKER.2");
        for worker in [&w1, &w2] {
            let result = worker
                .dispatch("signal_ready", serde_json::json!({}))
                .await
                .expect("signal dispatch");
            assert!(!result.is_error, "{}", result.message());
        }

        let result = coordinator
            .dispatch(
                "assign_task",
                serde_json::json!({
                    "worker_id": "WORKER.1",
                    "task_id": "bd-42",
                    "description": "implement X"
                }),
            )
            .await
            .expect("assign dispatch");
        assert!(!result.is_error, "{}", result.message());

        let result = w1
            .dispatch(
                "report_implementation_complete",
                serde_json::json!({"summary": "done X"}),
            )
            .await
            .expect("report dispatch");
        assert!(!result.is_error, "{}", result.message());

        coordinator
            .dispatch(
                "assign_task_review",
                serde_json::json!({
                    "reviewer_id": "WORKER.2",
                    "task_id": "bd-42",
                    "implementer_id": "WORKER.1",
                    "summary": "done X"
                }),
            )
            .await
            .expect("review dispatch");

        let result = w2
            .dispatch(
                "report_review_verdict",
                serde_json::json!({"verdict": "APPROVED", "comments": "lgtm"}),
            )
            .await
            .expect("verdict dispatch");
        assert!(!result.is_error, "{}", result.message());

        coordinator
            .dispatch("mark_task_complete", serde_json::json!({"task_id": "bd-42"}))
            .await
            .expect("complete dispatch");

        // End state: both workers idle and ready, task closed.
        {
            let view = runtime.view.read();
            let w1_record = view.get("WORKER.1").expect("WORKER.1");
            assert_eq!(w1_record.phase.as_str(), "idle");
            assert_eq!(w1_record.status.as_str(), "ready");
            let w2_record = view.get("WORKER.2").expect("WORKER.2");
            assert_eq!(w2_record.phase.as_str(), "idle");
        }
        let status = coordinator
            .dispatch("get_task_status", serde_json::json!({"task_id": "bd-42"}))
            .await
            .expect("status dispatch");
        assert!(status.message().contains("closed"));

        runtime
            .shutdown(SessionStatus::Completed)
            .await
            .expect("shutdown");
    }

    #[tokio::test]
    async fn denied_verdict_puts_implementer_into_feedback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let runtime = SessionRuntime::start(&config).await.expect("start");
        let coordinator = runtime.coordinator_toolset();

        for _ in 0..2 {
            coordinator
                .dispatch("spawn_worker", serde_json::json!({}))
                .await
                .expect("spawn");
        }
        let w1 = runtime.worker_toolset("WORKER.1");
        let w2 = runtime.worker_toolset("WORKER.2");
        w1.dispatch("signal_ready", serde_json::json!({}))
            .await
            .expect("ready");
        w2.dispatch("signal_ready", serde_json::json!({}))
            .await
            .expect("ready");

        coordinator
            .dispatch(
                "assign_task",
                serde_json::json!({
                    "worker_id": "WORKER.1",
                    "task_id": "bd-42",
                    "description": "implement X"
                }),
            )
            .await
            .expect("assign");
        w1.dispatch(
            "report_implementation_complete",
            serde_json::json!({"summary": "done X"}),
        )
        .await
        .expect("report");
        coordinator
            .dispatch(
                "assign_task_review",
                serde_json::json!({
                    "reviewer_id": "WORKER.2",
                    "task_id": "bd-42",
                    "implementer_id": "WORKER.1"
                }),
            )
            .await
            .expect("review");
        let verdict = w2
            .dispatch(
                "report_review_verdict",
                serde_json::json!({"verdict": "DENIED", "comments": "missing tests"}),
            )
            .await
            .expect("verdict");
        assert!(!verdict.is_error, "{}", verdict.message());

        let view = runtime.view.read();
        assert_eq!(
            view.get("WORKER.1").expect("WORKER.1").phase.as_str(),
            "addressing_feedback"
        );
        drop(view);

        runtime
            .shutdown(SessionStatus::Completed)
            .await
            .expect("shutdown");
    }

    #[tokio::test]
    async fn precondition_failure_is_a_tool_error_not_a_crash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let runtime = SessionRuntime::start(&config).await.expect("start");
        let coordinator = runtime.coordinator_toolset();

        coordinator
            .dispatch("spawn_worker", serde_json::json!({}))
            .await
            .expect("spawn");
        // Worker never signalled ready; assignment must fail cleanly.
        let result = coordinator
            .dispatch(
                "assign_task",
                serde_json::json!({
                    "worker_id": "WORKER.1",
                    "task_id": "bd-42",
                    "description": "implement X"
                }),
            )
            .await
            .expect("dispatch survives");
        assert!(result.is_error);
        assert!(result.message().contains("expected ready"));

        runtime
            .shutdown(SessionStatus::Interrupted)
            .await
            .expect("shutdown");
    }
}
