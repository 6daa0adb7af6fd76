//! Command-driven workflow engine.
//!
//! All state-machine decisions happen on a single consumer task reading a
//! bounded command queue, the serialisation point that keeps per-process
//! transitions race-free without fine-grained locks. Transitions themselves
//! are a pure function in [`machine`]; the loop applies them and executes the
//! resulting side effects through the supervisor.

pub mod command;
pub mod enforcement;
pub mod machine;

use crate::error::{Error, ProcessError, Result};
use crate::logging::{LogCategory, LogSink};
use crate::supervisor::Supervisor;
use crate::{OrchestratorEvent, ProcessId};
use command::{Command, CommandEnvelope, CommandOutcome, CommandQueue, TaskTracker};
use enforcement::TurnTracker;
use machine::{ProcessRecord, ProcessTable, SideEffect};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Terminal outcome of a workflow, set by `SignalWorkflowComplete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOutcome {
    pub status: String,
    pub summary: String,
}

/// Shared read view of the process table. The processor loop is the only
/// writer.
pub type ProcessView = Arc<RwLock<HashMap<ProcessId, ProcessRecord>>>;

pub struct CommandProcessor {
    handle: JoinHandle<()>,
}

impl CommandProcessor {
    /// Spawn the consumer loop. The caller creates the command channel so the
    /// supervisor and broker can hold submitters before the loop exists.
    pub fn spawn(
        rx: mpsc::Receiver<CommandEnvelope>,
        supervisor: Arc<Supervisor>,
        tasks: Arc<dyn TaskTracker>,
        turns: Arc<TurnTracker>,
        events: broadcast::Sender<OrchestratorEvent>,
        cancel: tokio_util::sync::CancellationToken,
        log: LogSink,
    ) -> (Self, ProcessView, watch::Receiver<Option<WorkflowOutcome>>) {
        let view: ProcessView = Arc::new(RwLock::new(HashMap::new()));
        let (terminal_tx, terminal_rx) = watch::channel(None);
        let loop_view = Arc::clone(&view);
        let handle = tokio::spawn(async move {
            ProcessorLoop {
                table: ProcessTable::new(),
                view: loop_view,
                supervisor,
                tasks,
                turns,
                events,
                terminal: terminal_tx,
                log,
            }
            .run(rx, cancel)
            .await;
        });
        (Self { handle }, view, terminal_rx)
    }

    /// Wait for the loop to drain and exit. Close the queue (drop all
    /// senders) first.
    pub async fn join(self) {
        if let Err(error) = self.handle.await {
            tracing::debug!(%error, "processor task ended with error");
        }
    }
}

struct ProcessorLoop {
    table: ProcessTable,
    view: ProcessView,
    supervisor: Arc<Supervisor>,
    tasks: Arc<dyn TaskTracker>,
    turns: Arc<TurnTracker>,
    events: broadcast::Sender<OrchestratorEvent>,
    terminal: watch::Sender<Option<WorkflowOutcome>>,
    log: LogSink,
}

impl ProcessorLoop {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<CommandEnvelope>,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return,
                },
            };
            self.handle(envelope).await;
        }
        // Shutdown: apply everything already queued, then stop.
        while let Ok(envelope) = rx.try_recv() {
            self.handle(envelope).await;
        }
    }

    async fn handle(&mut self, envelope: CommandEnvelope) {
        if envelope.cancel.is_cancelled() {
            envelope.reply(Err(Error::Cancelled));
            return;
        }
        let name = envelope.command.name();
        let result = self.apply(&envelope.command).await;
        if let Err(error) = &result {
            tracing::debug!(command = name, %error, "command rejected");
            self.log.warn(
                LogCategory::Processor,
                "command rejected",
                &["command", name, "error", &error.to_string()],
            );
        }
        envelope.reply(result);
    }

    async fn apply(&mut self, command: &Command) -> Result<CommandOutcome> {
        let transition = machine::transition(&self.table, command)?;

        for record in &transition.updates {
            self.table.upsert(record.clone());
            self.publish(record);
        }

        let mut outcome = CommandOutcome {
            message: transition.message.clone(),
            new_process_id: transition.new_process_id.clone(),
        };

        for effect in transition.effects {
            self.execute(effect, &mut outcome).await?;
        }
        Ok(outcome)
    }

    async fn execute(&mut self, effect: SideEffect, outcome: &mut CommandOutcome) -> Result<()> {
        match effect {
            SideEffect::Spawn { process_id, role } => {
                self.supervisor.spawn_process(&process_id, role).await?;
            }
            SideEffect::SendPrompt { process_id, text } => {
                self.deliver_prompt(&process_id, text).await?;
            }
            SideEffect::Stop { process_id, force } => {
                self.supervisor.stop_process(&process_id, force).await?;
            }
            SideEffect::Retire { process_id } => {
                self.supervisor.retire_process(&process_id).await?;
            }
            SideEffect::SubmitFollowUp(command) => {
                // Follow-ups run inline: they belong to the same serialised
                // turn as the command that produced them.
                let follow_up = Box::pin(self.apply(&command)).await?;
                if !follow_up.message.is_empty() {
                    outcome.message = follow_up.message;
                }
            }
            SideEffect::CloseTask {
                task_id,
                failed,
                reason,
            } => {
                if failed {
                    self.tasks
                        .mark_failed(&task_id, reason.as_deref().unwrap_or(""))
                        .await?;
                } else {
                    self.tasks.mark_complete(&task_id).await?;
                }
            }
            SideEffect::ConfirmReadiness { process_id } => {
                self.supervisor.confirm_ready(&process_id);
            }
            SideEffect::ReleaseResources { process_id } => {
                self.supervisor.forget_process(&process_id);
            }
            SideEffect::EmitTerminal { status, summary } => {
                self.events
                    .send(OrchestratorEvent::WorkflowComplete {
                        status: status.clone(),
                        summary: summary.clone(),
                    })
                    .ok();
                self.terminal
                    .send(Some(WorkflowOutcome { status, summary }))
                    .ok();
            }
            SideEffect::NotifyUser { message } => {
                self.log
                    .info(LogCategory::Processor, "user notified", &["message", &message]);
                self.events
                    .send(OrchestratorEvent::UserNotification { message })
                    .ok();
            }
            SideEffect::FlagFailure { process_id } => {
                self.events
                    .send(OrchestratorEvent::ProcessFailed { process_id })
                    .ok();
            }
        }
        Ok(())
    }

    /// Deliver a prompt, enforcing turn completion: a process whose previous
    /// turn recorded no turn-completing tool is flagged once and nudged.
    async fn deliver_prompt(&mut self, process_id: &ProcessId, text: String) -> Result<()> {
        let verdict = self.turns.start_turn(process_id);
        if verdict.needs_nudge {
            self.log.warn(
                LogCategory::Processor,
                "previous turn did not complete",
                &["process", process_id],
            );
            self.events
                .send(OrchestratorEvent::TurnNotCompleted {
                    process_id: process_id.clone(),
                })
                .ok();
            self.supervisor
                .send_prompt(
                    process_id,
                    "Reminder: your previous turn ended without a turn-completing tool call. \
                     Always finish a turn with signal_ready, report_implementation_complete, \
                     report_review_verdict, fabric_send, fabric_reply, or fabric_ack."
                        .to_string(),
                )
                .await?;
        }
        self.supervisor.send_prompt(process_id, text).await?;

        if let Some(record) = self.table.get_mut(process_id) {
            record.queue_len = self.supervisor.queue_len(process_id);
            let record = record.clone();
            self.publish(&record);
        }
        Ok(())
    }

    fn publish(&self, record: &ProcessRecord) {
        self.view
            .write()
            .insert(record.id.clone(), record.clone());
        self.events
            .send(OrchestratorEvent::ProcessUpdated {
                process_id: record.id.clone(),
                status: record.status.as_str().to_string(),
                phase: record.phase.as_str().to_string(),
                queue_len: record.queue_len,
            })
            .ok();
    }
}

/// Submit a command and wait for its outcome, honouring cancellation.
pub async fn submit_and_wait(
    queue: &CommandQueue,
    command: Command,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<CommandOutcome> {
    let (envelope, rx) = CommandEnvelope::with_reply(command, cancel.clone());
    queue
        .submit(envelope)
        .await
        .map_err(|_| Error::Process(ProcessError::QueueClosed))?;
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = rx => result.map_err(|_| Error::Process(ProcessError::QueueClosed))?,
    }
}
