//! Debounced notification routing.
//!
//! The broker consumes Fabric events on its own task, resolves recipient sets
//! per subscription mode and mentions, and batches deliveries per recipient
//! under a debounce window. It is best-effort: enqueue never blocks the
//! Fabric critical section, and overflow drops events (the event log on disk
//! remains authoritative).
//!
//! The broker never references the service directly; it receives a slug
//! lookup and an optional participant lister at construction, and hands
//! finished batches to a notifier callback.

use crate::fabric::event::FabricEvent;
use crate::fabric::repo::SubscriptionRepo;
use crate::fabric::types::{SubscriptionMode, OBSERVER_SLUG};
use crate::logging::{LogCategory, LogSink};
use crate::{AgentId, ThreadId, HERE_MENTION, OBSERVER_ID};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Resolves a channel id to its slug.
pub type SlugLookup = Arc<dyn Fn(&ThreadId) -> Option<String> + Send + Sync>;

/// Lists joined participants for `@here` expansion. When absent, `@here` is
/// inert: agents must opt in by joining before they can be addressed
/// collectively.
pub type ParticipantLister = Arc<dyn Fn() -> Vec<AgentId> + Send + Sync>;

/// Receives one flattened batch per recipient when its debounce fires.
pub type Notifier = Arc<dyn Fn(AgentId, NotificationBatch) + Send + Sync>;

/// Flattened, de-duplicated batch delivered to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationBatch {
    pub senders: Vec<AgentId>,
    pub channels: Vec<String>,
    /// The tool the recipient calls to read the actual messages.
    pub read_tool: String,
}

impl NotificationBatch {
    /// Render the prompt text injected into the recipient's queue.
    pub fn render(&self) -> String {
        format!(
            "New messages from {} in #{}. Call {} to read them.",
            self.senders.join(", "),
            self.channels.join(", #"),
            self.read_tool
        )
    }
}

/// Name of the tool recipients use to read batched messages.
pub const READ_TOOL: &str = "fabric_inbox";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub debounce: Duration,
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            queue_capacity: 1024,
        }
    }
}

struct PendingBatch {
    entries: Vec<(String, AgentId)>,
    deadline: Instant,
}

/// Handle to the running broker task.
pub struct EventBroker {
    tx: mpsc::Sender<FabricEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    log: LogSink,
}

impl EventBroker {
    pub fn spawn(
        config: BrokerConfig,
        subs: Arc<SubscriptionRepo>,
        slug_lookup: SlugLookup,
        participant_lister: Option<ParticipantLister>,
        notifier: Notifier,
        log: LogSink,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let loop_log = log.clone();
        let handle = tokio::spawn(async move {
            BrokerLoop {
                config,
                subs,
                slug_lookup,
                participant_lister,
                notifier,
                pending: HashMap::new(),
                log: loop_log,
            }
            .run(rx, loop_cancel)
            .await;
        });
        Self {
            tx,
            cancel,
            handle,
            log,
        }
    }

    /// Event sink for [`crate::fabric::FabricService`]. Non-blocking: a full
    /// queue drops the event with a warning.
    pub fn sink(&self) -> crate::fabric::service::EventSink {
        let tx = self.tx.clone();
        let log = self.log.clone();
        Arc::new(move |event: &FabricEvent| {
            if let Err(error) = tx.try_send(event.clone()) {
                tracing::warn!(%error, event = event.name(), "notification queue full, dropping event");
                log.warn(
                    LogCategory::Broker,
                    "event dropped",
                    &["event", event.name()],
                );
            }
        })
    }

    /// Flush all pending batches immediately and stop the loop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.tx);
        if let Err(error) = self.handle.await {
            tracing::debug!(%error, "broker task ended with error");
        }
    }
}

struct BrokerLoop {
    config: BrokerConfig,
    subs: Arc<SubscriptionRepo>,
    slug_lookup: SlugLookup,
    participant_lister: Option<ParticipantLister>,
    notifier: Notifier,
    pending: HashMap<AgentId, PendingBatch>,
    log: LogSink,
}

impl BrokerLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<FabricEvent>, cancel: CancellationToken) {
        loop {
            let next_deadline = self.pending.values().map(|batch| batch.deadline).min();
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(&event),
                        None => break,
                    }
                }
                _ = sleep_until_or_forever(next_deadline) => {
                    self.flush_due(Instant::now());
                }
            }
        }
        self.flush_all();
    }

    fn handle_event(&mut self, event: &FabricEvent) {
        let Some(thread) = event.posted_thread() else {
            tracing::trace!(event = event.name(), "event does not notify");
            return;
        };
        let Some(channel_id) = event.channel_id() else {
            return;
        };
        let slug = (self.slug_lookup)(channel_id).unwrap_or_default();
        let sender = thread.created_by.clone();

        let recipients = self.resolve_recipients(event, channel_id, &slug, &sender);
        if recipients.is_empty() {
            return;
        }

        let deadline = Instant::now() + self.config.debounce;
        for recipient in recipients {
            let batch = self.pending.entry(recipient).or_insert_with(|| PendingBatch {
                entries: Vec::new(),
                deadline,
            });
            batch.entries.push((slug.clone(), sender.clone()));
            // Fresh traffic restarts the recipient's debounce window.
            batch.deadline = deadline;
        }
    }

    fn resolve_recipients(
        &self,
        event: &FabricEvent,
        channel_id: &ThreadId,
        slug: &str,
        sender: &AgentId,
    ) -> Vec<AgentId> {
        let mentions: Vec<String> = event
            .posted_thread()
            .map(|thread| thread.mentions.clone())
            .unwrap_or_default();
        let mentioned_ids: Vec<AgentId> = mentions
            .iter()
            .filter(|token| !is_here_token(token))
            .map(|token| canonical_agent_id(token))
            .collect();

        let mut recipients: Vec<AgentId> = Vec::new();
        let mut push = |id: AgentId| {
            if !recipients.contains(&id) {
                recipients.push(id);
            }
        };

        for subscription in self.subs.list_for_channel(channel_id) {
            match subscription.mode {
                SubscriptionMode::All => push(subscription.agent_id),
                SubscriptionMode::Mentions => {
                    if mentioned_ids
                        .iter()
                        .any(|id| id.eq_ignore_ascii_case(&subscription.agent_id))
                    {
                        push(subscription.agent_id);
                    }
                }
                SubscriptionMode::None => {}
            }
        }

        // Explicit mentions always notify, subscription or not.
        for id in &mentioned_ids {
            push(id.clone());
        }

        if let FabricEvent::ReplyPosted { participants, .. } = event {
            for id in participants {
                push(id.clone());
            }
        }

        if mentions.iter().any(|token| is_here_token(token)) {
            if let Some(lister) = &self.participant_lister {
                for id in lister() {
                    push(id);
                }
            }
        }

        recipients.retain(|id| !id.eq_ignore_ascii_case(sender));

        // The observer meta-channel never generates cross-talk: only the
        // observer process hears about traffic on it.
        if slug == OBSERVER_SLUG {
            recipients.retain(|id| id == OBSERVER_ID);
        }

        recipients
    }

    fn flush_due(&mut self, now: Instant) {
        let due: Vec<AgentId> = self
            .pending
            .iter()
            .filter(|(_, batch)| batch.deadline <= now)
            .map(|(recipient, _)| recipient.clone())
            .collect();
        for recipient in due {
            self.flush_recipient(&recipient);
        }
    }

    fn flush_all(&mut self) {
        let recipients: Vec<AgentId> = self.pending.keys().cloned().collect();
        for recipient in recipients {
            self.flush_recipient(&recipient);
        }
    }

    fn flush_recipient(&mut self, recipient: &AgentId) {
        let Some(batch) = self.pending.remove(recipient) else {
            return;
        };
        let mut senders: Vec<AgentId> = Vec::new();
        let mut channels: Vec<String> = Vec::new();
        for (slug, sender) in batch.entries {
            if !sender.is_empty() && !senders.contains(&sender) {
                senders.push(sender);
            }
            if !slug.is_empty() && !channels.contains(&slug) {
                channels.push(slug);
            }
        }
        self.log.debug(
            LogCategory::Broker,
            "notification flushed",
            &["recipient", recipient],
        );
        (self.notifier)(
            recipient.clone(),
            NotificationBatch {
                senders,
                channels,
                read_tool: READ_TOOL.to_string(),
            },
        );
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_here_token(token: &str) -> bool {
    token.eq_ignore_ascii_case(HERE_MENTION)
}

/// Canonical agent id for a mention token: strip the sigil, uppercase.
fn canonical_agent_id(token: &str) -> AgentId {
    token.trim_start_matches('@').to_ascii_uppercase()
}
