//! Transactional façade over the Fabric repositories.
//!
//! Every operation mutates one or more repositories and, on success, emits a
//! single event carrying snapshots of the touched entities. Handlers
//! installed via [`FabricService::set_event_sink`] must not block; both
//! standard sinks (event logger, broker) hand work off immediately.

use crate::error::{FabricError, Result};
use crate::fabric::event::FabricEvent;
use crate::fabric::repo::{
    AckRepo, DependencyRepo, ParticipantRepo, ReactionRepo, SubscriptionRepo, ThreadRepo,
    UnackedChannel,
};
use crate::fabric::types::{
    ArtifactMeta, Dependency, DependencyRelation, ListThreadsOpts, Participant, ParticipantRole,
    Reaction, Subscription, SubscriptionMode, Thread, ThreadKind, FIXED_SLUGS, GENERAL_SLUG,
    PLANNING_SLUG, SYSTEM_SLUG, TASKS_SLUG,
};
use crate::logging::{LogCategory, LogSink};
use crate::{AgentId, ThreadId};
use parking_lot::RwLock;
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Non-blocking event handler installed on the service.
pub type EventSink = Arc<dyn Fn(&FabricEvent) + Send + Sync>;

/// Compose several sinks into one, called in order. Keeps the service's sink
/// contract single-handler while the logger and broker both observe events.
pub fn chain_sinks(sinks: Vec<EventSink>) -> EventSink {
    Arc::new(move |event| {
        for sink in &sinks {
            sink(event);
        }
    })
}

/// Input for [`FabricService::send_message`].
#[derive(Debug, Clone)]
pub struct SendMessageInput {
    pub channel_slug: String,
    pub content: String,
    pub created_by: AgentId,
    pub mentions: Vec<String>,
}

/// Input for [`FabricService::reply`].
#[derive(Debug, Clone)]
pub struct ReplyInput {
    pub message_id: ThreadId,
    pub content: String,
    pub created_by: AgentId,
    pub mentions: Vec<String>,
}

/// Input for [`FabricService::attach`]. When `content` is provided the
/// checksum and size are computed from it; otherwise the caller supplies both.
#[derive(Debug, Clone)]
pub struct AttachInput {
    pub thread_id: ThreadId,
    pub name: String,
    pub media_type: String,
    pub storage_uri: String,
    pub created_by: AgentId,
    pub content: Option<Vec<u8>>,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
}

/// A thread plus its reply subtree, seq-ordered.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub thread: Thread,
    pub replies: Vec<Thread>,
}

/// One channel's unread summary in an inbox view.
#[derive(Debug, Clone)]
pub struct InboxChannel {
    pub channel_id: ThreadId,
    pub slug: Option<String>,
    pub count: usize,
    pub thread_ids: Vec<ThreadId>,
    pub messages: Vec<Thread>,
}

pub struct FabricService {
    threads: Arc<ThreadRepo>,
    deps: Arc<DependencyRepo>,
    subs: Arc<SubscriptionRepo>,
    acks: Arc<AckRepo>,
    participants: Arc<ParticipantRepo>,
    reactions: Arc<ReactionRepo>,
    sink: RwLock<Option<EventSink>>,
    log: LogSink,
}

impl FabricService {
    pub fn new(
        threads: Arc<ThreadRepo>,
        deps: Arc<DependencyRepo>,
        subs: Arc<SubscriptionRepo>,
        acks: Arc<AckRepo>,
        participants: Arc<ParticipantRepo>,
        reactions: Arc<ReactionRepo>,
        log: LogSink,
    ) -> Self {
        Self {
            threads,
            deps,
            subs,
            acks,
            participants,
            reactions,
            sink: RwLock::new(None),
            log,
        }
    }

    /// Install the single event handler. Chained sinks are composed with
    /// [`chain_sinks`] before installation.
    pub fn set_event_sink(&self, sink: EventSink) {
        *self.sink.write() = Some(sink);
    }

    fn emit(&self, event: FabricEvent) {
        // Clone out of the lock so a sink can never observe it held.
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink(&event);
        }
    }

    /// Slug lookup capability handed to the broker, breaking the service ↔
    /// broker reference cycle.
    pub fn slug_lookup(&self) -> Arc<dyn Fn(&ThreadId) -> Option<String> + Send + Sync> {
        let threads = Arc::clone(&self.threads);
        Arc::new(move |id: &ThreadId| threads.slug_of(id))
    }

    /// Participant lister capability for `@here` expansion.
    pub fn participant_lister(&self) -> Arc<dyn Fn() -> Vec<AgentId> + Send + Sync> {
        let participants = Arc::clone(&self.participants);
        Arc::new(move || {
            participants
                .list()
                .into_iter()
                .map(|p| p.agent_id)
                .collect()
        })
    }

    /// Ensure the fixed channels exist and subscribe the coordinator to the
    /// working set. Idempotent; safe to call after replay.
    pub fn init_session(&self, coordinator_id: &str) -> Result<HashMap<String, ThreadId>> {
        let mut channels = HashMap::new();
        for slug in FIXED_SLUGS {
            let channel = match self.threads.get_by_slug(slug) {
                Ok(existing) => existing,
                Err(_) => {
                    let channel = self.threads.create(Thread::channel(slug, coordinator_id))?;
                    self.emit(FabricEvent::ChannelCreated {
                        channel: channel.clone(),
                    });
                    channel
                }
            };
            channels.insert(slug.to_string(), channel.id);
        }

        for slug in [SYSTEM_SLUG, TASKS_SLUG, PLANNING_SLUG, GENERAL_SLUG] {
            let channel_id = channels[slug].clone();
            if self.subs.get(&channel_id, coordinator_id).is_none() {
                self.subs
                    .subscribe(&channel_id, coordinator_id, SubscriptionMode::All);
                self.emit(FabricEvent::Subscribed {
                    channel_id,
                    agent_id: coordinator_id.to_string(),
                    mode: SubscriptionMode::All,
                });
            }
        }

        self.log.info(
            LogCategory::Fabric,
            "session channels ready",
            &["coordinator", coordinator_id],
        );
        Ok(channels)
    }

    pub fn create_channel(&self, slug: &str, created_by: &str) -> Result<Thread> {
        let channel = self.threads.create(Thread::channel(slug, created_by))?;
        self.emit(FabricEvent::ChannelCreated {
            channel: channel.clone(),
        });
        Ok(channel)
    }

    pub fn archive_channel(&self, slug: &str) -> Result<Thread> {
        let channel = self.threads.get_by_slug(slug)?;
        let archived = self.threads.archive(&channel.id)?;
        self.emit(FabricEvent::ChannelArchived {
            channel_id: archived.id.clone(),
        });
        Ok(archived)
    }

    pub fn send_message(&self, input: SendMessageInput) -> Result<Thread> {
        let channel = self.threads.get_by_slug(&input.channel_slug)?;
        let message = self.threads.create(Thread::message(
            input.content,
            input.created_by,
            input.mentions,
        ))?;
        self.deps.add(Dependency {
            thread_id: message.id.clone(),
            depends_on_id: channel.id.clone(),
            relation: DependencyRelation::ChildOf,
        });
        self.log.info(
            LogCategory::Fabric,
            "message posted",
            &["channel", &input.channel_slug, "sender", &message.created_by],
        );
        self.emit(FabricEvent::MessagePosted {
            channel_id: channel.id,
            message: message.clone(),
        });
        Ok(message)
    }

    pub fn reply(&self, input: ReplyInput) -> Result<Thread> {
        let parent = self.threads.get(&input.message_id)?;
        if parent.kind != ThreadKind::Message {
            return Err(FabricError::NotAMessage { id: parent.id }.into());
        }
        let channel_id = self
            .deps
            .get_channel_for_message(&parent.id)
            .ok_or_else(|| FabricError::OrphanMessage {
                id: parent.id.clone(),
            })?;

        let reply = self.threads.create(Thread::message(
            input.content,
            input.created_by,
            input.mentions,
        ))?;
        self.deps.add(Dependency {
            thread_id: reply.id.clone(),
            depends_on_id: channel_id.clone(),
            relation: DependencyRelation::ChildOf,
        });
        self.deps.add(Dependency {
            thread_id: reply.id.clone(),
            depends_on_id: parent.id.clone(),
            relation: DependencyRelation::ReplyTo,
        });

        let participants = self.thread_participants(&parent.id);
        self.emit(FabricEvent::ReplyPosted {
            channel_id,
            parent_id: parent.id,
            reply: reply.clone(),
            participants,
        });
        Ok(reply)
    }

    /// Creators across the reply tree containing `message_id` (root creator
    /// included), excluding the new reply itself (not yet linked when called).
    fn thread_participants(&self, message_id: &str) -> Vec<AgentId> {
        // Walk up reply_to edges to the root of the conversation.
        let mut root = message_id.to_string();
        loop {
            let parents = self
                .deps
                .get_parents(&root, Some(DependencyRelation::ReplyTo));
            match parents.into_iter().next() {
                Some(edge) => root = edge.depends_on_id,
                None => break,
            }
        }

        // Collect creators across the subtree, breadth-first.
        let mut seen: HashSet<AgentId> = HashSet::new();
        let mut ordered: Vec<AgentId> = Vec::new();
        let mut queue: VecDeque<ThreadId> = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if let Ok(thread) = self.threads.get(&id)
                && seen.insert(thread.created_by.clone())
            {
                ordered.push(thread.created_by);
            }
            for edge in self
                .deps
                .get_children(&id, Some(DependencyRelation::ReplyTo))
            {
                queue.push_back(edge.thread_id);
            }
        }
        ordered
    }

    pub fn attach(&self, input: AttachInput) -> Result<Thread> {
        let target = self.threads.get(&input.thread_id)?;

        let (size_bytes, sha256) = match &input.content {
            Some(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                (bytes.len() as u64, hex::encode(hasher.finalize()))
            }
            None => (
                input.size_bytes.unwrap_or_default(),
                input.sha256.unwrap_or_default(),
            ),
        };

        let artifact = self.threads.create(Thread::artifact(
            ArtifactMeta {
                name: input.name,
                media_type: input.media_type,
                size_bytes,
                storage_uri: input.storage_uri,
                sha256,
            },
            input.created_by,
        ))?;
        self.deps.add(Dependency {
            thread_id: artifact.id.clone(),
            depends_on_id: target.id.clone(),
            relation: DependencyRelation::References,
        });
        self.emit(FabricEvent::ArtifactAttached {
            thread_id: target.id,
            artifact: artifact.clone(),
        });
        Ok(artifact)
    }

    pub fn subscribe(&self, channel_slug: &str, agent_id: &str, mode: SubscriptionMode) -> Result<()> {
        let channel = self.threads.get_by_slug(channel_slug)?;
        self.subs.subscribe(&channel.id, agent_id, mode);
        self.emit(FabricEvent::Subscribed {
            channel_id: channel.id,
            agent_id: agent_id.to_string(),
            mode,
        });
        Ok(())
    }

    pub fn unsubscribe(&self, channel_slug: &str, agent_id: &str) -> Result<()> {
        let channel = self.threads.get_by_slug(channel_slug)?;
        self.subs.unsubscribe(&channel.id, agent_id);
        self.emit(FabricEvent::Unsubscribed {
            channel_id: channel.id,
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    pub fn ack(&self, agent_id: &str, thread_ids: Vec<ThreadId>) -> Result<()> {
        self.acks.ack(agent_id, &thread_ids);
        self.emit(FabricEvent::Acked {
            agent_id: agent_id.to_string(),
            thread_ids,
        });
        Ok(())
    }

    pub fn join(&self, agent_id: &str, role: ParticipantRole) -> Result<Participant> {
        self.participants.join(agent_id, role)
    }

    /// Add a reaction; duplicates neither mutate nor emit.
    pub fn react_add(&self, thread_id: &str, agent_id: &str, emoji: &str) -> Result<()> {
        self.threads.get(thread_id)?;
        let inserted = self.reactions.add(Reaction {
            thread_id: thread_id.to_string(),
            agent_id: agent_id.to_string(),
            emoji: emoji.to_string(),
        });
        if inserted {
            self.emit(FabricEvent::ReactionAdded {
                thread_id: thread_id.to_string(),
                agent_id: agent_id.to_string(),
                emoji: emoji.to_string(),
            });
        }
        Ok(())
    }

    pub fn react_remove(&self, thread_id: &str, agent_id: &str, emoji: &str) -> Result<()> {
        let removed = self.reactions.remove(&Reaction {
            thread_id: thread_id.to_string(),
            agent_id: agent_id.to_string(),
            emoji: emoji.to_string(),
        });
        if removed {
            self.emit(FabricEvent::ReactionRemoved {
                thread_id: thread_id.to_string(),
                agent_id: agent_id.to_string(),
                emoji: emoji.to_string(),
            });
        }
        Ok(())
    }

    /// Channel history, seq-ascending, paginated by `after_seq`/`limit`.
    pub fn history(
        &self,
        channel_slug: &str,
        after_seq: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Thread>> {
        let channel = self.threads.get_by_slug(channel_slug)?;
        Ok(self.threads.list(
            &ListThreadsOpts {
                kind: Some(ThreadKind::Message),
                after_seq,
                channel_id: Some(channel.id),
                limit,
                ..Default::default()
            },
            &self.deps,
        ))
    }

    /// Per-channel unread summaries plus the unread messages themselves.
    pub fn inbox(&self, agent_id: &str) -> Vec<InboxChannel> {
        let unacked: BTreeMap<ThreadId, UnackedChannel> =
            self.acks
                .get_unacked(agent_id, &self.subs, &self.deps, &self.threads);
        unacked
            .into_iter()
            .map(|(channel_id, entry)| {
                let messages = entry
                    .thread_ids
                    .iter()
                    .filter_map(|id| self.threads.get(id).ok())
                    .collect();
                InboxChannel {
                    slug: self.threads.slug_of(&channel_id),
                    channel_id,
                    count: entry.count,
                    thread_ids: entry.thread_ids,
                    messages,
                }
            })
            .collect()
    }

    /// A thread plus its reply subtree in seq order.
    pub fn read_thread(&self, thread_id: &str) -> Result<ThreadView> {
        let thread = self.threads.get(thread_id)?;
        let mut replies = Vec::new();
        let mut queue: VecDeque<ThreadId> = VecDeque::from([thread.id.clone()]);
        while let Some(id) = queue.pop_front() {
            for edge in self
                .deps
                .get_children(&id, Some(DependencyRelation::ReplyTo))
            {
                if let Ok(reply) = self.threads.get(&edge.thread_id) {
                    queue.push_back(reply.id.clone());
                    replies.push(reply);
                }
            }
        }
        replies.sort_by_key(|reply| reply.seq);
        Ok(ThreadView { thread, replies })
    }

    pub fn subscriptions_for(&self, agent_id: &str) -> Vec<Subscription> {
        self.subs.list_for_agent(agent_id)
    }
}
