//! In-memory repositories backing the Fabric graph.
//!
//! Each repository guards its containers with a mutex and returns copies, so
//! callers can never mutate internal state. Cross-repository queries (channel
//! attribution for unacked counts, root detection) take their collaborators
//! as arguments instead of holding references, which keeps each repo
//! independently constructible in tests and during replay.

use crate::error::{FabricError, Result};
use crate::fabric::types::{
    Dependency, DependencyRelation, ListThreadsOpts, Participant, ParticipantRole, Reaction,
    Subscription, SubscriptionMode, Thread, ThreadKind,
};
use crate::{AgentId, ThreadId};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread storage plus the live-channel slug index and the global seq counter.
#[derive(Debug, Default)]
pub struct ThreadRepo {
    threads: Mutex<HashMap<ThreadId, Thread>>,
    slugs: Mutex<HashMap<String, ThreadId>>,
    seq: AtomicU64,
}

impl ThreadRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new thread, assigning an id (when empty) and the next seq.
    pub fn create(&self, mut thread: Thread) -> Result<Thread> {
        match thread.kind {
            ThreadKind::Channel if thread.slug.is_none() => {
                return Err(FabricError::MissingSlug.into());
            }
            ThreadKind::Message | ThreadKind::Artifact if thread.slug.is_some() => {
                return Err(FabricError::UnexpectedSlug.into());
            }
            _ => {}
        }

        if thread.id.is_empty() {
            thread.id = uuid::Uuid::new_v4().to_string();
        }

        let mut threads = self.threads.lock();
        let mut slugs = self.slugs.lock();
        if let Some(slug) = &thread.slug {
            if slugs.contains_key(slug) {
                return Err(FabricError::SlugExists { slug: slug.clone() }.into());
            }
            slugs.insert(slug.clone(), thread.id.clone());
        }
        // Seq allocation happens after validation so failed creates leave no
        // gap in the sequence.
        thread.seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        threads.insert(thread.id.clone(), thread.clone());
        Ok(thread)
    }

    /// Insert a thread preserving its id and seq. Returns false when the id is
    /// already present (the insert is skipped). Used by replay.
    pub fn restore(&self, thread: Thread) -> Result<bool> {
        let mut threads = self.threads.lock();
        if threads.contains_key(&thread.id) {
            return Ok(false);
        }
        self.seq.fetch_max(thread.seq, Ordering::SeqCst);
        if let Some(slug) = &thread.slug
            && !thread.is_archived()
        {
            let mut slugs = self.slugs.lock();
            if slugs.contains_key(slug) {
                return Err(FabricError::SlugExists { slug: slug.clone() }.into());
            }
            slugs.insert(slug.clone(), thread.id.clone());
        }
        threads.insert(thread.id.clone(), thread);
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Result<Thread> {
        self.threads
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| FabricError::ThreadNotFound { id: id.to_string() }.into())
    }

    /// Look up a live channel by slug.
    pub fn get_by_slug(&self, slug: &str) -> Result<Thread> {
        let id = self
            .slugs
            .lock()
            .get(slug)
            .cloned()
            .ok_or_else(|| FabricError::ChannelNotFound {
                slug: slug.to_string(),
            })?;
        self.get(&id)
    }

    /// List threads matching `opts`, ordered by ascending seq. The channel
    /// filter is resolved through `deps` (child_of edges).
    pub fn list(&self, opts: &ListThreadsOpts, deps: &DependencyRepo) -> Vec<Thread> {
        let channel_members: Option<HashSet<ThreadId>> = opts.channel_id.as_ref().map(|channel| {
            deps.get_children(channel, Some(DependencyRelation::ChildOf))
                .into_iter()
                .map(|edge| edge.thread_id)
                .collect()
        });

        let mut results: Vec<Thread> = self
            .threads
            .lock()
            .values()
            .filter(|thread| {
                if let Some(kind) = opts.kind
                    && thread.kind != kind
                {
                    return false;
                }
                if let Some(after) = opts.after_seq
                    && thread.seq <= after
                {
                    return false;
                }
                if let Some(creator) = &opts.created_by
                    && &thread.created_by != creator
                {
                    return false;
                }
                if let Some(agent) = &opts.mentions_agent
                    && !thread
                        .mentions
                        .iter()
                        .any(|m| m.trim_start_matches('@').eq_ignore_ascii_case(agent))
                {
                    return false;
                }
                if let Some(members) = &channel_members
                    && !members.contains(&thread.id)
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        results.sort_by_key(|thread| thread.seq);
        if let Some(limit) = opts.limit {
            results.truncate(limit);
        }
        results
    }

    /// Replace a stored thread. Slug renames update the live-slug index.
    pub fn update(&self, thread: Thread) -> Result<Thread> {
        let mut threads = self.threads.lock();
        let Some(existing) = threads.get(&thread.id) else {
            return Err(FabricError::ThreadNotFound {
                id: thread.id.clone(),
            }
            .into());
        };

        if existing.slug != thread.slug {
            let mut slugs = self.slugs.lock();
            if let Some(slug) = &thread.slug {
                if slugs.get(slug).is_some_and(|owner| owner != &thread.id) {
                    return Err(FabricError::SlugExists { slug: slug.clone() }.into());
                }
                if let Some(old) = &existing.slug {
                    slugs.remove(old);
                }
                if !thread.is_archived() {
                    slugs.insert(slug.clone(), thread.id.clone());
                }
            } else if let Some(old) = &existing.slug {
                slugs.remove(old);
            }
        }

        threads.insert(thread.id.clone(), thread.clone());
        Ok(thread)
    }

    /// Archive a thread, freeing its slug for reuse.
    pub fn archive(&self, id: &str) -> Result<Thread> {
        let mut threads = self.threads.lock();
        let Some(thread) = threads.get_mut(id) else {
            return Err(FabricError::ThreadNotFound { id: id.to_string() }.into());
        };
        if thread.archived_at.is_none() {
            thread.archived_at = Some(Utc::now());
            if let Some(slug) = &thread.slug {
                self.slugs.lock().remove(slug);
            }
        }
        Ok(thread.clone())
    }

    /// Resolve a channel id to its slug, archived channels included.
    pub fn slug_of(&self, id: &str) -> Option<String> {
        self.threads.lock().get(id).and_then(|t| t.slug.clone())
    }
}

/// Directed, typed edges between threads.
#[derive(Debug, Default)]
pub struct DependencyRepo {
    edges: Mutex<HashSet<Dependency>>,
}

impl DependencyRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent edge insert. Returns true when the edge is new.
    pub fn add(&self, dep: Dependency) -> bool {
        self.edges.lock().insert(dep)
    }

    pub fn remove(&self, dep: &Dependency) -> bool {
        self.edges.lock().remove(dep)
    }

    /// Edges leaving `id` (what `id` depends on), optionally filtered.
    pub fn get_parents(&self, id: &str, relation: Option<DependencyRelation>) -> Vec<Dependency> {
        let mut parents: Vec<Dependency> = self
            .edges
            .lock()
            .iter()
            .filter(|edge| edge.thread_id == id && relation.is_none_or(|r| edge.relation == r))
            .cloned()
            .collect();
        parents.sort_by(|a, b| a.depends_on_id.cmp(&b.depends_on_id));
        parents
    }

    /// Edges arriving at `id` (what depends on `id`), optionally filtered.
    pub fn get_children(&self, id: &str, relation: Option<DependencyRelation>) -> Vec<Dependency> {
        let mut children: Vec<Dependency> = self
            .edges
            .lock()
            .iter()
            .filter(|edge| edge.depends_on_id == id && relation.is_none_or(|r| edge.relation == r))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        children
    }

    /// Threads with no child_of parent, i.e. the graph roots (channels and
    /// detached threads).
    pub fn get_roots(&self, threads: &ThreadRepo) -> Vec<Thread> {
        let edges = self.edges.lock();
        let with_parent: HashSet<&ThreadId> = edges
            .iter()
            .filter(|edge| edge.relation == DependencyRelation::ChildOf)
            .map(|edge| &edge.thread_id)
            .collect();
        let mut roots: Vec<Thread> = threads
            .threads
            .lock()
            .values()
            .filter(|thread| !with_parent.contains(&thread.id))
            .cloned()
            .collect();
        roots.sort_by_key(|thread| thread.seq);
        roots
    }

    /// The unique child_of parent of a message, when one exists.
    pub fn get_channel_for_message(&self, id: &str) -> Option<ThreadId> {
        self.get_parents(id, Some(DependencyRelation::ChildOf))
            .into_iter()
            .map(|edge| edge.depends_on_id)
            .next()
    }
}

/// Channel subscriptions keyed by `(channel_id, agent_id)`.
#[derive(Debug, Default)]
pub struct SubscriptionRepo {
    rows: Mutex<HashMap<(ThreadId, AgentId), SubscriptionMode>>,
}

impl SubscriptionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update. Re-subscribing updates the mode.
    pub fn subscribe(&self, channel_id: &str, agent_id: &str, mode: SubscriptionMode) {
        self.rows
            .lock()
            .insert((channel_id.to_string(), agent_id.to_string()), mode);
    }

    /// Idempotent.
    pub fn unsubscribe(&self, channel_id: &str, agent_id: &str) {
        self.rows
            .lock()
            .remove(&(channel_id.to_string(), agent_id.to_string()));
    }

    pub fn get(&self, channel_id: &str, agent_id: &str) -> Option<Subscription> {
        self.rows
            .lock()
            .get(&(channel_id.to_string(), agent_id.to_string()))
            .map(|mode| Subscription {
                channel_id: channel_id.to_string(),
                agent_id: agent_id.to_string(),
                mode: *mode,
            })
    }

    pub fn list_for_agent(&self, agent_id: &str) -> Vec<Subscription> {
        let mut rows: Vec<Subscription> = self
            .rows
            .lock()
            .iter()
            .filter(|((_, agent), _)| agent == agent_id)
            .map(|((channel, agent), mode)| Subscription {
                channel_id: channel.clone(),
                agent_id: agent.clone(),
                mode: *mode,
            })
            .collect();
        rows.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        rows
    }

    pub fn list_for_channel(&self, channel_id: &str) -> Vec<Subscription> {
        let mut rows: Vec<Subscription> = self
            .rows
            .lock()
            .iter()
            .filter(|((channel, _), _)| channel == channel_id)
            .map(|((channel, agent), mode)| Subscription {
                channel_id: channel.clone(),
                agent_id: agent.clone(),
                mode: *mode,
            })
            .collect();
        rows.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        rows
    }
}

/// Per-channel unread summary returned by `AckRepo::get_unacked`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnackedChannel {
    pub count: usize,
    pub thread_ids: Vec<ThreadId>,
}

/// Read acknowledgements: set membership on `(thread_id, agent_id)`.
#[derive(Debug, Default)]
pub struct AckRepo {
    acks: Mutex<HashSet<(ThreadId, AgentId)>>,
}

impl AckRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn ack(&self, agent_id: &str, thread_ids: &[ThreadId]) {
        let mut acks = self.acks.lock();
        for thread_id in thread_ids {
            acks.insert((thread_id.clone(), agent_id.to_string()));
        }
    }

    pub fn is_acked(&self, thread_id: &str, agent_id: &str) -> bool {
        self.acks
            .lock()
            .contains(&(thread_id.to_string(), agent_id.to_string()))
    }

    pub fn get_acked_thread_ids(&self, agent_id: &str) -> Vec<ThreadId> {
        let mut ids: Vec<ThreadId> = self
            .acks
            .lock()
            .iter()
            .filter(|(_, agent)| agent == agent_id)
            .map(|(thread, _)| thread.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Unacked messages visible to `agent_id`, grouped by channel. A message
    /// is visible when the agent holds a subscription row (any mode) for its
    /// containing channel; the agent's own messages are never unread.
    pub fn get_unacked(
        &self,
        agent_id: &str,
        subs: &SubscriptionRepo,
        deps: &DependencyRepo,
        threads: &ThreadRepo,
    ) -> BTreeMap<ThreadId, UnackedChannel> {
        let mut result: BTreeMap<ThreadId, UnackedChannel> = BTreeMap::new();
        for subscription in subs.list_for_agent(agent_id) {
            let mut unread: Vec<Thread> = deps
                .get_children(&subscription.channel_id, Some(DependencyRelation::ChildOf))
                .into_iter()
                .filter_map(|edge| threads.get(&edge.thread_id).ok())
                .filter(|thread| {
                    thread.kind == ThreadKind::Message
                        && thread.created_by != agent_id
                        && !self.is_acked(&thread.id, agent_id)
                })
                .collect();
            if unread.is_empty() {
                continue;
            }
            unread.sort_by_key(|thread| thread.seq);
            result.insert(
                subscription.channel_id.clone(),
                UnackedChannel {
                    count: unread.len(),
                    thread_ids: unread.into_iter().map(|thread| thread.id).collect(),
                },
            );
        }
        result
    }
}

/// Joined participants, used only to resolve `@here`.
#[derive(Debug, Default)]
pub struct ParticipantRepo {
    rows: Mutex<HashMap<AgentId, Participant>>,
}

impl ParticipantRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, agent_id: &str, role: ParticipantRole) -> Result<Participant> {
        let mut rows = self.rows.lock();
        if rows.contains_key(agent_id) {
            return Err(FabricError::ParticipantExists {
                agent_id: agent_id.to_string(),
            }
            .into());
        }
        let participant = Participant {
            agent_id: agent_id.to_string(),
            role,
            joined_at: Utc::now(),
        };
        rows.insert(agent_id.to_string(), participant.clone());
        Ok(participant)
    }

    pub fn leave(&self, agent_id: &str) -> bool {
        self.rows.lock().remove(agent_id).is_some()
    }

    pub fn get(&self, agent_id: &str) -> Option<Participant> {
        self.rows.lock().get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<Participant> {
        let mut rows: Vec<Participant> = self.rows.lock().values().cloned().collect();
        rows.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        rows
    }
}

/// Emoji reactions. Duplicate adds are no-ops.
#[derive(Debug, Default)]
pub struct ReactionRepo {
    rows: Mutex<HashSet<Reaction>>,
}

impl ReactionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the reaction is new.
    pub fn add(&self, reaction: Reaction) -> bool {
        self.rows.lock().insert(reaction)
    }

    pub fn remove(&self, reaction: &Reaction) -> bool {
        self.rows.lock().remove(reaction)
    }

    pub fn list_for_thread(&self, thread_id: &str) -> Vec<Reaction> {
        let mut rows: Vec<Reaction> = self
            .rows
            .lock()
            .iter()
            .filter(|reaction| reaction.thread_id == thread_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.agent_id, &a.emoji).cmp(&(&b.agent_id, &b.emoji)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_channel(repo: &ThreadRepo, slug: &str) -> Thread {
        repo.create(Thread::channel(slug, "COORDINATOR"))
            .expect("channel should be created")
    }

    fn make_message(repo: &ThreadRepo, deps: &DependencyRepo, channel: &Thread, by: &str) -> Thread {
        let message = repo
            .create(Thread::message("hi", by, Vec::new()))
            .expect("message should be created");
        deps.add(Dependency {
            thread_id: message.id.clone(),
            depends_on_id: channel.id.clone(),
            relation: DependencyRelation::ChildOf,
        });
        message
    }

    #[test]
    fn create_assigns_id_and_monotone_seq() {
        let repo = ThreadRepo::new();
        let a = make_channel(&repo, "tasks");
        let b = repo
            .create(Thread::message("x", "WORKER.1", Vec::new()))
            .expect("message");
        assert!(!a.id.is_empty());
        assert!(a.seq < b.seq);
    }

    #[test]
    fn duplicate_live_slug_rejected() {
        let repo = ThreadRepo::new();
        make_channel(&repo, "tasks");
        let error = repo
            .create(Thread::channel("tasks", "COORDINATOR"))
            .expect_err("duplicate slug must fail");
        assert!(matches!(
            error,
            crate::Error::Fabric(FabricError::SlugExists { .. })
        ));
    }

    #[test]
    fn archive_frees_slug_for_reuse() {
        let repo = ThreadRepo::new();
        let channel = make_channel(&repo, "scratch");
        repo.archive(&channel.id).expect("archive");
        assert!(repo.get_by_slug("scratch").is_err());
        make_channel(&repo, "scratch");
    }

    #[test]
    fn slug_rename_updates_the_live_index() {
        let repo = ThreadRepo::new();
        let mut channel = make_channel(&repo, "old-name");
        channel.slug = Some("new-name".into());
        repo.update(channel).expect("rename");

        assert!(repo.get_by_slug("old-name").is_err());
        assert_eq!(
            repo.get_by_slug("new-name").expect("renamed").slug.as_deref(),
            Some("new-name")
        );
        // The freed slug is available again.
        make_channel(&repo, "old-name");
    }

    #[test]
    fn channel_requires_slug_and_messages_reject_one() {
        let repo = ThreadRepo::new();
        let mut channel = Thread::channel("x", "COORDINATOR");
        channel.slug = None;
        assert!(repo.create(channel).is_err());

        let mut message = Thread::message("x", "WORKER.1", Vec::new());
        message.slug = Some("nope".into());
        assert!(repo.create(message).is_err());
    }

    #[test]
    fn restore_preserves_id_and_seq_and_skips_existing() {
        let repo = ThreadRepo::new();
        let mut thread = Thread::message("hello", "WORKER.1", Vec::new());
        thread.id = "t-42".into();
        thread.seq = 42;

        assert!(repo.restore(thread.clone()).expect("restore"));
        assert!(!repo.restore(thread).expect("second restore skips"));

        let stored = repo.get("t-42").expect("stored");
        assert_eq!(stored.seq, 42);

        // The counter continues past the restored seq.
        let next = repo
            .create(Thread::message("after", "WORKER.1", Vec::new()))
            .expect("create");
        assert!(next.seq > 42);
    }

    #[test]
    fn list_filters_by_kind_seq_creator_and_channel() {
        let threads = ThreadRepo::new();
        let deps = DependencyRepo::new();
        let tasks = make_channel(&threads, "tasks");
        let general = make_channel(&threads, "general");
        let m1 = make_message(&threads, &deps, &tasks, "WORKER.1");
        let _m2 = make_message(&threads, &deps, &general, "WORKER.2");
        let m3 = make_message(&threads, &deps, &tasks, "WORKER.2");

        let in_tasks = threads.list(
            &ListThreadsOpts {
                channel_id: Some(tasks.id.clone()),
                ..Default::default()
            },
            &deps,
        );
        assert_eq!(
            in_tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            vec![m1.id.clone(), m3.id.clone()]
        );

        let after = threads.list(
            &ListThreadsOpts {
                kind: Some(ThreadKind::Message),
                after_seq: Some(m1.seq),
                ..Default::default()
            },
            &deps,
        );
        assert!(after.iter().all(|t| t.seq > m1.seq));

        let by_creator = threads.list(
            &ListThreadsOpts {
                created_by: Some("WORKER.1".into()),
                kind: Some(ThreadKind::Message),
                ..Default::default()
            },
            &deps,
        );
        assert_eq!(by_creator.len(), 1);
        assert_eq!(by_creator[0].id, m1.id);
    }

    #[test]
    fn list_mentions_filter_is_case_insensitive() {
        let threads = ThreadRepo::new();
        let deps = DependencyRepo::new();
        threads
            .create(Thread::message(
                "ping",
                "WORKER.1",
                vec!["@coordinator".into()],
            ))
            .expect("message");

        let hits = threads.list(
            &ListThreadsOpts {
                mentions_agent: Some("COORDINATOR".into()),
                ..Default::default()
            },
            &deps,
        );
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn dependency_add_is_idempotent() {
        let deps = DependencyRepo::new();
        let edge = Dependency {
            thread_id: "a".into(),
            depends_on_id: "b".into(),
            relation: DependencyRelation::ChildOf,
        };
        assert!(deps.add(edge.clone()));
        assert!(!deps.add(edge.clone()));
        assert_eq!(deps.get_parents("a", None).len(), 1);
        assert!(deps.remove(&edge));
        assert!(deps.get_parents("a", None).is_empty());
    }

    #[test]
    fn channel_for_message_follows_child_of() {
        let threads = ThreadRepo::new();
        let deps = DependencyRepo::new();
        let channel = make_channel(&threads, "tasks");
        let message = make_message(&threads, &deps, &channel, "WORKER.1");
        assert_eq!(
            deps.get_channel_for_message(&message.id),
            Some(channel.id.clone())
        );
        assert_eq!(deps.get_channel_for_message(&channel.id), None);
    }

    #[test]
    fn roots_are_threads_without_child_of_parent() {
        let threads = ThreadRepo::new();
        let deps = DependencyRepo::new();
        let channel = make_channel(&threads, "tasks");
        let _message = make_message(&threads, &deps, &channel, "WORKER.1");
        let roots = deps.get_roots(&threads);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, channel.id);
    }

    #[test]
    fn resubscribe_updates_mode() {
        let subs = SubscriptionRepo::new();
        subs.subscribe("c-1", "WORKER.1", SubscriptionMode::All);
        subs.subscribe("c-1", "WORKER.1", SubscriptionMode::Mentions);
        let row = subs.get("c-1", "WORKER.1").expect("row");
        assert_eq!(row.mode, SubscriptionMode::Mentions);
        assert_eq!(subs.list_for_channel("c-1").len(), 1);

        subs.unsubscribe("c-1", "WORKER.1");
        subs.unsubscribe("c-1", "WORKER.1");
        assert!(subs.get("c-1", "WORKER.1").is_none());
    }

    #[test]
    fn ack_closure_and_unacked_grouping() {
        let threads = ThreadRepo::new();
        let deps = DependencyRepo::new();
        let subs = SubscriptionRepo::new();
        let acks = AckRepo::new();

        let tasks = make_channel(&threads, "tasks");
        subs.subscribe(&tasks.id, "COORDINATOR", SubscriptionMode::All);

        let m1 = make_message(&threads, &deps, &tasks, "WORKER.1");
        let m2 = make_message(&threads, &deps, &tasks, "WORKER.2");
        // The coordinator's own message never shows as unread.
        let _own = make_message(&threads, &deps, &tasks, "COORDINATOR");

        let unacked = acks.get_unacked("COORDINATOR", &subs, &deps, &threads);
        let entry = unacked.get(&tasks.id).expect("channel entry");
        assert_eq!(entry.count, 2);
        assert_eq!(entry.thread_ids, vec![m1.id.clone(), m2.id.clone()]);

        acks.ack("COORDINATOR", &[m1.id.clone()]);
        acks.ack("COORDINATOR", &[m1.id.clone()]);
        assert!(acks.is_acked(&m1.id, "COORDINATOR"));

        let unacked = acks.get_unacked("COORDINATOR", &subs, &deps, &threads);
        assert_eq!(unacked.get(&tasks.id).expect("entry").count, 1);

        // Unsubscribing removes the channel from the unacked view entirely.
        subs.unsubscribe(&tasks.id, "COORDINATOR");
        let _m3 = make_message(&threads, &deps, &tasks, "WORKER.1");
        assert!(
            acks.get_unacked("COORDINATOR", &subs, &deps, &threads)
                .is_empty()
        );
        let _ = m2;
    }

    #[test]
    fn participant_join_rejects_duplicates() {
        let participants = ParticipantRepo::new();
        participants
            .join("WORKER.1", ParticipantRole::Worker)
            .expect("first join");
        let error = participants
            .join("WORKER.1", ParticipantRole::Worker)
            .expect_err("duplicate join must fail");
        assert!(matches!(
            error,
            crate::Error::Fabric(FabricError::ParticipantExists { .. })
        ));
        assert_eq!(participants.list().len(), 1);
        assert!(participants.leave("WORKER.1"));
        assert!(!participants.leave("WORKER.1"));
    }

    #[test]
    fn duplicate_reaction_is_noop() {
        let reactions = ReactionRepo::new();
        let reaction = Reaction {
            thread_id: "t-1".into(),
            agent_id: "WORKER.1".into(),
            emoji: "👍".into(),
        };
        assert!(reactions.add(reaction.clone()));
        assert!(!reactions.add(reaction.clone()));
        assert_eq!(reactions.list_for_thread("t-1").len(), 1);
        assert!(reactions.remove(&reaction));
        assert!(reactions.list_for_thread("t-1").is_empty());
    }
}
