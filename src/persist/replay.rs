//! Event-log loading and state restoration.
//!
//! Loading tolerates a partial final write (malformed trailing line) and
//! unknown event types (lines that fail to decode are skipped with a debug
//! log, which also gives forward compatibility with newer writers). Replay
//! preserves original ids and seqs and silently skips threads that already
//! exist, so replaying a log over partially restored repositories is safe.

use crate::fabric::FabricEvent;
use crate::fabric::repo::{AckRepo, DependencyRepo, ReactionRepo, SubscriptionRepo, ThreadRepo};
use crate::fabric::types::{Dependency, DependencyRelation, Reaction, FIXED_SLUGS};
use crate::persist::event_log::{PersistedEvent, LOG_FILE};
use crate::{Result, ThreadId};
use std::collections::HashMap;
use std::io::BufRead as _;
use std::path::Path;

/// Per-line read buffer, sized to accommodate artifact payloads.
const LINE_BUFFER_BYTES: usize = 1024 * 1024;

/// Read `<session_dir>/fabric.jsonl` in order. A missing file is an empty
/// session, not an error.
pub fn load_persisted_events(session_dir: &Path) -> Result<Vec<PersistedEvent>> {
    let path = session_dir.join(LOG_FILE);
    let file = match std::fs::File::open(&path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };

    let mut reader = std::io::BufReader::with_capacity(LINE_BUFFER_BYTES, file);
    let mut events = Vec::new();
    let mut line = String::new();
    let mut line_no = 0usize;
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<PersistedEvent>(trimmed) {
            Ok(event) => events.push(event),
            Err(error) => {
                // Partial final write or an event type this build predates.
                tracing::debug!(line = line_no, %error, "skipping undecodable event line");
            }
        }
    }
    Ok(events)
}

/// Channels recovered after replay, keyed by fixed slug. Slugs absent from
/// the log stay absent.
pub type RestoredChannels = HashMap<String, ThreadId>;

/// Rebuild repository state from an ordered event list.
pub fn restore_fabric_state(
    events: &[PersistedEvent],
    threads: &ThreadRepo,
    deps: &DependencyRepo,
    subs: &SubscriptionRepo,
    acks: &AckRepo,
    reactions: &ReactionRepo,
) -> Result<RestoredChannels> {
    for persisted in events {
        match &persisted.event {
            FabricEvent::ChannelCreated { channel } => {
                restore_thread(threads, channel.clone())?;
            }
            FabricEvent::MessagePosted {
                channel_id,
                message,
            } => {
                if restore_thread(threads, message.clone())? {
                    deps.add(Dependency {
                        thread_id: message.id.clone(),
                        depends_on_id: channel_id.clone(),
                        relation: DependencyRelation::ChildOf,
                    });
                }
            }
            FabricEvent::ReplyPosted {
                channel_id,
                parent_id,
                reply,
                ..
            } => {
                if restore_thread(threads, reply.clone())? {
                    deps.add(Dependency {
                        thread_id: reply.id.clone(),
                        depends_on_id: channel_id.clone(),
                        relation: DependencyRelation::ChildOf,
                    });
                    deps.add(Dependency {
                        thread_id: reply.id.clone(),
                        depends_on_id: parent_id.clone(),
                        relation: DependencyRelation::ReplyTo,
                    });
                }
            }
            FabricEvent::ArtifactAttached {
                thread_id,
                artifact,
            } => {
                if restore_thread(threads, artifact.clone())? {
                    deps.add(Dependency {
                        thread_id: artifact.id.clone(),
                        depends_on_id: thread_id.clone(),
                        relation: DependencyRelation::References,
                    });
                }
            }
            FabricEvent::ChannelArchived { channel_id } => {
                threads.archive(channel_id).ok();
            }
            FabricEvent::Subscribed {
                channel_id,
                agent_id,
                mode,
            } => {
                subs.subscribe(channel_id, agent_id, *mode);
            }
            FabricEvent::Unsubscribed {
                channel_id,
                agent_id,
            } => {
                subs.unsubscribe(channel_id, agent_id);
            }
            FabricEvent::Acked {
                agent_id,
                thread_ids,
            } => {
                acks.ack(agent_id, thread_ids);
            }
            FabricEvent::ReactionAdded {
                thread_id,
                agent_id,
                emoji,
            } => {
                reactions.add(Reaction {
                    thread_id: thread_id.clone(),
                    agent_id: agent_id.clone(),
                    emoji: emoji.clone(),
                });
            }
            FabricEvent::ReactionRemoved {
                thread_id,
                agent_id,
                emoji,
            } => {
                reactions.remove(&Reaction {
                    thread_id: thread_id.clone(),
                    agent_id: agent_id.clone(),
                    emoji: emoji.clone(),
                });
            }
        }
    }

    let mut channels = RestoredChannels::new();
    for slug in FIXED_SLUGS {
        if let Ok(channel) = threads.get_by_slug(slug) {
            channels.insert(slug.to_string(), channel.id);
        }
    }
    Ok(channels)
}

fn restore_thread(threads: &ThreadRepo, thread: crate::fabric::types::Thread) -> Result<bool> {
    threads.restore(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::repo::ParticipantRepo;
    use crate::fabric::service::{FabricService, ReplyInput, SendMessageInput};
    use crate::fabric::types::SubscriptionMode;
    use crate::logging::LogSink;
    use crate::persist::event_log::EventLogger;
    use std::io::Write as _;
    use std::sync::Arc;

    fn fresh_repos() -> (
        Arc<ThreadRepo>,
        Arc<DependencyRepo>,
        Arc<SubscriptionRepo>,
        Arc<AckRepo>,
        Arc<ReactionRepo>,
    ) {
        (
            Arc::new(ThreadRepo::new()),
            Arc::new(DependencyRepo::new()),
            Arc::new(SubscriptionRepo::new()),
            Arc::new(AckRepo::new()),
            Arc::new(ReactionRepo::new()),
        )
    }

    fn service_over(
        threads: &Arc<ThreadRepo>,
        deps: &Arc<DependencyRepo>,
        subs: &Arc<SubscriptionRepo>,
        acks: &Arc<AckRepo>,
        reactions: &Arc<ReactionRepo>,
    ) -> FabricService {
        FabricService::new(
            Arc::clone(threads),
            Arc::clone(deps),
            Arc::clone(subs),
            Arc::clone(acks),
            Arc::new(ParticipantRepo::new()),
            Arc::clone(reactions),
            LogSink::noop(),
        )
    }

    #[test]
    fn missing_log_yields_empty_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let events = load_persisted_events(dir.path()).expect("load");
        assert!(events.is_empty());
    }

    #[test]
    fn loader_skips_blank_and_malformed_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::open(dir.path(), LogSink::noop()).expect("open");
        let (threads, deps, subs, acks, reactions) = fresh_repos();
        let service = service_over(&threads, &deps, &subs, &acks, &reactions);
        service.set_event_sink(logger.sink());
        service.init_session("COORDINATOR").expect("init");

        // Simulate a crash mid-write plus stray blank lines.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .expect("open raw");
        writeln!(file).expect("blank line");
        write!(file, "{{\"version\":1,\"persisted_at\":\"2025-").expect("torn line");

        let events = load_persisted_events(dir.path()).expect("load");
        // 6 channels + 4 subscriptions survived; the torn line did not.
        assert_eq!(events.len(), 10);
    }

    #[test]
    fn loader_ignores_unknown_event_types() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(LOG_FILE),
            indoc::indoc! {r#"
                {"version":9,"persisted_at":"2025-03-14T09:00:00Z","event":{"type":"hologram_projected","channel_id":"c-1"}}
            "#},
        )
        .expect("write");
        let events = load_persisted_events(dir.path()).expect("load");
        assert!(events.is_empty());
    }

    #[test]
    fn round_trip_restores_equivalent_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::open(dir.path(), LogSink::noop()).expect("open");

        // Original session.
        let (threads, deps, subs, acks, reactions) = fresh_repos();
        let service = service_over(&threads, &deps, &subs, &acks, &reactions);
        service.set_event_sink(logger.sink());
        service.init_session("COORDINATOR").expect("init");

        let m1 = service
            .send_message(SendMessageInput {
                channel_slug: "tasks".into(),
                content: "first".into(),
                created_by: "WORKER.1".into(),
                mentions: Vec::new(),
            })
            .expect("m1");
        let m2 = service
            .send_message(SendMessageInput {
                channel_slug: "tasks".into(),
                content: "second".into(),
                created_by: "WORKER.2".into(),
                mentions: Vec::new(),
            })
            .expect("m2");
        let reply = service
            .reply(ReplyInput {
                message_id: m1.id.clone(),
                content: "on it".into(),
                created_by: "COORDINATOR".into(),
                mentions: Vec::new(),
            })
            .expect("reply");
        service.ack("COORDINATOR", vec![m1.id.clone()]).expect("ack");
        service
            .subscribe("tasks", "WORKER.1", SubscriptionMode::Mentions)
            .expect("subscribe");

        let tasks_id = threads.get_by_slug("tasks").expect("tasks").id;

        // Restart into empty repositories.
        let events = load_persisted_events(dir.path()).expect("load");
        let (threads2, deps2, subs2, acks2, reactions2) = fresh_repos();
        let channels =
            restore_fabric_state(&events, &threads2, &deps2, &subs2, &acks2, &reactions2)
                .expect("restore");

        assert_eq!(channels.get("tasks"), Some(&tasks_id));
        assert_eq!(channels.len(), FIXED_SLUGS.len());

        for original in [&m1, &m2, &reply] {
            let restored = threads2.get(&original.id).expect("thread restored");
            assert_eq!(restored.seq, original.seq);
            assert_eq!(restored.content, original.content);
            assert_eq!(restored.created_by, original.created_by);
        }
        assert_eq!(
            threads2.get_by_slug("tasks").expect("slug lookup").id,
            tasks_id
        );
        assert_eq!(
            deps2.get_parents(&reply.id, Some(DependencyRelation::ReplyTo))[0].depends_on_id,
            m1.id
        );
        assert!(acks2.is_acked(&m1.id, "COORDINATOR"));
        assert!(!acks2.is_acked(&m2.id, "COORDINATOR"));

        let worker_subs = subs2.list_for_agent("WORKER.1");
        assert_eq!(worker_subs.len(), 1);
        assert_eq!(worker_subs[0].channel_id, tasks_id);
        assert_eq!(worker_subs[0].mode, SubscriptionMode::Mentions);
    }

    #[test]
    fn replaying_twice_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::open(dir.path(), LogSink::noop()).expect("open");
        let (threads, deps, subs, acks, reactions) = fresh_repos();
        let service = service_over(&threads, &deps, &subs, &acks, &reactions);
        service.set_event_sink(logger.sink());
        service.init_session("COORDINATOR").expect("init");
        service
            .send_message(SendMessageInput {
                channel_slug: "general".into(),
                content: "hello".into(),
                created_by: "WORKER.1".into(),
                mentions: Vec::new(),
            })
            .expect("message");

        let events = load_persisted_events(dir.path()).expect("load");
        let (threads2, deps2, subs2, acks2, reactions2) = fresh_repos();
        restore_fabric_state(&events, &threads2, &deps2, &subs2, &acks2, &reactions2)
            .expect("first replay");
        restore_fabric_state(&events, &threads2, &deps2, &subs2, &acks2, &reactions2)
            .expect("second replay is silent");

        let general = threads2.get_by_slug("general").expect("channel");
        assert_eq!(
            deps2
                .get_children(&general.id, Some(DependencyRelation::ChildOf))
                .len(),
            1
        );
    }
}
