//! Fabric entity types.

use crate::{AgentId, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slugs of the channels every session starts with.
pub const FIXED_SLUGS: [&str; 6] = [
    ROOT_SLUG,
    SYSTEM_SLUG,
    TASKS_SLUG,
    PLANNING_SLUG,
    GENERAL_SLUG,
    OBSERVER_SLUG,
];

pub const ROOT_SLUG: &str = "root";
pub const SYSTEM_SLUG: &str = "system";
pub const TASKS_SLUG: &str = "tasks";
pub const PLANNING_SLUG: &str = "planning";
pub const GENERAL_SLUG: &str = "general";

/// The observer meta-channel; notifications on it are suppressed for every
/// recipient except the observer process itself.
pub const OBSERVER_SLUG: &str = "observer";

/// Node kinds in the Fabric graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Channel,
    Message,
    Artifact,
}

impl ThreadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadKind::Channel => "channel",
            ThreadKind::Message => "message",
            ThreadKind::Artifact => "artifact",
        }
    }
}

impl std::fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// File metadata carried by artifact threads. The file itself lives at
/// `storage_uri`; the Fabric stores only the reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactMeta {
    pub name: String,
    pub media_type: String,
    pub size_bytes: u64,
    pub storage_uri: String,
    pub sha256: String,
}

/// A node in the Fabric graph. Immutable after create except for archival
/// and slug rename.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: ThreadId,
    /// Globally unique, monotonically increasing; assigned on create.
    pub seq: u64,
    pub kind: ThreadKind,
    /// Set iff `kind == Channel`; unique among live channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub content: String,
    pub created_by: AgentId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactMeta>,
}

impl Thread {
    /// A channel thread awaiting id/seq assignment.
    pub fn channel(slug: impl Into<String>, created_by: impl Into<AgentId>) -> Self {
        Self {
            id: String::new(),
            seq: 0,
            kind: ThreadKind::Channel,
            slug: Some(slug.into()),
            content: String::new(),
            created_by: created_by.into(),
            created_at: Utc::now(),
            archived_at: None,
            mentions: Vec::new(),
            artifact: None,
        }
    }

    /// A message thread awaiting id/seq assignment.
    pub fn message(
        content: impl Into<String>,
        created_by: impl Into<AgentId>,
        mentions: Vec<String>,
    ) -> Self {
        Self {
            id: String::new(),
            seq: 0,
            kind: ThreadKind::Message,
            slug: None,
            content: content.into(),
            created_by: created_by.into(),
            created_at: Utc::now(),
            archived_at: None,
            mentions,
            artifact: None,
        }
    }

    /// An artifact thread awaiting id/seq assignment.
    pub fn artifact(meta: ArtifactMeta, created_by: impl Into<AgentId>) -> Self {
        Self {
            id: String::new(),
            seq: 0,
            kind: ThreadKind::Artifact,
            slug: None,
            content: String::new(),
            created_by: created_by.into(),
            created_at: Utc::now(),
            archived_at: None,
            mentions: Vec::new(),
            artifact: Some(meta),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// Typed edge relations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRelation {
    /// Message → containing channel.
    ChildOf,
    /// Reply → parent message.
    ReplyTo,
    /// Artifact → thread it attaches to.
    References,
}

impl DependencyRelation {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyRelation::ChildOf => "child_of",
            DependencyRelation::ReplyTo => "reply_to",
            DependencyRelation::References => "references",
        }
    }
}

/// A directed edge `(thread, depends_on, relation)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub thread_id: ThreadId,
    pub depends_on_id: ThreadId,
    pub relation: DependencyRelation,
}

/// How a subscriber wants to hear about channel traffic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Every message.
    #[default]
    All,
    /// Only when addressed.
    Mentions,
    /// Nothing; explicit mentions still deliver.
    None,
}

impl SubscriptionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionMode::All => "all",
            SubscriptionMode::Mentions => "mentions",
            SubscriptionMode::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(SubscriptionMode::All),
            "mentions" => Some(SubscriptionMode::Mentions),
            "none" => Some(SubscriptionMode::None),
            _ => None,
        }
    }
}

/// A subscription row, keyed by `(channel_id, agent_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub channel_id: ThreadId,
    pub agent_id: AgentId,
    pub mode: SubscriptionMode,
}

/// Roles a participant may hold. Participants exist only to resolve `@here`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Coordinator,
    Worker,
    Observer,
    User,
}

impl ParticipantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Coordinator => "coordinator",
            ParticipantRole::Worker => "worker",
            ParticipantRole::Observer => "observer",
            ParticipantRole::User => "user",
        }
    }
}

/// A joined participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub agent_id: AgentId,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

/// An emoji reaction, keyed by `(thread_id, agent_id, emoji)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Reaction {
    pub thread_id: ThreadId,
    pub agent_id: AgentId,
    pub emoji: String,
}

/// Filters accepted by `ThreadRepo::list`. Results are ordered by ascending
/// seq; `limit` applies after filtering.
#[derive(Debug, Clone, Default)]
pub struct ListThreadsOpts {
    pub kind: Option<ThreadKind>,
    pub after_seq: Option<u64>,
    pub created_by: Option<AgentId>,
    pub mentions_agent: Option<AgentId>,
    pub channel_id: Option<ThreadId>,
    pub limit: Option<usize>,
}
