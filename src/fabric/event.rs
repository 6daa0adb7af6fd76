//! Events emitted by the Fabric service.
//!
//! Embedded threads are snapshots taken after the repository mutation
//! succeeded; no event is emitted for a failed mutation. `ReplyPosted`
//! carries an explicit `parent_id` alongside `channel_id` so consumers and
//! replay never have to overload one field with two meanings.

use crate::fabric::types::{SubscriptionMode, Thread};
use crate::{AgentId, ThreadId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FabricEvent {
    ChannelCreated {
        channel: Thread,
    },
    MessagePosted {
        channel_id: ThreadId,
        message: Thread,
    },
    ReplyPosted {
        channel_id: ThreadId,
        parent_id: ThreadId,
        reply: Thread,
        /// Creators across the parent's reply subtree plus the root creator.
        participants: Vec<AgentId>,
    },
    ArtifactAttached {
        thread_id: ThreadId,
        artifact: Thread,
    },
    ChannelArchived {
        channel_id: ThreadId,
    },
    Subscribed {
        channel_id: ThreadId,
        agent_id: AgentId,
        mode: SubscriptionMode,
    },
    Unsubscribed {
        channel_id: ThreadId,
        agent_id: AgentId,
    },
    Acked {
        agent_id: AgentId,
        thread_ids: Vec<ThreadId>,
    },
    ReactionAdded {
        thread_id: ThreadId,
        agent_id: AgentId,
        emoji: String,
    },
    ReactionRemoved {
        thread_id: ThreadId,
        agent_id: AgentId,
        emoji: String,
    },
}

impl FabricEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FabricEvent::ChannelCreated { .. } => "channel_created",
            FabricEvent::MessagePosted { .. } => "message_posted",
            FabricEvent::ReplyPosted { .. } => "reply_posted",
            FabricEvent::ArtifactAttached { .. } => "artifact_attached",
            FabricEvent::ChannelArchived { .. } => "channel_archived",
            FabricEvent::Subscribed { .. } => "subscribed",
            FabricEvent::Unsubscribed { .. } => "unsubscribed",
            FabricEvent::Acked { .. } => "acked",
            FabricEvent::ReactionAdded { .. } => "reaction_added",
            FabricEvent::ReactionRemoved { .. } => "reaction_removed",
        }
    }

    /// The channel the event belongs to, where one applies.
    pub fn channel_id(&self) -> Option<&ThreadId> {
        match self {
            FabricEvent::ChannelCreated { channel } => Some(&channel.id),
            FabricEvent::MessagePosted { channel_id, .. }
            | FabricEvent::ReplyPosted { channel_id, .. }
            | FabricEvent::ChannelArchived { channel_id }
            | FabricEvent::Subscribed { channel_id, .. }
            | FabricEvent::Unsubscribed { channel_id, .. } => Some(channel_id),
            _ => None,
        }
    }

    /// The posted thread for the two notification-bearing event kinds.
    pub fn posted_thread(&self) -> Option<&Thread> {
        match self {
            FabricEvent::MessagePosted { message, .. } => Some(message),
            FabricEvent::ReplyPosted { reply, .. } => Some(reply),
            _ => None,
        }
    }
}
