//! Fabric tools shared by the worker and coordinator namespaces.

use crate::fabric::service::{AttachInput, ReplyInput, SendMessageInput};
use crate::fabric::types::{ParticipantRole, SubscriptionMode};
use crate::fabric::FabricService;
use crate::mcp::schema::{parse_args, ToolCallResult, ToolDef};
use crate::processor::enforcement::TurnTracker;
use crate::AgentId;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct FabricTools {
    pub agent_id: AgentId,
    pub fabric: Arc<FabricService>,
    pub turns: Arc<TurnTracker>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SendArgs {
    channel: String,
    content: String,
    #[serde(default)]
    mentions: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReplyArgs {
    message_id: String,
    content: String,
    #[serde(default)]
    mentions: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AckArgs {
    thread_ids: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SubscribeArgs {
    channel: String,
    mode: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct UnsubscribeArgs {
    channel: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AttachArgs {
    thread_id: String,
    name: String,
    media_type: String,
    storage_uri: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    size_bytes: Option<u64>,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct HistoryArgs {
    channel: String,
    #[serde(default)]
    after_seq: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadThreadArgs {
    thread_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct JoinArgs {
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReactArgs {
    thread_id: String,
    emoji: String,
    action: String,
}

impl FabricTools {
    pub fn defs() -> Vec<ToolDef> {
        vec![
            ToolDef::new(
                "fabric_inbox",
                "List your unread messages grouped by channel. Ack what you have read.",
                json!({"type": "object", "properties": {}, "required": []}),
            ),
            ToolDef::new(
                "fabric_send",
                "Post a message to a channel. Mention agents with @NAME to notify them directly.",
                json!({
                    "type": "object",
                    "properties": {
                        "channel": {"type": "string", "description": "Channel slug, e.g. tasks"},
                        "content": {"type": "string"},
                        "mentions": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["channel", "content"]
                }),
            ),
            ToolDef::new(
                "fabric_reply",
                "Reply to a message. Everyone already in the conversation is notified.",
                json!({
                    "type": "object",
                    "properties": {
                        "message_id": {"type": "string"},
                        "content": {"type": "string"},
                        "mentions": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["message_id", "content"]
                }),
            ),
            ToolDef::new(
                "fabric_ack",
                "Acknowledge messages you have read.",
                json!({
                    "type": "object",
                    "properties": {
                        "thread_ids": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["thread_ids"]
                }),
            ),
            ToolDef::new(
                "fabric_subscribe",
                "Subscribe to a channel. Mode controls when you are notified.",
                json!({
                    "type": "object",
                    "properties": {
                        "channel": {"type": "string"},
                        "mode": {"type": "string", "enum": ["all", "mentions", "none"]}
                    },
                    "required": ["channel", "mode"]
                }),
            ),
            ToolDef::new(
                "fabric_unsubscribe",
                "Unsubscribe from a channel.",
                json!({
                    "type": "object",
                    "properties": {"channel": {"type": "string"}},
                    "required": ["channel"]
                }),
            ),
            ToolDef::new(
                "fabric_attach",
                "Attach a file artifact to a thread. Provide inline content or a checksum.",
                json!({
                    "type": "object",
                    "properties": {
                        "thread_id": {"type": "string"},
                        "name": {"type": "string"},
                        "media_type": {"type": "string"},
                        "storage_uri": {"type": "string"},
                        "content": {"type": "string", "description": "Inline file content; checksum and size are computed from it"},
                        "size_bytes": {"type": "integer"},
                        "sha256": {"type": "string"}
                    },
                    "required": ["thread_id", "name", "media_type", "storage_uri"]
                }),
            ),
            ToolDef::new(
                "fabric_history",
                "Read a channel's messages in order, paginated by seq.",
                json!({
                    "type": "object",
                    "properties": {
                        "channel": {"type": "string"},
                        "after_seq": {"type": "integer"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["channel"]
                }),
            ),
            ToolDef::new(
                "fabric_read_thread",
                "Read a thread and its full reply tree.",
                json!({
                    "type": "object",
                    "properties": {"thread_id": {"type": "string"}},
                    "required": ["thread_id"]
                }),
            ),
            ToolDef::new(
                "fabric_join",
                "Join the participant list so @here mentions reach you.",
                json!({
                    "type": "object",
                    "properties": {
                        "role": {"type": "string", "enum": ["coordinator", "worker", "observer", "user"]}
                    },
                    "required": []
                }),
            ),
            ToolDef::new(
                "fabric_react",
                "Add or remove an emoji reaction on a thread.",
                json!({
                    "type": "object",
                    "properties": {
                        "thread_id": {"type": "string"},
                        "emoji": {"type": "string"},
                        "action": {"type": "string", "enum": ["add", "remove"]}
                    },
                    "required": ["thread_id", "emoji", "action"]
                }),
            ),
        ]
    }

    /// Dispatch a fabric tool. Returns `None` for names outside this family.
    pub fn dispatch(&self, name: &str, args: Value) -> Option<crate::Result<ToolCallResult>> {
        match name {
            "fabric_inbox" => Some(self.inbox()),
            "fabric_send" => Some(self.send(args)),
            "fabric_reply" => Some(self.reply(args)),
            "fabric_ack" => Some(self.ack(args)),
            "fabric_subscribe" => Some(self.subscribe(args)),
            "fabric_unsubscribe" => Some(self.unsubscribe(args)),
            "fabric_attach" => Some(self.attach(args)),
            "fabric_history" => Some(self.history(args)),
            "fabric_read_thread" => Some(self.read_thread(args)),
            "fabric_join" => Some(self.join(args)),
            "fabric_react" => Some(self.react(args)),
            _ => None,
        }
    }

    fn inbox(&self) -> crate::Result<ToolCallResult> {
        let inbox = self.fabric.inbox(&self.agent_id);
        let channels: Vec<Value> = inbox
            .into_iter()
            .map(|entry| {
                json!({
                    "channel_id": entry.channel_id,
                    "channel": entry.slug,
                    "unread": entry.count,
                    "thread_ids": entry.thread_ids,
                    "messages": entry.messages,
                })
            })
            .collect();
        Ok(ToolCallResult::json(&json!({ "channels": channels })))
    }

    fn send(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: SendArgs = parse_args(args)?;
        self.turns.record_tool(&self.agent_id, "fabric_send");
        match self.fabric.send_message(SendMessageInput {
            channel_slug: args.channel.clone(),
            content: args.content,
            created_by: self.agent_id.clone(),
            mentions: args.mentions,
        }) {
            Ok(message) => Ok(ToolCallResult::text(format!(
                "posted {} to #{} (seq {})",
                message.id, args.channel, message.seq
            ))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn reply(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: ReplyArgs = parse_args(args)?;
        self.turns.record_tool(&self.agent_id, "fabric_reply");
        match self.fabric.reply(ReplyInput {
            message_id: args.message_id,
            content: args.content,
            created_by: self.agent_id.clone(),
            mentions: args.mentions,
        }) {
            Ok(reply) => Ok(ToolCallResult::text(format!(
                "replied with {} (seq {})",
                reply.id, reply.seq
            ))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn ack(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: AckArgs = parse_args(args)?;
        self.turns.record_tool(&self.agent_id, "fabric_ack");
        let count = args.thread_ids.len();
        match self.fabric.ack(&self.agent_id, args.thread_ids) {
            Ok(()) => Ok(ToolCallResult::text(format!("acked {count} messages"))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn subscribe(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: SubscribeArgs = parse_args(args)?;
        let Some(mode) = SubscriptionMode::parse(&args.mode) else {
            return Ok(ToolCallResult::error(format!(
                "invalid mode '{}': expected all, mentions, or none",
                args.mode
            )));
        };
        match self.fabric.subscribe(&args.channel, &self.agent_id, mode) {
            Ok(()) => Ok(ToolCallResult::text(format!(
                "subscribed to #{} ({})",
                args.channel,
                mode.as_str()
            ))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn unsubscribe(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: UnsubscribeArgs = parse_args(args)?;
        match self.fabric.unsubscribe(&args.channel, &self.agent_id) {
            Ok(()) => Ok(ToolCallResult::text(format!(
                "unsubscribed from #{}",
                args.channel
            ))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn attach(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: AttachArgs = parse_args(args)?;
        match self.fabric.attach(AttachInput {
            thread_id: args.thread_id,
            name: args.name,
            media_type: args.media_type,
            storage_uri: args.storage_uri,
            created_by: self.agent_id.clone(),
            content: args.content.map(String::into_bytes),
            size_bytes: args.size_bytes,
            sha256: args.sha256,
        }) {
            Ok(artifact) => Ok(ToolCallResult::text(format!(
                "attached artifact {}",
                artifact.id
            ))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn history(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: HistoryArgs = parse_args(args)?;
        match self.fabric.history(&args.channel, args.after_seq, args.limit) {
            Ok(messages) => Ok(ToolCallResult::json(&json!({
                "channel": args.channel,
                "messages": messages,
            }))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn read_thread(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: ReadThreadArgs = parse_args(args)?;
        match self.fabric.read_thread(&args.thread_id) {
            Ok(view) => Ok(ToolCallResult::json(&json!({
                "thread": view.thread,
                "replies": view.replies,
            }))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn join(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: JoinArgs = parse_args(args)?;
        let role = match args.role.as_deref() {
            Some("coordinator") => ParticipantRole::Coordinator,
            Some("observer") => ParticipantRole::Observer,
            Some("user") => ParticipantRole::User,
            Some("worker") | None => ParticipantRole::Worker,
            Some(other) => {
                return Ok(ToolCallResult::error(format!(
                    "invalid role '{other}': expected coordinator, worker, observer, or user"
                )));
            }
        };
        match self.fabric.join(&self.agent_id, role) {
            Ok(_) => Ok(ToolCallResult::text(format!(
                "{} joined as {}",
                self.agent_id,
                role.as_str()
            ))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    fn react(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: ReactArgs = parse_args(args)?;
        let result = match args.action.as_str() {
            "add" => self
                .fabric
                .react_add(&args.thread_id, &self.agent_id, &args.emoji),
            "remove" => self
                .fabric
                .react_remove(&args.thread_id, &self.agent_id, &args.emoji),
            other => {
                return Ok(ToolCallResult::error(format!(
                    "invalid action '{other}': expected add or remove"
                )));
            }
        };
        match result {
            Ok(()) => Ok(ToolCallResult::text(format!(
                "{} reaction {}",
                args.action, args.emoji
            ))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }
}
