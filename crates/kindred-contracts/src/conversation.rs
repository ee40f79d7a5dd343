use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHARACTER_NAME: &str = "角色";
pub const DEFAULT_USER_NAME: &str = "用户";

/// Upper bound on transcript lines embedded into a prompt.
pub const DEFAULT_MESSAGE_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Written by the user.
    Sent,
    /// Written by the character.
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attachment {
    Image,
    Voice,
    Video,
    Location,
    RedEnvelope,
    Transfer,
}

impl Attachment {
    /// Transcript marker, matching what the chat surface shows in place of
    /// the attachment itself.
    pub fn marker(&self) -> &'static str {
        match self {
            Attachment::Image => "[图片]",
            Attachment::Voice => "[语音]",
            Attachment::Video => "[视频]",
            Attachment::Location => "[位置]",
            Attachment::RedEnvelope => "[红包]",
            Attachment::Transfer => "[转账]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Attachment(Attachment),
}

/// One chat message. Immutable once created; conversations only append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Character name shown in the chat header.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_setting: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name_for_char: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_personality: Option<String>,
    #[serde(default)]
    pub summaries: Vec<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
}

/// Read-only view of the host application's persisted state. Generation
/// modules never mutate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    #[serde(default)]
    pub user: UserProfile,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

impl HostState {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("failed to read state file {}: {err}", path.display()))?;
        let state = serde_json::from_str(&raw)
            .map_err(|err| anyhow::anyhow!("invalid state file {}: {err}", path.display()))?;
        Ok(state)
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|conv| conv.id == id)
    }
}

/// One line of rendered transcript, ready to embed into a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub speaker: String,
    pub text: String,
}

impl TranscriptLine {
    pub fn render(&self) -> String {
        format!("{}: {}", self.speaker, self.text)
    }
}

/// Everything the prompt builder needs about the active conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    pub conversation_id: String,
    pub character_name: String,
    pub character_persona: Option<String>,
    pub user_name: String,
    pub user_persona: Option<String>,
    pub summaries: Vec<String>,
    pub recent_messages: Vec<TranscriptLine>,
}

/// Builds a snapshot of the active conversation. Never fails: absent
/// conversations and absent fields fall back to the stated defaults so a
/// generation can still run against an empty context.
pub fn collect_context(state: &HostState, conversation_id: &str, window: usize) -> ContextSnapshot {
    let Some(conversation) = state.conversation(conversation_id) else {
        return ContextSnapshot {
            conversation_id: conversation_id.to_string(),
            character_name: DEFAULT_CHARACTER_NAME.to_string(),
            character_persona: None,
            user_name: resolve_user_name(None, state),
            user_persona: resolve_user_persona(None, state),
            summaries: Vec::new(),
            recent_messages: Vec::new(),
        };
    };

    let character_name = non_empty(Some(&conversation.name))
        .unwrap_or_else(|| DEFAULT_CHARACTER_NAME.to_string());
    let user_name = resolve_user_name(conversation.user_name_for_char.as_deref(), state);
    let window = window.max(1);
    let skip = conversation.messages.len().saturating_sub(window);

    let recent_messages = conversation.messages[skip..]
        .iter()
        .map(|message| {
            let speaker = match message.role {
                MessageRole::Sent => user_name.clone(),
                MessageRole::Received => character_name.clone(),
            };
            let text = match &message.content {
                MessageContent::Text(text) => text.clone(),
                MessageContent::Attachment(kind) => kind.marker().to_string(),
            };
            TranscriptLine { speaker, text }
        })
        .collect();

    ContextSnapshot {
        conversation_id: conversation_id.to_string(),
        character_name,
        character_persona: non_empty(conversation.character_setting.as_deref()),
        user_name,
        user_persona: resolve_user_persona(conversation.user_personality.as_deref(), state),
        summaries: conversation.summaries.clone(),
        recent_messages,
    }
}

fn resolve_user_name(per_conversation: Option<&str>, state: &HostState) -> String {
    non_empty(per_conversation)
        .or_else(|| non_empty(state.user.name.as_deref()))
        .unwrap_or_else(|| DEFAULT_USER_NAME.to_string())
}

fn resolve_user_persona(per_conversation: Option<&str>, state: &HostState) -> Option<String> {
    non_empty(per_conversation).or_else(|| non_empty(state.user.personality.as_deref()))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
