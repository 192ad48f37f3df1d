//! The rendered output handed to the provider-invocation layer.
//!
//! Serialises to `{ messages: [{ role, content: [{ type, ... }], ...extra }] }`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attributes carried over verbatim from the originating tag.
pub type ExtraAttributes = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
    /// Frontmatter configuration, when the prompt has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub const ALL: [Self; 4] = [Self::System, Self::User, Self::Assistant, Self::Tool];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    /// Parses a role name. Only the fixed role set is accepted.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == name)
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
    #[serde(flatten)]
    pub extra: ExtraAttributes,
}

impl Message {
    pub fn new(role: MessageRole) -> Self {
        Self {
            role,
            content: Vec::new(),
            extra: ExtraAttributes::new(),
        }
    }

    /// Concatenated text of all text parts, mostly useful in tests and logs.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.text.as_str()),
                ContentPart::Image(_) | ContentPart::ToolCall(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text(TextContent),
    Image(ImageContent),
    ToolCall(ToolCallContent),
}

impl ContentPart {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::ToolCall(_) => "tool-call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
    #[serde(flatten)]
    pub extra: ExtraAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageContent {
    pub image: String,
    #[serde(flatten)]
    pub extra: ExtraAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallContent {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_arguments: Map<String, Value>,
    #[serde(flatten)]
    pub extra: ExtraAttributes,
}
