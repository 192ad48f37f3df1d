//! Walks a parsed [`Fragment`] against a parameter scope and builds the
//! [`Conversation`].

use serde_json::{Map, Value};

use crate::{
    ast::{Attribute, AttributeValue, ElementTag, ForBlock, Fragment, IfBlock, TemplateNode},
    conversation::{
        ContentPart, Conversation, ExtraAttributes, ImageContent, Message, MessageRole,
        TextContent, ToolCallContent,
    },
    error::{ErrorCode, Position, PromptlateError, PromptlateResult},
    params::{Parameters, Scope},
    value::{evaluate, is_truthy, stringify},
};

const MESSAGE_TAG: &str = "message";
const CONTENT_TAG: &str = "content";
const CONTENT_TEXT_TAG: &str = "content-text";
const CONTENT_IMAGE_TAG: &str = "content-image";
const TOOL_CALL_TAG: &str = "tool-call";

const ROLE_ATTRIBUTE: &str = "role";
const TYPE_ATTRIBUTE: &str = "type";
const ID_ATTRIBUTE: &str = "id";
const NAME_ATTRIBUTE: &str = "name";
const ARGUMENTS_ATTRIBUTE: &str = "arguments";

const NO_ATTRIBUTES: &[&str] = &[];
const TYPE_ONLY: &[&str] = &[TYPE_ATTRIBUTE];

// Output fields an extra attribute would otherwise overwrite.
const MESSAGE_FIELDS: &[&str] = &["content"];
const TEXT_FIELDS: &[&str] = &[TYPE_ATTRIBUTE, "text"];
const IMAGE_FIELDS: &[&str] = &[TYPE_ATTRIBUTE, "image"];
const TOOL_CALL_FIELDS: &[&str] = &[TYPE_ATTRIBUTE, "toolCallId", "toolName", "toolArguments"];

/// The kinds of tag the compiler understands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TagKind {
    Message(Option<MessageRole>),
    Content(Option<ContentType>),
    ToolCall,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ContentType {
    Text,
    Image,
}

impl TagKind {
    fn of(name: &str) -> Option<Self> {
        match name {
            MESSAGE_TAG => Some(Self::Message(None)),
            CONTENT_TAG => Some(Self::Content(None)),
            CONTENT_TEXT_TAG => Some(Self::Content(Some(ContentType::Text))),
            CONTENT_IMAGE_TAG => Some(Self::Content(Some(ContentType::Image))),
            TOOL_CALL_TAG => Some(Self::ToolCall),
            other => MessageRole::parse(other).map(|role| Self::Message(Some(role))),
        }
    }
}

#[derive(Debug)]
struct OpenMessage {
    message: Message,
    /// Opened by loose content rather than a message tag.
    implicit: bool,
}

#[derive(Debug, Default)]
struct Compiler {
    messages: Vec<Message>,
    current: Option<OpenMessage>,
    /// Text waiting to become a [`TextContent`] of the current message.
    pending: String,
    /// Body text of the content tag being rendered, if any.
    content: Option<String>,
    config: Option<Value>,
}

impl Compiler {
    fn finish(mut self) -> Conversation {
        self.close_message();
        Conversation {
            messages: self.messages,
            config: self.config,
        }
    }

    // --- Messages ---

    fn open_message(&mut self, message: Message, implicit: bool) {
        tracing::trace!(role = %message.role, implicit, "opening message");
        self.current = Some(OpenMessage { message, implicit });
    }

    fn ensure_message(&mut self) {
        if self.current.is_none() {
            self.open_message(Message::new(MessageRole::System), true);
        }
    }

    /// Moves pending text into the current message. Whitespace-only text is
    /// dropped.
    fn flush_text(&mut self) {
        let text = std::mem::take(&mut self.pending);
        if text.trim().is_empty() {
            return;
        }
        self.ensure_message();
        if let Some(open) = self.current.as_mut() {
            open.message.content.push(ContentPart::Text(TextContent {
                text,
                extra: ExtraAttributes::new(),
            }));
        }
    }

    fn close_message(&mut self) {
        self.flush_text();
        if let Some(open) = self.current.take() {
            tracing::trace!(
                role = %open.message.role,
                parts = open.message.content.len(),
                "closing message"
            );
            self.messages.push(open.message);
        }
    }

    fn push_part(&mut self, part: ContentPart) {
        self.flush_text();
        self.ensure_message();
        if let Some(open) = self.current.as_mut() {
            open.message.content.push(part);
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(buffer) = self.content.as_mut() {
            buffer.push_str(text);
            return;
        }
        if self.current.is_none() && text.trim().is_empty() {
            return;
        }
        self.ensure_message();
        self.pending.push_str(text);
    }

    // --- Tree walk ---

    fn render_nodes(&mut self, nodes: &[TemplateNode], scope: &Scope<'_>) -> PromptlateResult<()> {
        for node in nodes {
            self.render_node(node, scope)?;
        }
        Ok(())
    }

    fn render_node(&mut self, node: &TemplateNode, scope: &Scope<'_>) -> PromptlateResult<()> {
        match node {
            TemplateNode::Text(text) => {
                self.push_text(&text.data);
                Ok(())
            }
            TemplateNode::MustacheTag(tag) => {
                let value = evaluate(&tag.expression, scope, tag.span.start)?;
                self.push_text(&stringify(&value));
                Ok(())
            }
            TemplateNode::Comment(_) => Ok(()),
            TemplateNode::Config(config) => {
                self.config = Some(config.value.clone());
                Ok(())
            }
            TemplateNode::IfBlock(block) => self.render_if(block, scope),
            TemplateNode::ForBlock(block) => self.render_for(block, scope),
            TemplateNode::ElementTag(tag) => self.render_element(tag, scope),
        }
    }

    fn render_if(&mut self, block: &IfBlock, scope: &Scope<'_>) -> PromptlateResult<()> {
        let condition = evaluate(&block.expression, scope, block.span.start)?;
        if is_truthy(&condition) {
            self.render_nodes(&block.children, scope)
        } else if let Some(else_block) = &block.else_block {
            self.render_nodes(&else_block.children, scope)
        } else {
            Ok(())
        }
    }

    fn render_for(&mut self, block: &ForBlock, scope: &Scope<'_>) -> PromptlateResult<()> {
        let items = match evaluate(&block.expression, scope, block.span.start)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other @ (Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Object(_)) => {
                return Err(PromptlateError::new(
                    ErrorCode::InvalidIterable,
                    format!("Cannot iterate over {}", stringify(&other)),
                    block.span.start,
                ));
            }
        };

        if items.is_empty() {
            if let Some(else_block) = &block.else_block {
                return self.render_nodes(&else_block.children, scope);
            }
            return Ok(());
        }

        for (i, item) in items.into_iter().enumerate() {
            let item_scope = scope.bind(&block.context.name, item);
            match &block.index {
                Some(index) => {
                    let index_scope = item_scope.bind(&index.name, Value::from(i));
                    self.render_nodes(&block.children, &index_scope)?;
                }
                None => self.render_nodes(&block.children, &item_scope)?,
            }
        }
        Ok(())
    }

    // --- Tags ---

    fn render_element(&mut self, tag: &ElementTag, scope: &Scope<'_>) -> PromptlateResult<()> {
        match TagKind::of(&tag.name) {
            Some(TagKind::Message(role)) => self.render_message(tag, role, scope),
            Some(TagKind::Content(content_type)) => self.render_content(tag, content_type, scope),
            Some(TagKind::ToolCall) => self.render_tool_call(tag, scope),
            None => Err(PromptlateError::new(
                ErrorCode::UnknownTag,
                format!("Unknown tag <{}>", tag.name),
                tag.span.start,
            )),
        }
    }

    fn render_message(
        &mut self,
        tag: &ElementTag,
        role: Option<MessageRole>,
        scope: &Scope<'_>,
    ) -> PromptlateResult<()> {
        let nested = self.content.is_some() || self.current.as_ref().is_some_and(|open| !open.implicit);
        if nested {
            return Err(PromptlateError::new(
                ErrorCode::MessageTagInsideMessage,
                format!("<{}> cannot be placed inside another message", tag.name),
                tag.span.start,
            ));
        }

        let role = match role {
            Some(role) => {
                if let Some(attribute) = tag.attribute(ROLE_ATTRIBUTE) {
                    let name = string_value(attribute, scope)?;
                    if MessageRole::parse(&name) != Some(role) {
                        return Err(PromptlateError::new(
                            ErrorCode::InvalidMessageRole,
                            format!("Role '{}' conflicts with <{}>", name, tag.name),
                            attribute.span.start,
                        ));
                    }
                }
                role
            }
            None => {
                let attribute = required_attribute(tag, ROLE_ATTRIBUTE)?;
                let name = string_value(attribute, scope)?;
                MessageRole::parse(&name).ok_or_else(|| {
                    PromptlateError::new(
                        ErrorCode::InvalidMessageRole,
                        format!(
                            "Invalid message role '{}', expected one of: system, user, assistant, tool",
                            name
                        ),
                        attribute.span.start,
                    )
                })?
            }
        };

        let mut message = Message::new(role);
        message.extra = extra_attributes(tag, &[ROLE_ATTRIBUTE], MESSAGE_FIELDS, scope)?;

        self.close_message();
        self.open_message(message, false);
        self.render_nodes(&tag.children, scope)?;
        self.close_message();
        Ok(())
    }

    fn render_content(
        &mut self,
        tag: &ElementTag,
        content_type: Option<ContentType>,
        scope: &Scope<'_>,
    ) -> PromptlateResult<()> {
        self.reject_nested_content(tag)?;

        let (content_type, consumed) = match content_type {
            Some(content_type) => (content_type, NO_ATTRIBUTES),
            None => {
                let attribute = required_attribute(tag, TYPE_ATTRIBUTE)?;
                let content_type = match string_value(attribute, scope)?.as_str() {
                    "text" => ContentType::Text,
                    "image" => ContentType::Image,
                    other => {
                        return Err(PromptlateError::new(
                            ErrorCode::InvalidContentType,
                            format!("Invalid content type '{}', expected 'text' or 'image'", other),
                            attribute.span.start,
                        ));
                    }
                };
                (content_type, TYPE_ONLY)
            }
        };
        let reserved = match content_type {
            ContentType::Text => TEXT_FIELDS,
            ContentType::Image => IMAGE_FIELDS,
        };
        let extra = extra_attributes(tag, consumed, reserved, scope)?;
        let body = self.render_body(tag, scope)?;

        let part = match content_type {
            ContentType::Text => ContentPart::Text(TextContent { text: body, extra }),
            ContentType::Image => ContentPart::Image(ImageContent {
                image: body.trim().to_string(),
                extra,
            }),
        };
        self.push_part(part);
        Ok(())
    }

    fn render_tool_call(&mut self, tag: &ElementTag, scope: &Scope<'_>) -> PromptlateResult<()> {
        self.reject_nested_content(tag)?;

        let in_assistant = self
            .current
            .as_ref()
            .is_some_and(|open| open.message.role == MessageRole::Assistant);
        if !in_assistant {
            return Err(PromptlateError::new(
                ErrorCode::InvalidToolCallPlacement,
                "Tool calls can only be placed inside assistant messages",
                tag.span.start,
            ));
        }

        let tool_call_id = string_value(required_attribute(tag, ID_ATTRIBUTE)?, scope)?;
        let tool_name = string_value(required_attribute(tag, NAME_ATTRIBUTE)?, scope)?;
        let extra = extra_attributes(
            tag,
            &[ID_ATTRIBUTE, NAME_ATTRIBUTE, ARGUMENTS_ATTRIBUTE],
            TOOL_CALL_FIELDS,
            scope,
        )?;
        let body = self.render_body(tag, scope)?;

        let tool_arguments = match tag.attribute(ARGUMENTS_ATTRIBUTE) {
            Some(attribute) => {
                tool_arguments(attribute_value(attribute, scope)?, attribute.span.start)?
            }
            None if body.trim().is_empty() => Map::new(),
            None => tool_arguments(Value::String(body), tag.span.start)?,
        };

        self.push_part(ContentPart::ToolCall(ToolCallContent {
            tool_call_id,
            tool_name,
            tool_arguments,
            extra,
        }));
        Ok(())
    }

    fn reject_nested_content(&self, tag: &ElementTag) -> PromptlateResult<()> {
        if self.content.is_some() {
            return Err(PromptlateError::new(
                ErrorCode::ContentTagInsideContent,
                format!("<{}> cannot be placed inside another content tag", tag.name),
                tag.span.start,
            ));
        }
        Ok(())
    }

    /// Renders a content tag's children into a string.
    fn render_body(&mut self, tag: &ElementTag, scope: &Scope<'_>) -> PromptlateResult<String> {
        self.content = Some(String::new());
        let result = self.render_nodes(&tag.children, scope);
        let body = self.content.take().unwrap_or_default();
        result.map(|()| body)
    }
}

fn required_attribute<'t>(tag: &'t ElementTag, name: &str) -> PromptlateResult<&'t Attribute> {
    tag.attribute(name).ok_or_else(|| {
        PromptlateError::new(
            ErrorCode::MissingAttribute,
            format!("<{}> requires a '{}' attribute", tag.name, name),
            tag.span.start,
        )
    })
}

fn attribute_value(attribute: &Attribute, scope: &Scope<'_>) -> PromptlateResult<Value> {
    match &attribute.value {
        AttributeValue::True => Ok(Value::Bool(true)),
        AttributeValue::Expression(expression) => evaluate(expression, scope, attribute.span.start),
        AttributeValue::Nodes(nodes) => {
            let mut text = String::new();
            for node in nodes {
                match node {
                    TemplateNode::Text(t) => text.push_str(&t.data),
                    TemplateNode::MustacheTag(tag) => {
                        text.push_str(&stringify(&evaluate(&tag.expression, scope, tag.span.start)?));
                    }
                    TemplateNode::Comment(_)
                    | TemplateNode::Config(_)
                    | TemplateNode::ElementTag(_)
                    | TemplateNode::IfBlock(_)
                    | TemplateNode::ForBlock(_) => {}
                }
            }
            Ok(Value::String(text))
        }
    }
}

fn string_value(attribute: &Attribute, scope: &Scope<'_>) -> PromptlateResult<String> {
    attribute_value(attribute, scope).map(|value| stringify(&value))
}

/// Evaluates every attribute not in `consumed`, in source order.
///
/// Names in `reserved` belong to the output object and are rejected.
fn extra_attributes(
    tag: &ElementTag,
    consumed: &[&str],
    reserved: &[&str],
    scope: &Scope<'_>,
) -> PromptlateResult<ExtraAttributes> {
    let mut extra = ExtraAttributes::new();
    for attribute in &tag.attributes {
        let name = attribute.name.as_str();
        if consumed.contains(&name) {
            continue;
        }
        if reserved.contains(&name) {
            return Err(PromptlateError::new(
                ErrorCode::InvalidAttribute,
                format!("Attribute '{}' is reserved on <{}>", name, tag.name),
                attribute.span.start,
            ));
        }
        extra.insert(attribute.name.clone(), attribute_value(attribute, scope)?);
    }
    Ok(extra)
}

fn tool_arguments(value: Value, position: Position) -> PromptlateResult<Map<String, Value>> {
    let invalid = |detail: String| {
        PromptlateError::new(
            ErrorCode::InvalidToolCallArguments,
            format!("Tool call arguments must be a JSON object: {}", detail),
            position,
        )
    };
    match value {
        Value::Object(arguments) => Ok(arguments),
        Value::String(source) => match serde_json::from_str::<Value>(source.trim()) {
            Ok(Value::Object(arguments)) => Ok(arguments),
            Ok(other) => Err(invalid(format!("found {}", other))),
            Err(e) => Err(invalid(e.to_string())),
        },
        other @ (Value::Null | Value::Bool(_) | Value::Number(_) | Value::Array(_)) => {
            Err(invalid(format!("found {}", other)))
        }
    }
}

/// Renders `fragment` against `parameters`.
pub(crate) fn compile(fragment: &Fragment, parameters: &Parameters) -> PromptlateResult<Conversation> {
    tracing::debug!(parameters = parameters.len(), "rendering fragment");
    let scope = Scope::new(parameters);
    let mut compiler = Compiler::default();
    compiler.render_nodes(&fragment.children, &scope)?;
    let conversation = compiler.finish();
    tracing::debug!(messages = conversation.messages.len(), "rendered conversation");
    Ok(conversation)
}
