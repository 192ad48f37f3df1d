//! A parser and compiler for prompt templates.
//!
//! A prompt mixes literal text, message and content tags, and `{{ }}`
//! expressions with `if`/`for` control flow. Rendering it against a set of
//! parameters produces a [`Conversation`]: the role-tagged messages a model
//! provider expects.
//!
//! ```rust
//! use promptlate::{Parameters, render};
//!
//! let prompt = "<system>You are terse.</system>\n<user>{{ question }}</user>";
//! let mut parameters = Parameters::new();
//! parameters.insert("question", "What is Rust?");
//!
//! let conversation = pollster::block_on(render(prompt, &parameters)).unwrap();
//! assert_eq!(conversation.messages.len(), 2);
//! ```

mod ast;
mod compiler;
mod conversation;
mod error;
mod expression;
mod params;
mod parser;
mod scanner;
mod template;
mod value;

// Public exports.
pub use ast::{
    Attribute, AttributeValue, BinaryOperator, Comment, Config, ElementTag, ElseBlock, Expression,
    ForBlock, Fragment, Identifier, IfBlock, MustacheTag, TemplateNode, Text, UnaryOperator,
};
pub use conversation::{
    ContentPart, Conversation, ExtraAttributes, ImageContent, Message, MessageRole, TextContent,
    ToolCallContent,
};
pub use error::{ErrorCode, Position, PromptlateError, PromptlateResult, Span};
pub use params::Parameters;
pub use parser::ParseConfig;
pub use template::Template;

/// Parses `source` into a [`Fragment`] without rendering it.
///
/// # Errors
///
/// Returns the first syntax error; no partial tree is produced.
pub fn parse(source: &str, config: &ParseConfig) -> PromptlateResult<Fragment> {
    tracing::debug!(len = source.len(), "parsing template");
    parser::parse(source, config)
}

/// Parses and renders a prompt in one step.
///
/// # Errors
///
/// Returns the first syntax or semantic error.
#[allow(
    clippy::unused_async,
    reason = "Rendering is async so that future content resolution can suspend."
)]
pub async fn render(prompt: &str, parameters: &Parameters) -> PromptlateResult<Conversation> {
    let fragment = parse(prompt, &ParseConfig::default())?;
    compiler::compile(&fragment, parameters)
}

/// Renders an already parsed [`Fragment`].
///
/// # Errors
///
/// Returns the first semantic error; no partial conversation is produced.
#[allow(
    clippy::unused_async,
    reason = "Rendering is async so that future content resolution can suspend."
)]
pub async fn render_fragment(
    fragment: &Fragment,
    parameters: &Parameters,
) -> PromptlateResult<Conversation> {
    compiler::compile(fragment, parameters)
}
