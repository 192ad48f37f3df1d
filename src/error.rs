pub type PromptlateResult<T> = std::result::Result<T, PromptlateError>;

/// The closed set of failure codes a parse or render can produce.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    // Syntax.
    UnclosedBlock,
    UnexpectedEof,
    UnexpectedTagClose,
    UnexpectedBlockClose,
    DuplicateAttribute,
    InvalidElsePlacement,
    InvalidExpression,
    InvalidAttribute,
    InvalidConfig,
    NestingTooDeep,
    // Semantics.
    ContentTagInsideContent,
    InvalidToolCallPlacement,
    MessageTagInsideMessage,
    InvalidMessageRole,
    UnknownTag,
    InvalidContentType,
    MissingAttribute,
    InvalidToolCallArguments,
    VariableNotDeclared,
    InvalidIterable,
    UnsupportedOperation,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnclosedBlock => "unclosed-block",
            Self::UnexpectedEof => "unexpected-eof",
            Self::UnexpectedTagClose => "unexpected-tag-close",
            Self::UnexpectedBlockClose => "unexpected-block-close",
            Self::DuplicateAttribute => "duplicate-attribute",
            Self::InvalidElsePlacement => "invalid-else-placement",
            Self::InvalidExpression => "invalid-expression",
            Self::InvalidAttribute => "invalid-attribute",
            Self::InvalidConfig => "invalid-config",
            Self::NestingTooDeep => "nesting-too-deep",
            Self::ContentTagInsideContent => "content-tag-inside-content",
            Self::InvalidToolCallPlacement => "invalid-tool-call-placement",
            Self::MessageTagInsideMessage => "message-tag-inside-message",
            Self::InvalidMessageRole => "invalid-message-role",
            Self::UnknownTag => "unknown-tag",
            Self::InvalidContentType => "invalid-content-type",
            Self::MissingAttribute => "missing-attribute",
            Self::InvalidToolCallArguments => "invalid-tool-call-arguments",
            Self::VariableNotDeclared => "variable-not-declared",
            Self::InvalidIterable => "invalid-iterable",
            Self::UnsupportedOperation => "unsupported-operation",
        }
    }

    /// Whether this code reports a fault in the template source itself.
    ///
    /// `invalid-attribute` is also raised while rendering, for attribute
    /// names that collide with a fixed output field.
    pub const fn is_syntax(self) -> bool {
        matches!(
            self,
            Self::UnclosedBlock
                | Self::UnexpectedEof
                | Self::UnexpectedTagClose
                | Self::UnexpectedBlockClose
                | Self::DuplicateAttribute
                | Self::InvalidElsePlacement
                | Self::InvalidExpression
                | Self::InvalidAttribute
                | Self::InvalidConfig
                | Self::NestingTooDeep
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A location in the template source.
///
/// `offset` is a byte offset; `line` and `column` are 1-indexed, with the
/// column counted in bytes from the start of the line.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize,
)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn start() -> Self {
        Self {
            offset: 0,
            line: 1,
            column: 1,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Source range of a node, `start` inclusive and `end` exclusive.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize,
)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PromptlateError {
    pub code: ErrorCode,
    pub message: String,
    pub position: Position,
}

impl PromptlateError {
    pub fn new<M: Into<String>>(code: ErrorCode, message: M, position: Position) -> Self {
        Self {
            code,
            message: message.into(),
            position,
        }
    }

    pub(crate) fn unexpected_eof(expected: Option<&str>, position: Position) -> Self {
        Self::new(
            ErrorCode::UnexpectedEof,
            expected.map_or_else(
                || "Unexpected end of input".to_string(),
                |e| format!("Unexpected end of input (expected '{}')", e),
            ),
            position,
        )
    }
}

impl std::fmt::Display for PromptlateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = if self.code.is_syntax() {
            "Parse"
        } else {
            "Render"
        };
        write!(
            f,
            "{} error [{}] at {}: {}",
            stage, self.code, self.position, self.message
        )
    }
}

impl std::error::Error for PromptlateError {}
