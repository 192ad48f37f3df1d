use serde::Serialize;
use serde_json::Value;

use crate::error::Span;

/// The root of a parsed prompt.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Fragment {
    pub children: Vec<TemplateNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum TemplateNode {
    /// A literal run of text, with all escapes processed.
    Text(Text),
    /// A block (`/* */`) or tag-style (`<!-- -->`) comment.
    Comment(Comment),
    /// A YAML frontmatter block. Only ever the first child of a fragment.
    Config(Config),
    ElementTag(ElementTag),
    /// A bare `{{ expression }}`.
    MustacheTag(MustacheTag),
    IfBlock(IfBlock),
    ForBlock(ForBlock),
}

impl TemplateNode {
    pub const fn span(&self) -> Span {
        match self {
            Self::Text(node) => node.span,
            Self::Comment(node) => node.span,
            Self::Config(node) => node.span,
            Self::ElementTag(node) => node.span,
            Self::MustacheTag(node) => node.span,
            Self::IfBlock(node) => node.span,
            Self::ForBlock(node) => node.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Text {
    pub data: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comment {
    /// Content between the comment delimiters.
    pub data: String,
    /// The full source span, delimiters included.
    pub raw: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub raw: String,
    pub value: Value,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementTag {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<TemplateNode>,
    pub self_closing: bool,
    pub span: Span,
}

impl ElementTag {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// The attribute was written without `=value`.
    True,
    /// `name={{ expr }}` or `name="{{ expr }}"`.
    Expression(Expression),
    /// Mixed literal and interpolated content. Holds only `Text` and
    /// `MustacheTag` nodes.
    Nodes(Vec<TemplateNode>),
}

/// Serialised as `true`, the expression, or the node list.
impl Serialize for AttributeValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::True => serializer.serialize_bool(true),
            Self::Expression(expression) => expression.serialize(serializer),
            Self::Nodes(nodes) => nodes.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MustacheTag {
    pub expression: Expression,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IfBlock {
    pub expression: Expression,
    pub children: Vec<TemplateNode>,
    #[serde(rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_block: Option<ElseBlock>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForBlock {
    /// The collection being iterated.
    pub expression: Expression,
    /// Binding for the current element.
    pub context: Identifier,
    pub index: Option<Identifier>,
    pub children: Vec<TemplateNode>,
    #[serde(rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_block: Option<ElseBlock>,
    pub span: Span,
}

/// The alternative branch of an `if` or `for`.
///
/// An `else if` chain is an `ElseBlock` whose only child is another `IfBlock`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElseBlock {
    pub children: Vec<TemplateNode>,
    pub span: Span,
}

impl ElseBlock {
    /// The chained `IfBlock`, if this branch is an `else if`.
    pub fn chained_if(&self) -> Option<&IfBlock> {
        match self.children.as_slice() {
            [TemplateNode::IfBlock(block)] => Some(block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identifier {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Expression {
    Identifier(Identifier),
    Literal {
        value: Value,
    },
    BinaryExpression {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    UnaryExpression {
        operator: UnaryOperator,
        argument: Box<Expression>,
    },
    /// `object.property`, `object?.property` or `object[property]`.
    MemberExpression {
        object: Box<Expression>,
        property: Box<Expression>,
        computed: bool,
        optional: bool,
    },
    ConditionalExpression {
        test: Box<Expression>,
        consequent: Box<Expression>,
        alternate: Box<Expression>,
    },
    ArrayExpression {
        elements: Vec<Expression>,
    },
    ObjectExpression {
        properties: Vec<(String, Expression)>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOperator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "===")]
    StrictEqual,
    #[serde(rename = "!==")]
    StrictNotEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
    #[serde(rename = "/")]
    Divide,
    #[serde(rename = "%")]
    Remainder,
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
    #[serde(rename = "??")]
    NullishCoalescing,
}

impl BinaryOperator {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::StrictEqual => "===",
            Self::StrictNotEqual => "!==",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Remainder => "%",
            Self::And => "&&",
            Self::Or => "||",
            Self::NullishCoalescing => "??",
        }
    }
}

impl std::fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum UnaryOperator {
    #[serde(rename = "!")]
    Not,
    #[serde(rename = "-")]
    Minus,
    #[serde(rename = "+")]
    Plus,
}

impl UnaryOperator {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Not => "!",
            Self::Minus => "-",
            Self::Plus => "+",
        }
    }
}

impl std::fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
