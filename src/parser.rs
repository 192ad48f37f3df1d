use serde_json::Value;

use crate::{
    ast::{
        Attribute, AttributeValue, Comment, Config, ElementTag, ElseBlock, Expression, ForBlock,
        Fragment, Identifier, IfBlock, MustacheTag, TemplateNode, Text,
    },
    error::{ErrorCode, Position, PromptlateError, PromptlateResult, Span},
    expression::{Statement, parse_expression, parse_statement},
    scanner::{
        BLOCK_COMMENT_CLOSE, BLOCK_COMMENT_OPEN, Event, Scanner, TAG_COMMENT_CLOSE,
        TAG_COMMENT_OPEN,
    },
};

type ParseResult<T> = PromptlateResult<T>;

const FRONTMATTER_FENCE: &str = "---";

/// How deeply elements and blocks (including `else if` links) may nest.
const MAX_NESTING_DEPTH: usize = 64;

/// Options accepted by [`parse`](crate::parse).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParseConfig {
    /// Opening and closing expression delimiters.
    pub tag_delimiters: (String, String),
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            tag_delimiters: ("{{".to_string(), "}}".to_string()),
        }
    }
}

impl ParseConfig {
    pub fn with_delimiters<O: Into<String>, C: Into<String>>(open: O, close: C) -> Self {
        Self {
            tag_delimiters: (open.into(), close.into()),
        }
    }

    fn validate(&self) -> ParseResult<()> {
        let (open, close) = &self.tag_delimiters;
        if open.trim().is_empty() || close.trim().is_empty() || open == close {
            return Err(PromptlateError::new(
                ErrorCode::InvalidConfig,
                format!(
                    "Invalid tag delimiters '{}' and '{}': both must be non-blank and distinct",
                    open, close
                ),
                Position::start(),
            ));
        }
        Ok(())
    }
}

/// Whatever ended a run of sibling nodes.
#[derive(Debug)]
enum Closer {
    Eof(Position),
    CloseTag { name: String, position: Position },
    Else(Position),
    ElseIf(Expression, Position),
    EndIf(Position),
    EndFor(Position),
}

impl Closer {
    const fn position(&self) -> Position {
        match self {
            Self::Eof(position)
            | Self::CloseTag { position, .. }
            | Self::Else(position)
            | Self::ElseIf(_, position)
            | Self::EndIf(position)
            | Self::EndFor(position) => *position,
        }
    }
}

/// The construct whose children are being parsed.
#[derive(Debug, Clone, Copy)]
enum Open<'n> {
    Root,
    Element(&'n str),
    If,
    For,
}

impl Open<'_> {
    fn describe(self) -> String {
        match self {
            Self::Root => "template".to_string(),
            Self::Element(name) => format!("<{}>", name),
            Self::If => "'if' block".to_string(),
            Self::For => "'for' block".to_string(),
        }
    }
}

struct Parser<'a> {
    scanner: Scanner<'a>,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, config: &'a ParseConfig) -> Self {
        let (open, close) = &config.tag_delimiters;
        Parser {
            scanner: Scanner::new(input, open, close),
            depth: 0,
        }
    }

    #[inline]
    fn make_error<M: Into<String>>(&self, code: ErrorCode, message: M) -> PromptlateError {
        PromptlateError::new(code, message, self.scanner.position())
    }

    fn span_from(&self, start: Position) -> Span {
        Span::new(start, self.scanner.position())
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T, F>(&mut self, start: Position, parse: F) -> ParseResult<T>
    where
        F: FnOnce(&mut Self) -> ParseResult<T>,
    {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(PromptlateError::new(
                ErrorCode::NestingTooDeep,
                format!("Nesting exceeds the maximum depth of {}", MAX_NESTING_DEPTH),
                start,
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Builds the error for a closer that does not belong to `open`.
    fn unmatched(closer: Closer, open: Open<'_>) -> PromptlateError {
        let position = closer.position();
        match closer {
            Closer::Eof(_) => match open {
                Open::Root => PromptlateError::unexpected_eof(None, position),
                Open::Element(_) | Open::If | Open::For => PromptlateError::new(
                    ErrorCode::UnclosedBlock,
                    format!("Unclosed {}", open.describe()),
                    position,
                ),
            },
            Closer::CloseTag { name, .. } => PromptlateError::new(
                ErrorCode::UnexpectedTagClose,
                format!("Unexpected closing tag </{}> inside {}", name, open.describe()),
                position,
            ),
            Closer::Else(_) | Closer::ElseIf(..) => PromptlateError::new(
                ErrorCode::InvalidElsePlacement,
                format!("'else' is not allowed directly inside {}", open.describe()),
                position,
            ),
            Closer::EndIf(_) => PromptlateError::new(
                ErrorCode::UnexpectedBlockClose,
                format!("Unexpected 'endif' inside {}", open.describe()),
                position,
            ),
            Closer::EndFor(_) => PromptlateError::new(
                ErrorCode::UnexpectedBlockClose,
                format!("Unexpected 'endfor' inside {}", open.describe()),
                position,
            ),
        }
    }

    // --- Frontmatter ---

    /// Parses a leading `---` YAML block, if the template has one.
    ///
    /// A fence with no closing line, or one around something other than a
    /// mapping, is a markdown rule: the scanner is left untouched and the
    /// input parses as text.
    fn parse_frontmatter(&mut self) -> ParseResult<Option<TemplateNode>> {
        let mut lookahead = self.scanner.clone();
        lookahead.consume_whitespace();
        let start = lookahead.position();
        if !lookahead.consume(FRONTMATTER_FENCE) {
            return Ok(None);
        }
        lookahead.consume("\r");
        if !lookahead.consume("\n") {
            return Ok(None);
        }
        let body_start = lookahead.position().offset;

        while !lookahead.eof() {
            let at_line_start = lookahead.position().column == 1;
            if at_line_start && lookahead.peek(FRONTMATTER_FENCE) {
                let body = lookahead.slice(body_start, lookahead.position().offset);
                let mut after = lookahead.clone();
                after.consume(FRONTMATTER_FENCE);
                after.consume("\r");
                if after.eof() || after.consume("\n") {
                    let Some(value) = parse_config_body(body, start)? else {
                        tracing::debug!("leading fence is not frontmatter");
                        return Ok(None);
                    };
                    self.scanner = after;
                    let raw = self.scanner.slice(start.offset, self.scanner.position().offset);
                    return Ok(Some(TemplateNode::Config(Config {
                        raw: raw.to_string(),
                        value,
                        span: self.span_from(start),
                    })));
                }
            }
            lookahead.bump();
        }
        Ok(None)
    }

    // --- Children ---

    /// Parses sibling nodes until something that can close a construct.
    fn parse_nodes(&mut self) -> ParseResult<(Vec<TemplateNode>, Closer)> {
        let mut nodes = Vec::new();
        loop {
            let start = self.scanner.position();
            match self.scanner.peek_event() {
                Event::Eof => return Ok((nodes, Closer::Eof(start))),
                Event::Text => {
                    let data = self.scanner.scan_text();
                    nodes.push(TemplateNode::Text(Text {
                        data,
                        span: self.span_from(start),
                    }));
                }
                Event::BlockComment => {
                    nodes.push(self.parse_comment(BLOCK_COMMENT_OPEN, BLOCK_COMMENT_CLOSE)?);
                }
                Event::TagComment => {
                    nodes.push(self.parse_comment(TAG_COMMENT_OPEN, TAG_COMMENT_CLOSE)?);
                }
                Event::TagOpen => nodes.push(self.nested(start, Self::parse_element)?),
                Event::TagClose => {
                    let name = self.parse_closing_tag()?;
                    return Ok((
                        nodes,
                        Closer::CloseTag {
                            name,
                            position: start,
                        },
                    ));
                }
                Event::ExpressionOpen => {
                    let (open, _) = self.scanner.delimiters();
                    self.scanner.consume(open);
                    let (body, body_start) = self.scanner.scan_expression()?;
                    match parse_statement(&body, body_start)? {
                        Statement::Expression(expression) => {
                            nodes.push(TemplateNode::MustacheTag(MustacheTag {
                                expression,
                                span: self.span_from(start),
                            }));
                        }
                        Statement::If(expression) => {
                            let block = self.nested(start, |p| p.parse_if(expression, start))?;
                            nodes.push(TemplateNode::IfBlock(block));
                        }
                        Statement::For {
                            context,
                            index,
                            expression,
                        } => {
                            nodes.push(self.nested(start, |p| {
                                p.parse_for(context, index, expression, start)
                            })?);
                        }
                        Statement::Else => return Ok((nodes, Closer::Else(start))),
                        Statement::ElseIf(expression) => {
                            return Ok((nodes, Closer::ElseIf(expression, start)));
                        }
                        Statement::EndIf => return Ok((nodes, Closer::EndIf(start))),
                        Statement::EndFor => return Ok((nodes, Closer::EndFor(start))),
                    }
                }
            }
        }
    }

    fn parse_comment(&mut self, open: &str, close: &str) -> ParseResult<TemplateNode> {
        let start = self.scanner.position();
        let (data, raw) = self.scanner.scan_comment(open, close)?;
        Ok(TemplateNode::Comment(Comment {
            data,
            raw,
            span: self.span_from(start),
        }))
    }

    // --- Control Flow Parsing ---

    fn parse_if(&mut self, expression: Expression, start: Position) -> ParseResult<IfBlock> {
        let (children, closer) = self.parse_nodes()?;
        let else_block = match closer {
            Closer::EndIf(_) => None,
            Closer::Else(else_start) => {
                let (else_children, closer) = self.parse_nodes()?;
                match closer {
                    Closer::EndIf(_) => {}
                    Closer::Else(position) | Closer::ElseIf(_, position) => {
                        return Err(PromptlateError::new(
                            ErrorCode::InvalidElsePlacement,
                            "An 'if' block cannot have more than one 'else'",
                            position,
                        ));
                    }
                    other @ (Closer::Eof(_) | Closer::CloseTag { .. } | Closer::EndFor(_)) => {
                        return Err(Self::unmatched(other, Open::If));
                    }
                }
                Some(ElseBlock {
                    children: else_children,
                    span: self.span_from(else_start),
                })
            }
            Closer::ElseIf(expression, else_start) => {
                let chained = self.nested(else_start, |p| p.parse_if(expression, else_start))?;
                Some(ElseBlock {
                    children: vec![TemplateNode::IfBlock(chained)],
                    span: self.span_from(else_start),
                })
            }
            other @ (Closer::Eof(_) | Closer::CloseTag { .. } | Closer::EndFor(_)) => {
                return Err(Self::unmatched(other, Open::If));
            }
        };

        Ok(IfBlock {
            expression,
            children,
            else_block,
            span: self.span_from(start),
        })
    }

    fn parse_for(
        &mut self,
        context: Identifier,
        index: Option<Identifier>,
        expression: Expression,
        start: Position,
    ) -> ParseResult<TemplateNode> {
        let (children, closer) = self.parse_nodes()?;
        let else_block = match closer {
            Closer::EndFor(_) => None,
            Closer::Else(else_start) => {
                let (else_children, closer) = self.parse_nodes()?;
                match closer {
                    Closer::EndFor(_) => {}
                    Closer::Else(position) | Closer::ElseIf(_, position) => {
                        return Err(PromptlateError::new(
                            ErrorCode::InvalidElsePlacement,
                            "A 'for' block cannot have more than one 'else'",
                            position,
                        ));
                    }
                    other @ (Closer::Eof(_) | Closer::CloseTag { .. } | Closer::EndIf(_)) => {
                        return Err(Self::unmatched(other, Open::For));
                    }
                }
                Some(ElseBlock {
                    children: else_children,
                    span: self.span_from(else_start),
                })
            }
            Closer::ElseIf(_, position) => {
                return Err(PromptlateError::new(
                    ErrorCode::InvalidElsePlacement,
                    "'else if' is not allowed in a 'for' block",
                    position,
                ));
            }
            other @ (Closer::Eof(_) | Closer::CloseTag { .. } | Closer::EndIf(_)) => {
                return Err(Self::unmatched(other, Open::For));
            }
        };

        Ok(TemplateNode::ForBlock(ForBlock {
            expression,
            context,
            index,
            children,
            else_block,
            span: self.span_from(start),
        }))
    }

    // --- Tags ---

    fn parse_element(&mut self) -> ParseResult<TemplateNode> {
        let start = self.scanner.position();
        self.scanner.consume("<");
        let name = self
            .scanner
            .scan_name()
            .ok_or_else(|| self.make_error(ErrorCode::InvalidAttribute, "Expected tag name"))?
            .to_string();

        let mut attributes: Vec<Attribute> = Vec::new();
        let self_closing = loop {
            self.scanner.consume_whitespace();
            if self.scanner.eof() {
                return Err(PromptlateError::unexpected_eof(
                    Some(">"),
                    self.scanner.position(),
                ));
            }
            if self.scanner.consume("/>") {
                break true;
            }
            if self.scanner.consume(">") {
                break false;
            }
            let attribute = self.parse_attribute()?;
            if attributes.iter().any(|a| a.name == attribute.name) {
                return Err(PromptlateError::new(
                    ErrorCode::DuplicateAttribute,
                    format!(
                        "Attribute '{}' is already defined on <{}>",
                        attribute.name, name
                    ),
                    attribute.span.start,
                ));
            }
            attributes.push(attribute);
        };

        let children = if self_closing {
            Vec::new()
        } else {
            let (children, closer) = self.parse_nodes()?;
            match closer {
                Closer::CloseTag {
                    name: ref closing, ..
                } if *closing == name => children,
                other => return Err(Self::unmatched(other, Open::Element(&name))),
            }
        };

        Ok(TemplateNode::ElementTag(ElementTag {
            name,
            attributes,
            children,
            self_closing,
            span: self.span_from(start),
        }))
    }

    /// Consumes `</name>` and returns the name.
    fn parse_closing_tag(&mut self) -> ParseResult<String> {
        self.scanner.consume("</");
        let name = self
            .scanner
            .scan_name()
            .ok_or_else(|| self.make_error(ErrorCode::InvalidAttribute, "Expected tag name"))?
            .to_string();
        self.scanner.consume_whitespace();
        if self.scanner.eof() {
            return Err(PromptlateError::unexpected_eof(
                Some(">"),
                self.scanner.position(),
            ));
        }
        if !self.scanner.consume(">") {
            return Err(self.make_error(
                ErrorCode::InvalidAttribute,
                format!("Closing tag </{}> cannot have attributes", name),
            ));
        }
        Ok(name)
    }

    fn parse_attribute(&mut self) -> ParseResult<Attribute> {
        let start = self.scanner.position();
        let name = match self.scanner.scan_name() {
            Some(name) => name.to_string(),
            None => {
                let found = self.scanner.current_char().unwrap_or_default();
                return Err(self.make_error(
                    ErrorCode::InvalidAttribute,
                    format!("Expected attribute name, found '{}'", found),
                ));
            }
        };

        let mut lookahead = self.scanner.clone();
        lookahead.consume_whitespace();
        let value = if lookahead.consume("=") {
            lookahead.consume_whitespace();
            self.scanner = lookahead;
            self.parse_attribute_value()?
        } else {
            AttributeValue::True
        };

        Ok(Attribute {
            name,
            value,
            span: self.span_from(start),
        })
    }

    fn parse_attribute_value(&mut self) -> ParseResult<AttributeValue> {
        let (open, _) = self.scanner.delimiters();
        if self.scanner.peek(open) {
            self.scanner.consume(open);
            let (body, body_start) = self.scanner.scan_expression()?;
            return parse_expression(&body, body_start).map(AttributeValue::Expression);
        }

        match self.scanner.current_char() {
            Some(quote @ ('"' | '\'')) => self.parse_quoted_value(quote),
            Some(_) => {
                let start = self.scanner.position();
                let mut data = String::new();
                while let Some(c) = self.scanner.current_char() {
                    if c.is_whitespace() || c == '>' || self.scanner.peek("/>") {
                        break;
                    }
                    data.push(c);
                    self.scanner.bump();
                }
                if data.is_empty() {
                    return Err(self.make_error(ErrorCode::InvalidAttribute, "Expected attribute value"));
                }
                Ok(AttributeValue::Nodes(vec![TemplateNode::Text(Text {
                    data,
                    span: self.span_from(start),
                })]))
            }
            None => Err(PromptlateError::unexpected_eof(
                Some("attribute value"),
                self.scanner.position(),
            )),
        }
    }

    /// Parses `"literal {{ expr }} literal"`. A value that is exactly one
    /// interpolation is recorded as an expression.
    fn parse_quoted_value(&mut self, quote: char) -> ParseResult<AttributeValue> {
        let (open, _) = self.scanner.delimiters();
        self.scanner.bump();
        let mut nodes = Vec::new();
        let mut text = String::new();
        let mut text_start = self.scanner.position();

        loop {
            if self.scanner.eof() {
                return Err(PromptlateError::unexpected_eof(
                    Some(quote.to_string().as_str()),
                    self.scanner.position(),
                ));
            }
            if self.scanner.current_char() == Some(quote) {
                break;
            }
            if self.scanner.peek(open) {
                if !text.is_empty() {
                    nodes.push(TemplateNode::Text(Text {
                        data: std::mem::take(&mut text),
                        span: self.span_from(text_start),
                    }));
                }
                let start = self.scanner.position();
                self.scanner.consume(open);
                let (body, body_start) = self.scanner.scan_expression()?;
                let expression = parse_expression(&body, body_start)?;
                nodes.push(TemplateNode::MustacheTag(MustacheTag {
                    expression,
                    span: self.span_from(start),
                }));
                text_start = self.scanner.position();
                continue;
            }
            if self.scanner.current_char() == Some('\\') {
                let mut lookahead = self.scanner.clone();
                lookahead.bump();
                if lookahead.current_char() == Some(quote) || lookahead.peek(open) {
                    self.scanner = lookahead;
                    if self.scanner.current_char() == Some(quote) {
                        text.push(quote);
                        self.scanner.bump();
                    } else {
                        text.push_str(open);
                        self.scanner.consume(open);
                    }
                    continue;
                }
            }
            if let Some(c) = self.scanner.bump() {
                text.push(c);
            }
        }

        if !text.is_empty() {
            nodes.push(TemplateNode::Text(Text {
                data: text,
                span: self.span_from(text_start),
            }));
        }
        self.scanner.bump();

        match nodes.pop() {
            Some(TemplateNode::MustacheTag(tag)) if nodes.is_empty() => {
                Ok(AttributeValue::Expression(tag.expression))
            }
            Some(node) => {
                nodes.push(node);
                Ok(AttributeValue::Nodes(nodes))
            }
            None => Ok(AttributeValue::Nodes(nodes)),
        }
    }
}

/// Reads a frontmatter body. `None` means the YAML is not a mapping.
fn parse_config_body(body: &str, position: Position) -> ParseResult<Option<Value>> {
    let value: Value = serde_yaml::from_str(body).map_err(|e| {
        PromptlateError::new(
            ErrorCode::InvalidConfig,
            format!("Invalid frontmatter: {}", e),
            position,
        )
    })?;
    match value {
        Value::Null => Ok(Some(Value::Object(serde_json::Map::new()))),
        Value::Object(_) => Ok(Some(value)),
        Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Array(_) => Ok(None),
    }
}

/// Parses a template into its syntax tree.
pub(crate) fn parse(input: &str, config: &ParseConfig) -> PromptlateResult<Fragment> {
    config.validate()?;
    let mut parser = Parser::new(input, config);
    let mut children = Vec::new();
    if let Some(frontmatter) = parser.parse_frontmatter()? {
        children.push(frontmatter);
    }

    let (nodes, closer) = parser.parse_nodes()?;
    match closer {
        Closer::Eof(_) => {}
        other => return Err(Parser::unmatched(other, Open::Root)),
    }
    children.extend(nodes);

    tracing::debug!(nodes = children.len(), "parsed template");
    Ok(Fragment { children })
}

/// Tests for the parser module via `parse`.
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ast::BinaryOperator;

    fn parse_default(input: &str) -> PromptlateResult<Fragment> {
        parse(input, &ParseConfig::default())
    }

    fn error_code(input: &str) -> ErrorCode {
        match parse_default(input) {
            Ok(fragment) => panic!("Expected an error for {:?}, got {:?}", input, fragment),
            Err(err) => err.code,
        }
    }

    fn only_child(fragment: &Fragment) -> &TemplateNode {
        assert_eq!(fragment.children.len(), 1, "{:?}", fragment);
        &fragment.children[0]
    }

    fn element(node: &TemplateNode) -> &ElementTag {
        match node {
            TemplateNode::ElementTag(tag) => tag,
            other => panic!("Expected element, got {:?}", other),
        }
    }

    fn if_block(node: &TemplateNode) -> &IfBlock {
        match node {
            TemplateNode::IfBlock(block) => block,
            other => panic!("Expected if block, got {:?}", other),
        }
    }

    fn text(node: &TemplateNode) -> &str {
        match node {
            TemplateNode::Text(text) => &text.data,
            other => panic!("Expected text, got {:?}", other),
        }
    }

    fn ident(expression: &Expression) -> &str {
        match expression {
            Expression::Identifier(ident) => &ident.name,
            other => panic!("Expected identifier, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_input() {
        assert_eq!(parse_default("").unwrap(), Fragment::default());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_plain_text() {
        let fragment = parse_default("hello world").unwrap();
        assert_eq!(text(only_child(&fragment)), "hello world");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_open_close_and_self_closing_tags() {
        for input in ["<tag></tag>", "<tag/>", "<tag />"] {
            let fragment = parse_default(input).unwrap();
            let tag = element(only_child(&fragment));
            assert_eq!(tag.name, "tag");
            assert!(tag.children.is_empty());
        }
        let fragment = parse_default("<tag/>").unwrap();
        assert!(element(only_child(&fragment)).self_closing);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_tags() {
        let fragment = parse_default("<user>Hi <content-text>there</content-text></user>").unwrap();
        let user = element(only_child(&fragment));
        assert_eq!(user.children.len(), 2);
        assert_eq!(text(&user.children[0]), "Hi ");
        assert_eq!(element(&user.children[1]).name, "content-text");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tag_errors() {
        assert_eq!(error_code("<tag>"), ErrorCode::UnclosedBlock);
        assert_eq!(error_code("</tag>"), ErrorCode::UnexpectedTagClose);
        assert_eq!(error_code("<tag"), ErrorCode::UnexpectedEof);
        assert_eq!(error_code("<tag a=\"1\""), ErrorCode::UnexpectedEof);
        assert_eq!(error_code("<a></b>"), ErrorCode::UnexpectedTagClose);
        assert_eq!(error_code("<a></a"), ErrorCode::UnexpectedEof);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_block_position_is_eof() {
        let input = "<user>\nhello";
        let err = parse_default(input).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnclosedBlock);
        assert_eq!(err.position.line, 2);
        assert_eq!(err.position.column, 6);
        assert_eq!(err.position.offset, input.len());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_attributes() {
        let fragment =
            parse_default(r#"<message role="user" name='bob' flag count={{ n + 1 }} title="Hi {{ name }}!" />"#)
                .unwrap();
        let tag = element(only_child(&fragment));
        let names: Vec<_> = tag.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["role", "name", "flag", "count", "title"]);

        match &tag.attribute("role").unwrap().value {
            AttributeValue::Nodes(nodes) => assert_eq!(text(&nodes[0]), "user"),
            other => panic!("Expected literal, got {:?}", other),
        }
        assert_eq!(tag.attribute("flag").unwrap().value, AttributeValue::True);
        assert!(matches!(
            tag.attribute("count").unwrap().value,
            AttributeValue::Expression(Expression::BinaryExpression { .. })
        ));
        match &tag.attribute("title").unwrap().value {
            AttributeValue::Nodes(nodes) => {
                assert_eq!(nodes.len(), 3);
                assert_eq!(text(&nodes[0]), "Hi ");
                assert!(matches!(nodes[1], TemplateNode::MustacheTag(_)));
                assert_eq!(text(&nodes[2]), "!");
            }
            other => panic!("Expected mixed nodes, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_quoted_single_interpolation_is_expression() {
        let fragment = parse_default(r#"<tool-call arguments="{{ { a: "}" } }}"/>"#).unwrap();
        let tag = element(only_child(&fragment));
        assert!(matches!(
            tag.attribute("arguments").unwrap().value,
            AttributeValue::Expression(Expression::ObjectExpression { .. })
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_duplicate_attribute() {
        let err = parse_default(r#"<tag a="1" a="2"/>"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateAttribute);
        assert_eq!(err.position.column, 12);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_malformed_attribute() {
        assert_eq!(error_code(r#"<tag "x"/>"#), ErrorCode::InvalidAttribute);
        assert_eq!(error_code("<tag a=/>"), ErrorCode::InvalidAttribute);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_mustache() {
        let fragment = parse_default("Hello {{ name }}!").unwrap();
        assert_eq!(fragment.children.len(), 3);
        match &fragment.children[1] {
            TemplateNode::MustacheTag(tag) => assert_eq!(ident(&tag.expression), "name"),
            other => panic!("Expected mustache, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_binary_expression() {
        let fragment = parse_default("{{ if a==3 }}x{{ endif }}").unwrap();
        let block = if_block(only_child(&fragment));
        match &block.expression {
            Expression::BinaryExpression {
                operator,
                left,
                right,
            } => {
                assert_eq!(*operator, BinaryOperator::Equal);
                assert_eq!(ident(left), "a");
                assert_eq!(**right, Expression::Literal { value: json!(3) });
            }
            other => panic!("Expected binary expression, got {:?}", other),
        }
        assert_eq!(text(&block.children[0]), "x");
        assert!(block.else_block.is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_else() {
        let fragment = parse_default("{{ if a }}yes{{ else }}no{{ endif }}").unwrap();
        let block = if_block(only_child(&fragment));
        let else_block = block.else_block.as_ref().unwrap();
        assert_eq!(text(&else_block.children[0]), "no");
        assert!(else_block.chained_if().is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_else_if_chain_nests() {
        let fragment =
            parse_default("{{ if a }}x{{ else if b }}y{{ else if c }}z{{ endif }}").unwrap();
        let first = if_block(only_child(&fragment));
        assert_eq!(ident(&first.expression), "a");

        let second_else = first.else_block.as_ref().unwrap();
        assert_eq!(second_else.children.len(), 1);
        let second = if_block(&second_else.children[0]);
        assert_eq!(ident(&second.expression), "b");
        assert_eq!(text(&second.children[0]), "y");

        let third = second.else_block.as_ref().unwrap().chained_if().unwrap();
        assert_eq!(ident(&third.expression), "c");
        assert_eq!(text(&third.children[0]), "z");
        assert!(third.else_block.is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_else_if_with_final_else() {
        let fragment = parse_default("{{ if a }}A{{ else if b }}B{{ else }}C{{ endif }}").unwrap();
        let first = if_block(only_child(&fragment));
        let second = first.else_block.as_ref().unwrap().chained_if().unwrap();
        let last = second.else_block.as_ref().unwrap();
        assert!(last.chained_if().is_none());
        assert_eq!(text(&last.children[0]), "C");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_block() {
        let fragment =
            parse_default("{{ for item, i in list }}a{{ else }}b{{ endfor }}").unwrap();
        match only_child(&fragment) {
            TemplateNode::ForBlock(block) => {
                assert_eq!(block.context.name, "item");
                assert_eq!(block.index.as_ref().unwrap().name, "i");
                assert_eq!(ident(&block.expression), "list");
                assert_eq!(text(&block.children[0]), "a");
                assert_eq!(text(&block.else_block.as_ref().unwrap().children[0]), "b");
            }
            other => panic!("Expected for block, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_errors() {
        assert_eq!(error_code("{{ else }}"), ErrorCode::InvalidElsePlacement);
        assert_eq!(error_code("{{ else if a }}"), ErrorCode::InvalidElsePlacement);
        assert_eq!(
            error_code("{{ if a }}x{{ else }}y{{ else }}z{{ endif }}"),
            ErrorCode::InvalidElsePlacement
        );
        assert_eq!(
            error_code("{{ if a }}x{{ else }}y{{ else if b }}z{{ endif }}"),
            ErrorCode::InvalidElsePlacement
        );
        assert_eq!(
            error_code("{{ for a in b }}x{{ else if c }}y{{ endfor }}"),
            ErrorCode::InvalidElsePlacement
        );
        assert_eq!(error_code("{{ if a }}x{{ endfor }}"), ErrorCode::UnexpectedBlockClose);
        assert_eq!(error_code("{{ for a in b }}x{{ endif }}"), ErrorCode::UnexpectedBlockClose);
        assert_eq!(error_code("{{ endif }}"), ErrorCode::UnexpectedBlockClose);
        assert_eq!(error_code("{{ if a }}x"), ErrorCode::UnclosedBlock);
        assert_eq!(error_code("{{ for a in b }}x"), ErrorCode::UnclosedBlock);
        assert_eq!(error_code("{{ if a }}x{{ else }}y"), ErrorCode::UnclosedBlock);
        assert_eq!(error_code("{{ if a"), ErrorCode::UnexpectedEof);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_else_inside_tag_is_misplaced() {
        assert_eq!(
            error_code("{{ if a }}<user>x{{ else }}y</user>{{ endif }}"),
            ErrorCode::InvalidElsePlacement
        );
        assert_eq!(
            error_code("{{ if a }}<user>x{{ endif }}</user>"),
            ErrorCode::UnexpectedBlockClose
        );
        assert_eq!(
            error_code("<user>{{ if a }}x</user>{{ endif }}"),
            ErrorCode::UnexpectedTagClose
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_invalid_expression() {
        assert_eq!(error_code("{{ a + }}"), ErrorCode::InvalidExpression);
        assert_eq!(error_code("{{ for in list }}{{ endfor }}"), ErrorCode::InvalidExpression);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comments_are_verbatim() {
        let fragment = parse_default("/* <user>{{ x }}</user> */<!-- {{ if }} -->").unwrap();
        assert_eq!(fragment.children.len(), 2);
        match (&fragment.children[0], &fragment.children[1]) {
            (TemplateNode::Comment(block), TemplateNode::Comment(tag)) => {
                assert_eq!(block.data, " <user>{{ x }}</user> ");
                assert_eq!(block.raw, "/* <user>{{ x }}</user> */");
                assert_eq!(tag.data, " {{ if }} ");
                assert_eq!(tag.raw, "<!-- {{ if }} -->");
            }
            other => panic!("Expected two comments, got {:?}", other),
        }
        assert_eq!(error_code("/* never closed"), ErrorCode::UnexpectedEof);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escaped_delimiters_are_text() {
        let fragment = parse_default(r"Use \{{ name }} and \<user> literally").unwrap();
        assert_eq!(
            text(only_child(&fragment)),
            "Use {{ name }} and <user> literally"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_custom_delimiters() {
        let config = ParseConfig::with_delimiters("<%", "%>");
        let fragment = parse("<% if a %>{{ literal }}<% endif %>", &config).unwrap();
        let block = if_block(only_child(&fragment));
        assert_eq!(text(&block.children[0]), "{{ literal }}");

        let err = parse("x", &ParseConfig::with_delimiters("{{", "{{")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_frontmatter() {
        let fragment = parse_default("---\nmodel: gpt-4o\ntemperature: 0.2\n---\nHello").unwrap();
        assert_eq!(fragment.children.len(), 2);
        match &fragment.children[0] {
            TemplateNode::Config(config) => {
                assert_eq!(config.value, json!({ "model": "gpt-4o", "temperature": 0.2 }));
                assert!(config.raw.starts_with("---\n"));
                assert!(config.raw.ends_with("---\n"));
            }
            other => panic!("Expected config, got {:?}", other),
        }
        assert_eq!(text(&fragment.children[1]), "Hello");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_frontmatter_errors() {
        assert_eq!(error_code("---\nmodel: [\n---\n"), ErrorCode::InvalidConfig);
        assert_eq!(error_code("  ---\nmodel: {\n---\nHi"), ErrorCode::InvalidConfig);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_fence_is_text() {
        let fragment = parse_default("---\nhello").unwrap();
        assert_eq!(text(only_child(&fragment)), "---\nhello");

        let fragment = parse_default("---\nmodel: x\n").unwrap();
        assert_eq!(text(only_child(&fragment)), "---\nmodel: x\n");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_non_mapping_fence_is_text() {
        let source = "---\nSection one\n---\nbody";
        let fragment = parse_default(source).unwrap();
        assert_eq!(text(only_child(&fragment)), source);

        let fragment = parse_default("---\n- a\n---\n<user>x</user>").unwrap();
        assert_eq!(fragment.children.len(), 2);
        assert_eq!(text(&fragment.children[0]), "---\n- a\n---\n");
        assert_eq!(element(&fragment.children[1]).name, "user");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nesting_depth_limit() {
        let ifs = |depth: usize| format!("{}x{}", "{{ if a }}".repeat(depth), "{{ endif }}".repeat(depth));
        let fragment = parse_default(&ifs(MAX_NESTING_DEPTH)).unwrap();
        assert_eq!(if_block(only_child(&fragment)).children.len(), 1);

        let err = parse_default(&ifs(MAX_NESTING_DEPTH + 1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::NestingTooDeep);
        assert_eq!(err.position.offset, MAX_NESTING_DEPTH * "{{ if a }}".len());

        let chain = format!("{{{{ if a }}}}{}{{{{ endif }}}}", "{{ else if a }}".repeat(10_000));
        let deep_tags = format!("{}{}", "<user>".repeat(10_000), "</user>".repeat(10_000));
        let deep_loops = "{{ for x in xs }}".repeat(10_000);
        for source in [chain, deep_tags, deep_loops] {
            assert_eq!(error_code(&source), ErrorCode::NestingTooDeep);
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dashes_without_newline_are_text() {
        let fragment = parse_default("--- not frontmatter").unwrap();
        assert_eq!(text(only_child(&fragment)), "--- not frontmatter");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_spans_and_lines() {
        let fragment = parse_default("line one\n<user>{{ name }}</user>").unwrap();
        let tag = element(&fragment.children[1]);
        assert_eq!(tag.span.start.line, 2);
        assert_eq!(tag.span.start.column, 1);
        assert_eq!(tag.span.end.offset, 32);
        match &tag.children[0] {
            TemplateNode::MustacheTag(mustache) => {
                assert_eq!(mustache.span.start.column, 7);
                match &mustache.expression {
                    Expression::Identifier(ident) => assert_eq!(ident.span.start.column, 10),
                    other => panic!("Expected identifier, got {:?}", other),
                }
            }
            other => panic!("Expected mustache, got {:?}", other),
        }
    }
}
