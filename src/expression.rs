//! Parsing of the text between expression delimiters.
//!
//! The body of every `{{ ... }}` is either a control statement (`if`, `else`,
//! `else if`, `endif`, `for`, `endfor`) or a plain expression. Expressions are
//! parsed by precedence climbing; see [`binary_precedence`] for the operator
//! table.

use serde_json::Value;

use crate::ast::{BinaryOperator, Expression, Identifier, UnaryOperator};
use crate::error::{ErrorCode, Position, PromptlateError, PromptlateResult, Span};

type ParseResult<T> = PromptlateResult<T>;

/// What a single `{{ ... }}` contained.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    Expression(Expression),
    If(Expression),
    ElseIf(Expression),
    Else,
    EndIf,
    For {
        context: Identifier,
        index: Option<Identifier>,
        expression: Expression,
    },
    EndFor,
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(Value),
    Str(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

/// How deeply parentheses, literals, conditionals and unary operators may nest.
const MAX_EXPRESSION_DEPTH: usize = 64;

/// Longest first, so that `===` wins over `==`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "??", "?.", "<", ">", "+", "-", "*", "/",
    "%", "!", "?", ":", ".", ",", "(", ")", "[", "]", "{", "}",
];

/// Maps a source offset inside an expression body back to a template position.
struct Locator<'a> {
    source: &'a str,
    base: Position,
}

impl Locator<'_> {
    fn position(&self, offset: usize) -> Position {
        let mut position = self.base;
        for c in self.source.get(..offset).unwrap_or(self.source).chars() {
            position.offset += c.len_utf8();
            if c == '\n' {
                position.line += 1;
                position.column = 1;
            } else {
                position.column += c.len_utf8();
            }
        }
        position
    }

    fn span(&self, start: usize, end: usize) -> Span {
        Span::new(self.position(start), self.position(end))
    }

    fn error<M: Into<String>>(&self, offset: usize, message: M) -> PromptlateError {
        PromptlateError::new(ErrorCode::InvalidExpression, message, self.position(offset))
    }
}

fn tokenize(locator: &Locator<'_>) -> ParseResult<Vec<Token>> {
    let source = locator.source;
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Ident(source.get(start..end).unwrap_or_default().to_string()),
                start,
                end,
            });
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = start;
            let mut seen_dot = false;
            while let Some(&(i, c)) = chars.peek() {
                let is_fraction_dot = c == '.'
                    && !seen_dot
                    && source
                        .get(i + 1..)
                        .and_then(|s| s.chars().next())
                        .is_some_and(|n| n.is_ascii_digit());
                if c.is_ascii_digit() || is_fraction_dot {
                    seen_dot |= c == '.';
                    end = i + 1;
                    chars.next();
                } else {
                    break;
                }
            }
            let text = source.get(start..end).unwrap_or_default();
            let value = if seen_dot {
                text.parse::<f64>().ok().map(Value::from)
            } else {
                text.parse::<i64>()
                    .map(Value::from)
                    .ok()
                    .or_else(|| text.parse::<f64>().ok().map(Value::from))
            }
            .ok_or_else(|| locator.error(start, format!("Invalid number '{}'", text)))?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                start,
                end,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            chars.next();
            let mut value = String::new();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                if c == '\\' {
                    match chars.next() {
                        Some((_, 'n')) => value.push('\n'),
                        Some((_, 't')) => value.push('\t'),
                        Some((_, 'r')) => value.push('\r'),
                        Some((_, other)) => value.push(other),
                        None => break,
                    }
                } else if c == start_quote(source, start) {
                    end = Some(i + 1);
                    break;
                } else {
                    value.push(c);
                }
            }
            let end = end.ok_or_else(|| locator.error(start, "Unterminated string literal"))?;
            tokens.push(Token {
                kind: TokenKind::Str(value),
                start,
                end,
            });
            continue;
        }

        let rest = source.get(start..).unwrap_or_default();
        if rest.starts_with('=') && !rest.starts_with("==") {
            return Err(locator.error(start, "Assignments are not supported in expressions"));
        }
        let punct = PUNCTUATORS
            .iter()
            .find(|p| rest.starts_with(**p))
            .ok_or_else(|| locator.error(start, format!("Unexpected character '{}'", c)))?;
        for _ in 0..punct.len() {
            chars.next();
        }
        tokens.push(Token {
            kind: TokenKind::Punct(punct),
            start,
            end: start + punct.len(),
        });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        start: source.len(),
        end: source.len(),
    });
    Ok(tokens)
}

fn start_quote(source: &str, start: usize) -> char {
    source
        .get(start..)
        .and_then(|s| s.chars().next())
        .unwrap_or('"')
}

/// Binding power of a binary operator token. Higher binds tighter.
const fn binary_precedence(op: BinaryOperator) -> u8 {
    match op {
        BinaryOperator::NullishCoalescing => 1,
        BinaryOperator::Or => 2,
        BinaryOperator::And => 3,
        BinaryOperator::Equal
        | BinaryOperator::NotEqual
        | BinaryOperator::StrictEqual
        | BinaryOperator::StrictNotEqual => 4,
        BinaryOperator::Less
        | BinaryOperator::LessEqual
        | BinaryOperator::Greater
        | BinaryOperator::GreaterEqual => 5,
        BinaryOperator::Add | BinaryOperator::Subtract => 6,
        BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Remainder => 7,
    }
}

fn binary_operator(punct: &str) -> Option<BinaryOperator> {
    Some(match punct {
        "==" => BinaryOperator::Equal,
        "!=" => BinaryOperator::NotEqual,
        "===" => BinaryOperator::StrictEqual,
        "!==" => BinaryOperator::StrictNotEqual,
        "<" => BinaryOperator::Less,
        "<=" => BinaryOperator::LessEqual,
        ">" => BinaryOperator::Greater,
        ">=" => BinaryOperator::GreaterEqual,
        "+" => BinaryOperator::Add,
        "-" => BinaryOperator::Subtract,
        "*" => BinaryOperator::Multiply,
        "/" => BinaryOperator::Divide,
        "%" => BinaryOperator::Remainder,
        "&&" => BinaryOperator::And,
        "||" => BinaryOperator::Or,
        "??" => BinaryOperator::NullishCoalescing,
        _ => return None,
    })
}

struct ExpressionParser<'a> {
    locator: Locator<'a>,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> ExpressionParser<'a> {
    fn new(source: &'a str, base: Position) -> ParseResult<Self> {
        let locator = Locator { source, base };
        let tokens = tokenize(&locator)?;
        Ok(Self {
            locator,
            tokens,
            pos: 0,
            depth: 0,
        })
    }

    fn current(&self) -> &Token {
        // The token list always ends with Eof, and `advance` never moves past it.
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .expect("token list is never empty")
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check_punct(&self, punct: &str) -> bool {
        matches!(self.current().kind, TokenKind::Punct(p) if p == punct)
    }

    fn check_ident(&self, name: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Ident(ident) if ident == name)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.check_punct(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn describe(token: &Token) -> String {
        match &token.kind {
            TokenKind::Ident(name) => format!("'{}'", name),
            TokenKind::Number(value) => format!("'{}'", value),
            TokenKind::Str(value) => format!("'\"{}\"'", value),
            TokenKind::Punct(p) => format!("'{}'", p),
            TokenKind::Eof => "end of expression".to_string(),
        }
    }

    fn unexpected(&self, expected: &str) -> PromptlateError {
        let token = self.current();
        self.locator.error(
            token.start,
            format!("Expected {}, found {}", expected, Self::describe(token)),
        )
    }

    fn expect_punct(&mut self, punct: &str) -> ParseResult<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", punct)))
        }
    }

    fn expect_end(&self) -> ParseResult<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.unexpected("end of expression"))
        }
    }

    fn identifier(&mut self) -> ParseResult<Identifier> {
        match self.current().kind.clone() {
            TokenKind::Ident(name) if !is_reserved(&name) => {
                let token = self.advance();
                Ok(Identifier {
                    name,
                    span: self.locator.span(token.start, token.end),
                })
            }
            TokenKind::Ident(_)
            | TokenKind::Number(_)
            | TokenKind::Str(_)
            | TokenKind::Punct(_)
            | TokenKind::Eof => Err(self.unexpected("identifier")),
        }
    }

    // --- Statements ---

    fn statement(&mut self) -> ParseResult<Statement> {
        let keyword = match &self.current().kind {
            TokenKind::Ident(name) => name.clone(),
            TokenKind::Number(_) | TokenKind::Str(_) | TokenKind::Punct(_) | TokenKind::Eof => {
                return self.plain_expression();
            }
        };

        match keyword.as_str() {
            "if" => {
                self.advance();
                let expression = self.expression()?;
                self.expect_end()?;
                Ok(Statement::If(expression))
            }
            "else" => {
                self.advance();
                if self.check_ident("if") {
                    self.advance();
                    let expression = self.expression()?;
                    self.expect_end()?;
                    Ok(Statement::ElseIf(expression))
                } else {
                    self.expect_end()?;
                    Ok(Statement::Else)
                }
            }
            "endif" => {
                self.advance();
                self.expect_end()?;
                Ok(Statement::EndIf)
            }
            "for" => {
                self.advance();
                let context = self.identifier()?;
                let index = if self.eat_punct(",") {
                    Some(self.identifier()?)
                } else {
                    None
                };
                if !self.check_ident("in") {
                    return Err(self.unexpected("'in'"));
                }
                self.advance();
                let expression = self.expression()?;
                self.expect_end()?;
                Ok(Statement::For {
                    context,
                    index,
                    expression,
                })
            }
            "endfor" => {
                self.advance();
                self.expect_end()?;
                Ok(Statement::EndFor)
            }
            _ => self.plain_expression(),
        }
    }

    fn plain_expression(&mut self) -> ParseResult<Statement> {
        let expression = self.expression()?;
        self.expect_end()?;
        Ok(Statement::Expression(expression))
    }

    // --- Expressions ---
    // Precedence: conditional -> binary (table) -> unary -> postfix -> primary

    fn expression(&mut self) -> ParseResult<Expression> {
        self.conditional()
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T, F>(&mut self, parse: F) -> ParseResult<T>
    where
        F: FnOnce(&mut Self) -> ParseResult<T>,
    {
        if self.depth >= MAX_EXPRESSION_DEPTH {
            return Err(PromptlateError::new(
                ErrorCode::NestingTooDeep,
                format!(
                    "Expression nests deeper than {} levels",
                    MAX_EXPRESSION_DEPTH
                ),
                self.locator.position(self.current().start),
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn conditional(&mut self) -> ParseResult<Expression> {
        self.nested(Self::conditional_inner)
    }

    fn conditional_inner(&mut self) -> ParseResult<Expression> {
        let test = self.binary(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.conditional()?;
        self.expect_punct(":")?;
        let alternate = self.conditional()?;
        Ok(Expression::ConditionalExpression {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn peek_binary_operator(&self) -> Option<BinaryOperator> {
        match self.current().kind {
            TokenKind::Punct(p) => binary_operator(p),
            TokenKind::Ident(_) | TokenKind::Number(_) | TokenKind::Str(_) | TokenKind::Eof => {
                None
            }
        }
    }

    /// Left-associative binary operators binding tighter than `min_precedence`.
    fn binary(&mut self, min_precedence: u8) -> ParseResult<Expression> {
        let mut left = self.unary()?;
        while let Some(operator) = self.peek_binary_operator() {
            let precedence = binary_precedence(operator);
            if precedence <= min_precedence {
                break;
            }
            self.advance();
            let right = self.binary(precedence)?;
            left = Expression::BinaryExpression {
                operator,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<Expression> {
        let operator = if self.check_punct("!") {
            UnaryOperator::Not
        } else if self.check_punct("-") {
            UnaryOperator::Minus
        } else if self.check_punct("+") {
            UnaryOperator::Plus
        } else {
            return self.postfix();
        };
        self.advance();
        let argument = self.nested(Self::unary)?;
        Ok(Expression::UnaryExpression {
            operator,
            argument: Box::new(argument),
        })
    }

    fn postfix(&mut self) -> ParseResult<Expression> {
        let mut object = self.primary()?;
        loop {
            let optional = self.eat_punct("?.");
            if self.eat_punct("[") {
                let property = self.expression()?;
                self.expect_punct("]")?;
                object = Expression::MemberExpression {
                    object: Box::new(object),
                    property: Box::new(property),
                    computed: true,
                    optional,
                };
            } else if optional || self.eat_punct(".") {
                let property = self.property_name()?;
                object = Expression::MemberExpression {
                    object: Box::new(object),
                    property: Box::new(Expression::Identifier(property)),
                    computed: false,
                    optional,
                };
            } else {
                return Ok(object);
            }
        }
    }

    /// After a `.`, keywords are valid property names.
    fn property_name(&mut self) -> ParseResult<Identifier> {
        if let TokenKind::Ident(name) = self.current().kind.clone() {
            let token = self.advance();
            Ok(Identifier {
                name,
                span: self.locator.span(token.start, token.end),
            })
        } else {
            Err(self.unexpected("property name"))
        }
    }

    fn primary(&mut self) -> ParseResult<Expression> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Number(value) => {
                self.advance();
                Ok(Expression::Literal { value })
            }
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expression::Literal {
                    value: Value::String(value),
                })
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" | "false" => {
                    self.advance();
                    Ok(Expression::Literal {
                        value: Value::Bool(name == "true"),
                    })
                }
                "null" | "undefined" => {
                    self.advance();
                    Ok(Expression::Literal { value: Value::Null })
                }
                _ => self.identifier().map(Expression::Identifier),
            },
            TokenKind::Punct("(") => {
                self.advance();
                let inner = self.expression()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            TokenKind::Punct("[") => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check_punct("]") {
                    elements.push(self.expression()?);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("]")?;
                Ok(Expression::ArrayExpression { elements })
            }
            TokenKind::Punct("{") => {
                self.advance();
                let mut properties = Vec::new();
                while !self.check_punct("}") {
                    let key = match self.current().kind.clone() {
                        TokenKind::Ident(name) | TokenKind::Str(name) => name,
                        TokenKind::Number(_) | TokenKind::Punct(_) | TokenKind::Eof => {
                            return Err(self.unexpected("property key"));
                        }
                    };
                    self.advance();
                    self.expect_punct(":")?;
                    properties.push((key, self.expression()?));
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("}")?;
                Ok(Expression::ObjectExpression { properties })
            }
            TokenKind::Punct(_) | TokenKind::Eof => Err(self.unexpected("expression")),
        }
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        "if" | "else" | "endif" | "for" | "endfor" | "in" | "true" | "false" | "null" | "undefined"
    )
}

/// Parses the body of an expression tag into a statement.
///
/// `base` is the position of the first character of `source` in the template.
pub(crate) fn parse_statement(source: &str, base: Position) -> PromptlateResult<Statement> {
    ExpressionParser::new(source, base)?.statement()
}

/// Parses a standalone expression, rejecting control keywords.
pub(crate) fn parse_expression(source: &str, base: Position) -> PromptlateResult<Expression> {
    let mut parser = ExpressionParser::new(source, base)?;
    let expression = parser.expression()?;
    parser.expect_end()?;
    Ok(expression)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(source: &str) -> Expression {
        parse_expression(source, Position::start()).unwrap()
    }

    fn stmt(source: &str) -> Statement {
        parse_statement(source, Position::start()).unwrap()
    }

    fn ident_name(expression: &Expression) -> &str {
        match expression {
            Expression::Identifier(ident) => &ident.name,
            other => panic!("Expected identifier, got {:?}", other),
        }
    }

    fn literal(expression: &Expression) -> &Value {
        match expression {
            Expression::Literal { value } => value,
            other => panic!("Expected literal, got {:?}", other),
        }
    }

    fn binary(expression: &Expression) -> (BinaryOperator, &Expression, &Expression) {
        match expression {
            Expression::BinaryExpression {
                operator,
                left,
                right,
            } => (*operator, left, right),
            other => panic!("Expected binary expression, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_equality() {
        let parsed = expr("a==3");
        let (operator, left, right) = binary(&parsed);
        assert_eq!(operator, BinaryOperator::Equal);
        assert_eq!(ident_name(left), "a");
        assert_eq!(literal(right), &Value::from(3));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_literals() {
        assert_eq!(literal(&expr("42")), &Value::from(42));
        assert_eq!(literal(&expr("4.5")), &Value::from(4.5));
        assert_eq!(literal(&expr("'single'")), &Value::from("single"));
        assert_eq!(literal(&expr(r#""dou\"ble""#)), &Value::from("dou\"ble"));
        assert_eq!(literal(&expr("true")), &Value::Bool(true));
        assert_eq!(literal(&expr("false")), &Value::Bool(false));
        assert_eq!(literal(&expr("null")), &Value::Null);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_precedence_multiplication_over_addition() {
        // a + b * c => a + (b * c)
        let parsed = expr("a + b * c");
        let (operator, left, right) = binary(&parsed);
        assert_eq!(operator, BinaryOperator::Add);
        assert_eq!(ident_name(left), "a");
        let (inner, _, _) = binary(right);
        assert_eq!(inner, BinaryOperator::Multiply);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_precedence_and_over_or() {
        // a || b && c => a || (b && c)
        let parsed = expr("a || b && c");
        let (operator, _, right) = binary(&parsed);
        assert_eq!(operator, BinaryOperator::Or);
        assert_eq!(binary(right).0, BinaryOperator::And);

        // a && b || c => (a && b) || c
        let parsed = expr("a && b || c");
        let (operator, left, _) = binary(&parsed);
        assert_eq!(operator, BinaryOperator::Or);
        assert_eq!(binary(left).0, BinaryOperator::And);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_left_associative_subtraction() {
        // a - b - c => (a - b) - c
        let parsed = expr("a - b - c");
        let (_, left, right) = binary(&parsed);
        assert_eq!(ident_name(right), "c");
        assert_eq!(binary(left).0, BinaryOperator::Subtract);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comparison_binds_tighter_than_equality() {
        let parsed = expr("a < b == true");
        let (operator, left, _) = binary(&parsed);
        assert_eq!(operator, BinaryOperator::Equal);
        assert_eq!(binary(left).0, BinaryOperator::Less);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unary_and_parentheses() {
        let parsed = expr("!(a || b)");
        match parsed {
            Expression::UnaryExpression { operator, argument } => {
                assert_eq!(operator, UnaryOperator::Not);
                assert_eq!(binary(&argument).0, BinaryOperator::Or);
            }
            other => panic!("Expected unary, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_member_access() {
        match expr("user.address['city']") {
            Expression::MemberExpression {
                object,
                property,
                computed,
                ..
            } => {
                assert!(computed);
                assert_eq!(literal(&property), &Value::from("city"));
                match *object {
                    Expression::MemberExpression {
                        object,
                        property,
                        computed,
                        optional,
                    } => {
                        assert!(!computed);
                        assert!(!optional);
                        assert_eq!(ident_name(&object), "user");
                        assert_eq!(ident_name(&property), "address");
                    }
                    other => panic!("Expected member, got {:?}", other),
                }
            }
            other => panic!("Expected member, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_optional_member_access() {
        match expr("user?.name") {
            Expression::MemberExpression {
                optional, computed, ..
            } => {
                assert!(optional);
                assert!(!computed);
            }
            other => panic!("Expected member, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_conditional_is_right_associative() {
        match expr("a ? b : c ? d : e") {
            Expression::ConditionalExpression { alternate, .. } => {
                assert!(matches!(
                    *alternate,
                    Expression::ConditionalExpression { .. }
                ));
            }
            other => panic!("Expected conditional, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_array_and_object_literals() {
        match expr("[1, 'two', three]") {
            Expression::ArrayExpression { elements } => assert_eq!(elements.len(), 3),
            other => panic!("Expected array, got {:?}", other),
        }
        match expr("{ type: 'ephemeral', 'max-age': 10, }") {
            Expression::ObjectExpression { properties } => {
                let keys: Vec<_> = properties.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["type", "max-age"]);
            }
            other => panic!("Expected object, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_control_statements() {
        assert!(matches!(stmt(" if a "), Statement::If(_)));
        assert_eq!(stmt(" else "), Statement::Else);
        assert!(matches!(stmt(" else if b "), Statement::ElseIf(_)));
        assert_eq!(stmt(" endif "), Statement::EndIf);
        assert_eq!(stmt(" endfor "), Statement::EndFor);
        assert!(matches!(stmt(" iffy "), Statement::Expression(_)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_statement() {
        match stmt(" for item, i in items ") {
            Statement::For {
                context,
                index,
                expression,
            } => {
                assert_eq!(context.name, "item");
                assert_eq!(index.map(|i| i.name).as_deref(), Some("i"));
                assert_eq!(ident_name(&expression), "items");
            }
            other => panic!("Expected for, got {:?}", other),
        }
        match stmt("for item in [1, 2]") {
            Statement::For { index, .. } => assert!(index.is_none()),
            other => panic!("Expected for, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_missing_in() {
        let err = parse_statement("for item items", Position::start()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidExpression);
        assert_eq!(err.position.column, 10);
        assert!(err.message.contains("'in'"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_positions_are_offset_from_base() {
        let base = Position {
            offset: 10,
            line: 2,
            column: 5,
        };
        let err = parse_expression("a &&", base).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidExpression);
        assert_eq!(err.position.line, 2);
        assert_eq!(err.position.column, 9);
        assert_eq!(err.position.offset, 14);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_malformed_expressions() {
        for source in ["", "a +", "a b", "(a", "[1, 2", "'open", "a = 1", "a # b", "else x"] {
            let result = parse_statement(source, Position::start());
            assert!(result.is_err(), "'{}' should not parse", source);
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_keyword_is_not_an_identifier() {
        let err = parse_expression("for", Position::start()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidExpression);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nesting_depth_limit() {
        let parenthesised = |depth: usize| format!("{}x{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(
            ident_name(&expr(&parenthesised(MAX_EXPRESSION_DEPTH - 1))),
            "x"
        );

        let err = parse_expression(&parenthesised(MAX_EXPRESSION_DEPTH), Position::start())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NestingTooDeep);
        assert_eq!(err.position.column, MAX_EXPRESSION_DEPTH + 1);

        for source in [
            parenthesised(10_000),
            format!("{}x", "!".repeat(10_000)),
            format!("{}1{}", "[".repeat(10_000), "]".repeat(10_000)),
            format!("{}0", "a ? b : ".repeat(10_000)),
        ] {
            let err = parse_statement(&source, Position::start()).unwrap_err();
            assert_eq!(err.code, ErrorCode::NestingTooDeep);
        }
    }
}
