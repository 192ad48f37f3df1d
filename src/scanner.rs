use crate::error::{Position, PromptlateError, PromptlateResult};

pub(crate) const BLOCK_COMMENT_OPEN: &str = "/*";
pub(crate) const BLOCK_COMMENT_CLOSE: &str = "*/";
pub(crate) const TAG_COMMENT_OPEN: &str = "<!--";
pub(crate) const TAG_COMMENT_CLOSE: &str = "-->";
const ESCAPE: char = '\\';

/// What the scanner sees at the cursor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Text,
    BlockComment,
    TagComment,
    /// `<` followed by a tag name.
    TagOpen,
    /// `</` followed by a tag name.
    TagClose,
    ExpressionOpen,
    Eof,
}

/// A positioned cursor over template source.
///
/// The scanner never fails by itself except where a delimited span (comment,
/// expression, quoted value) runs into the end of input.
#[derive(Debug, Clone)]
pub(crate) struct Scanner<'a> {
    input: &'a str,
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
    open: &'a str,
    close: &'a str,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(input: &'a str, open: &'a str, close: &'a str) -> Self {
        Scanner {
            input,
            pos: 0,
            line: 1,
            line_start_pos: 0,
            open,
            close,
        }
    }

    #[inline]
    pub(crate) const fn position(&self) -> Position {
        Position {
            offset: self.pos,
            line: self.line,
            column: self.pos - self.line_start_pos + 1,
        }
    }

    pub(crate) const fn delimiters(&self) -> (&'a str, &'a str) {
        (self.open, self.close)
    }

    pub(crate) fn slice(&self, start: usize, end: usize) -> &'a str {
        self.input.get(start..end).unwrap_or_default()
    }

    pub(crate) fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn rest(&self) -> &'a str {
        self.input.get(self.pos..).unwrap_or_default()
    }

    pub(crate) fn current_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// Advances past one character, updating line tracking on newlines.
    #[inline]
    pub(crate) fn bump(&mut self) -> Option<char> {
        let current_char = self.current_char()?;
        let char_len = current_char.len_utf8();
        if current_char == '\n' {
            self.line += 1;
            self.line_start_pos = self.pos + char_len;
        }
        self.pos += char_len;
        Some(current_char)
    }

    /// Peek if the remaining input starts with `s`
    pub(crate) fn peek(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    /// Consume `s` if the remaining input starts with it.
    pub(crate) fn consume(&mut self, s: &str) -> bool {
        if self.peek(s) {
            for _ in s.chars() {
                self.bump();
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn consume_whitespace(&mut self) {
        while self.current_char().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    /// Classifies the construct starting at the cursor.
    pub(crate) fn peek_event(&self) -> Event {
        let rest = self.rest();
        if rest.is_empty() {
            Event::Eof
        } else if rest.starts_with(self.open) {
            Event::ExpressionOpen
        } else if rest.starts_with(BLOCK_COMMENT_OPEN) {
            Event::BlockComment
        } else if rest.starts_with(TAG_COMMENT_OPEN) {
            Event::TagComment
        } else if let Some(after) = rest.strip_prefix("</") {
            if starts_with_name(after) {
                Event::TagClose
            } else {
                Event::Text
            }
        } else if let Some(after) = rest.strip_prefix('<') {
            if starts_with_name(after) {
                Event::TagOpen
            } else {
                Event::Text
            }
        } else {
            Event::Text
        }
    }

    /// Consumes text up to the next structural event.
    ///
    /// A backslash directly before the expression delimiter, `<` or `/*`
    /// makes that sequence literal and is itself dropped.
    pub(crate) fn scan_text(&mut self) -> String {
        let mut data = String::new();
        while !self.eof() {
            if self.current_char() == Some(ESCAPE) {
                if let Some(escaped) = self.escaped_sequence() {
                    self.bump();
                    for c in escaped.chars() {
                        data.push(c);
                        self.bump();
                    }
                    continue;
                }
            } else if self.peek_event() != Event::Text {
                break;
            }
            if let Some(c) = self.bump() {
                data.push(c);
            }
        }
        data
    }

    fn escaped_sequence(&self) -> Option<&'a str> {
        let after = self.rest().get(ESCAPE.len_utf8()..)?;
        [self.open, BLOCK_COMMENT_OPEN, "<"]
            .into_iter()
            .find(|seq| after.starts_with(seq))
    }

    /// Scans a comment whose opener is at the cursor.
    ///
    /// Returns `(data, raw)`. Everything inside is taken verbatim.
    pub(crate) fn scan_comment(
        &mut self,
        open: &str,
        close: &str,
    ) -> PromptlateResult<(String, String)> {
        let start = self.pos;
        self.consume(open);
        let data_start = self.pos;
        while !self.peek(close) {
            if self.bump().is_none() {
                return Err(PromptlateError::unexpected_eof(
                    Some(close),
                    self.position(),
                ));
            }
        }
        let data = self.slice(data_start, self.pos).to_string();
        self.consume(close);
        Ok((data, self.slice(start, self.pos).to_string()))
    }

    /// Scans the body of an expression whose opening delimiter has already
    /// been consumed, and consumes the closing delimiter.
    ///
    /// Closing delimiters inside string literals or nested braces do not end
    /// the expression.
    pub(crate) fn scan_expression(&mut self) -> PromptlateResult<(String, Position)> {
        let start = self.position();
        let mut depth = 0_usize;
        let mut quote: Option<char> = None;
        loop {
            if self.eof() {
                return Err(PromptlateError::unexpected_eof(
                    Some(self.close),
                    self.position(),
                ));
            }
            if let Some(q) = quote {
                match self.bump() {
                    Some(ESCAPE) => {
                        self.bump();
                    }
                    Some(c) if c == q => quote = None,
                    Some(_) | None => {}
                }
                continue;
            }
            if depth == 0 && self.peek(self.close) {
                let body = self.slice(start.offset, self.pos).to_string();
                self.consume(self.close);
                return Ok((body, start));
            }
            match self.bump() {
                Some(c @ ('\'' | '"' | '`')) => quote = Some(c),
                Some('{' | '[' | '(') => depth = depth.saturating_add(1),
                Some('}' | ']' | ')') => depth = depth.saturating_sub(1),
                Some(_) | None => {}
            }
        }
    }

    /// Consumes a tag or attribute name.
    pub(crate) fn scan_name(&mut self) -> Option<&'a str> {
        let start = self.pos;
        while self.current_char().is_some_and(is_name_char) {
            self.bump();
        }
        if start == self.pos {
            None
        } else {
            Some(self.slice(start, self.pos))
        }
    }
}

fn starts_with_name(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

pub(crate) fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')
}
