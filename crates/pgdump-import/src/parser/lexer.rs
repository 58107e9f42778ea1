//! Statement splitting over raw dump text.
//!
//! Splits on `;` outside single-quoted strings (including `E''` escape
//! strings), double-quoted identifiers, dollar-quoted bodies and comments.
//! `COPY ... FROM stdin;` statements absorb their data lines up to the `\.`
//! terminator.
//!
//! All delimiters are ASCII, so scanning bytes never splits a UTF-8 sequence.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

static COPY_FROM_STDIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*COPY\b.*\bFROM\s+stdin\b").unwrap());

/// A complete statement located in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawStatement {
    /// Byte range of the statement, including its terminator.
    pub span: Range<usize>,
    /// For COPY blocks, the byte range of the data lines (excluding `\.`).
    pub copy_data: Option<Range<usize>>,
}

/// Why the text ended before the last statement was terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenConstruct {
    SingleQuote,
    DoubleQuote,
    DollarQuote(String),
    BlockComment,
    Parenthesis(usize),
    Terminator,
    CopyData,
}

impl OpenConstruct {
    pub fn describe(&self) -> String {
        match self {
            OpenConstruct::SingleQuote => "unterminated string literal".to_string(),
            OpenConstruct::DoubleQuote => "unterminated quoted identifier".to_string(),
            OpenConstruct::DollarQuote(tag) => format!("unterminated dollar-quoted block {}", tag),
            OpenConstruct::BlockComment => "unterminated block comment".to_string(),
            OpenConstruct::Parenthesis(n) => format!("{} unclosed parenthesis", n),
            OpenConstruct::Terminator => "missing statement terminator".to_string(),
            OpenConstruct::CopyData => "COPY data not terminated by \\.".to_string(),
        }
    }
}

/// The trailing fragment left open at end of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unterminated {
    pub start: usize,
    pub open: OpenConstruct,
    /// Text that closes every open construct and terminates the statement.
    pub closer: String,
    /// For COPY blocks, where the data lines begin.
    pub copy_data_start: Option<usize>,
}

/// A `--` comment found between statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LineComment {
    pub offset: usize,
    pub text: String,
}

#[derive(Debug, Default)]
pub(crate) struct LexOutput {
    pub statements: Vec<RawStatement>,
    pub comments: Vec<LineComment>,
    pub unterminated: Option<Unterminated>,
}

/// Split `src` into statements.
pub(crate) fn split(src: &str) -> LexOutput {
    Lexer::new(src).run()
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    out: LexOutput,
}

enum Scan {
    Closed(usize),
    Open(OpenConstruct, String),
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            out: LexOutput::default(),
        }
    }

    fn peek(&self, at: usize) -> Option<u8> {
        self.bytes.get(at).copied()
    }

    fn run(mut self) -> LexOutput {
        let len = self.bytes.len();
        let mut start: Option<usize> = None;
        let mut depth: usize = 0;

        while self.pos < len {
            let b = self.bytes[self.pos];

            if b == b'-' && self.peek(self.pos + 1) == Some(b'-') {
                let end = self.line_end(self.pos);
                if start.is_none() {
                    self.out.comments.push(LineComment {
                        offset: self.pos,
                        text: self.src[self.pos..end].trim_end().to_string(),
                    });
                }
                self.pos = end;
                continue;
            }

            if b == b'/' && self.peek(self.pos + 1) == Some(b'*') {
                match self.scan_block_comment(self.pos) {
                    Scan::Closed(end) => self.pos = end,
                    Scan::Open(open, closer) => {
                        let at = start.unwrap_or(self.pos);
                        return self.finish_open(at, open, closer, depth);
                    }
                }
                continue;
            }

            if b.is_ascii_whitespace() {
                self.pos += 1;
                continue;
            }

            let stmt_start = *start.get_or_insert(self.pos);

            let scanned = match b {
                b'\'' => Some(self.scan_single_quote(self.pos)),
                b'"' => Some(self.scan_double_quote(self.pos)),
                b'$' => self.dollar_tag(self.pos).map(|tag| self.scan_dollar(self.pos, tag)),
                _ => None,
            };

            match scanned {
                Some(Scan::Closed(end)) => {
                    self.pos = end;
                    continue;
                }
                Some(Scan::Open(open, closer)) => {
                    return self.finish_open(stmt_start, open, closer, depth);
                }
                None => {}
            }

            match b {
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b';' => {
                    let end = self.pos + 1;
                    if COPY_FROM_STDIN.is_match(&self.src[stmt_start..end]) {
                        match self.scan_copy_data(end) {
                            Ok((data, stmt_end)) => {
                                self.out.statements.push(RawStatement {
                                    span: stmt_start..stmt_end,
                                    copy_data: Some(data),
                                });
                                self.pos = stmt_end;
                            }
                            Err(data_start) => {
                                self.out.unterminated = Some(Unterminated {
                                    start: stmt_start,
                                    open: OpenConstruct::CopyData,
                                    closer: copy_closer(self.src),
                                    copy_data_start: Some(data_start),
                                });
                                return self.out;
                            }
                        }
                    } else {
                        self.out.statements.push(RawStatement {
                            span: stmt_start..end,
                            copy_data: None,
                        });
                        self.pos = end;
                    }
                    start = None;
                    depth = 0;
                    continue;
                }
                _ => {}
            }

            self.pos += 1;
        }

        if let Some(stmt_start) = start {
            let open = if depth > 0 {
                OpenConstruct::Parenthesis(depth)
            } else {
                OpenConstruct::Terminator
            };
            return self.finish_open(stmt_start, open, String::new(), depth);
        }

        self.out
    }

    fn finish_open(
        mut self,
        start: usize,
        open: OpenConstruct,
        quote_closer: String,
        depth: usize,
    ) -> LexOutput {
        let mut closer = quote_closer;
        // a trailing line comment would swallow the closers
        closer.push('\n');
        closer.push_str(&")".repeat(depth));
        closer.push(';');
        self.out.unterminated = Some(Unterminated {
            start,
            open,
            closer,
            copy_data_start: None,
        });
        self.out
    }

    fn line_end(&self, from: usize) -> usize {
        self.src[from..]
            .find('\n')
            .map(|i| from + i)
            .unwrap_or(self.bytes.len())
    }

    fn scan_block_comment(&self, at: usize) -> Scan {
        let mut nesting = 0usize;
        let mut i = at;
        while i < self.bytes.len() {
            if self.bytes[i] == b'/' && self.peek(i + 1) == Some(b'*') {
                nesting += 1;
                i += 2;
            } else if self.bytes[i] == b'*' && self.peek(i + 1) == Some(b'/') {
                nesting -= 1;
                i += 2;
                if nesting == 0 {
                    return Scan::Closed(i);
                }
            } else {
                i += 1;
            }
        }
        Scan::Open(OpenConstruct::BlockComment, "*/".repeat(nesting))
    }

    fn scan_single_quote(&self, at: usize) -> Scan {
        let escapes = at > 0
            && matches!(self.bytes[at - 1], b'E' | b'e')
            && (at < 2 || !is_ident_byte(self.bytes[at - 2]));
        let mut i = at + 1;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'\\' if escapes => i += 2,
                b'\'' if self.peek(i + 1) == Some(b'\'') => i += 2,
                b'\'' => return Scan::Closed(i + 1),
                _ => i += 1,
            }
        }
        let closer = if escapes && self.src.ends_with('\\') {
            "\\'".to_string()
        } else {
            "'".to_string()
        };
        Scan::Open(OpenConstruct::SingleQuote, closer)
    }

    fn scan_double_quote(&self, at: usize) -> Scan {
        let mut i = at + 1;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'"' if self.peek(i + 1) == Some(b'"') => i += 2,
                b'"' => return Scan::Closed(i + 1),
                _ => i += 1,
            }
        }
        Scan::Open(OpenConstruct::DoubleQuote, "\"".to_string())
    }

    /// Length-checked dollar tag (`$$` or `$name$`) starting at `at`.
    fn dollar_tag(&self, at: usize) -> Option<&'a str> {
        if at > 0 && is_ident_byte(self.bytes[at - 1]) {
            return None;
        }
        let mut i = at + 1;
        match self.peek(i) {
            Some(b'$') => return Some(&self.src[at..at + 2]),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' || c >= 0x80 => {}
            _ => return None,
        }
        while let Some(c) = self.peek(i) {
            if c == b'$' {
                return Some(&self.src[at..=i]);
            }
            if !(c.is_ascii_alphanumeric() || c == b'_' || c >= 0x80) {
                return None;
            }
            i += 1;
        }
        None
    }

    fn scan_dollar(&self, at: usize, tag: &str) -> Scan {
        let body = at + tag.len();
        match self.src[body..].find(tag) {
            Some(i) => Scan::Closed(body + i + tag.len()),
            None => Scan::Open(OpenConstruct::DollarQuote(tag.to_string()), tag.to_string()),
        }
    }

    /// Consume COPY data lines after the header terminator at `after`.
    ///
    /// Returns the data range and the end of the `\.` line, or the data start
    /// if input ends first.
    fn scan_copy_data(&self, after: usize) -> std::result::Result<(Range<usize>, usize), usize> {
        let data_start = match self.src[after..].find('\n') {
            Some(i) => after + i + 1,
            None => return Err(self.bytes.len()),
        };
        let mut line_start = data_start;
        while line_start < self.bytes.len() {
            let line_end = self.line_end(line_start);
            let line = self.src[line_start..line_end].trim_end_matches('\r');
            if line == "\\." {
                return Ok((data_start..line_start, line_end));
            }
            line_start = line_end + 1;
        }
        Err(data_start)
    }
}

fn copy_closer(src: &str) -> String {
    if src.ends_with('\n') {
        "\\.\n".to_string()
    } else {
        "\n\\.\n".to_string()
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}
