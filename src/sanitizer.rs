//! Query Sanitizer
//!
//! Turns raw model output into an executable statement through an ordered
//! list of pure string transforms. Later steps assume earlier ones ran.
//! The whole pipeline is idempotent and never fails: text that cannot be
//! reduced to a clean statement is passed through with whatever cleaning
//! succeeded, and the executor reports the real problem.
//!
//! Statement termination and steps 4 to 7 only look at text outside
//! string literals.

use crate::dialect::Dialect;
use regex::{Captures, Regex};
use std::ops::Range;
use std::sync::OnceLock;
use tracing::trace;

/// One normalization step.
pub type Step = fn(&Sanitizer, &str) -> String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedQuery {
    pub sql: String,
    /// No complete statement was found, or the result does not parse.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanKind {
    Code,
    Literal,
    Identifier,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    kind: SpanKind,
    start: usize,
    end: usize,
}

/// Optional language tag after an opening fence. Known SQL tags may sit on
/// the same line as the query; any other word must end the line.
const FENCE_TAG: &str =
    r"(?:(?i:postgresql|postgres|pgsql|psql|plsql|mysql|sqlite|tsql|sql)\b[ \t]*\r?\n?|[A-Za-z0-9_+\-]*[ \t]*\r?\n)?";

fn fence_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?s)```{}(.*?)\s*```", FENCE_TAG)).expect("fence pattern is valid")
    })
}

fn dangling_fence_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?s)^\s*```{}|\s*```\s*$", FENCE_TAG)).expect("fence pattern is valid")
    })
}

fn backtick_run_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`{3,}").expect("backtick run pattern is valid"))
}

fn label_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)^(?:[\s*_#`"]*(?:sql[\s`"]*query|mysql|postgresql|postgres|sql|query)[\s*_`"]*:[\s*_`"]*)+"#,
        )
        .expect("label pattern is valid")
    })
}

fn select_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bSELECT\b").expect("select pattern is valid"))
}

fn whitespace_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

fn clause_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Multi-word keywords come first: alternation is leftmost-first.
        Regex::new(
            r"(?i)(\s*)\b((?:LEFT|RIGHT|FULL)\s+OUTER\s+JOIN|(?:LEFT|RIGHT|INNER|OUTER|CROSS|FULL)\s+JOIN|JOIN|SELECT|FROM|WHERE|GROUP\s+BY|HAVING|ORDER\s+BY|LIMIT|UNION|VALUES|INSERT|UPDATE|DELETE)\b",
        )
        .expect("clause pattern is valid")
    })
}

fn blank_line_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("blank line pattern is valid"))
}

#[derive(Debug, Clone, Copy)]
pub struct Sanitizer {
    dialect: Dialect,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(Dialect::MySql)
    }
}

impl Sanitizer {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// The normalization steps in application order.
    pub fn steps() -> [(&'static str, Step); 7] {
        [
            ("strip_code_fences", Sanitizer::strip_code_fences),
            ("strip_label", Sanitizer::strip_label),
            ("extract_statement", Sanitizer::extract_statement),
            ("strip_identifier_quotes", Sanitizer::strip_identifier_quotes),
            ("collapse_whitespace", Sanitizer::collapse_whitespace),
            ("break_clauses", Sanitizer::break_clauses),
            ("final_cleanup", Sanitizer::final_cleanup),
        ]
    }

    pub fn sanitize(&self, raw: &str) -> String {
        self.sanitize_with_report(raw).sql
    }

    pub fn sanitize_with_report(&self, raw: &str) -> SanitizedQuery {
        let mut text = raw.to_string();
        let mut statement_found = false;
        for (name, step) in Self::steps() {
            if name == "extract_statement" {
                statement_found = self.find_statement(&text).is_some();
            }
            text = step(self, &text);
            trace!("sanitizer {}: {:?}", name, text);
        }
        let degraded = !statement_found || !self.dialect.parses(&text);
        SanitizedQuery { sql: text, degraded }
    }

    /// 1. Drop markdown code fences, whatever the language tag, keeping the body.
    /// Unpaired fence markers anywhere in the text are dropped too.
    pub fn strip_code_fences(&self, text: &str) -> String {
        let unfenced = fence_pattern().replace_all(text, "$1");
        let unfenced = dangling_fence_pattern().replace_all(&unfenced, "");
        backtick_run_pattern().replace_all(&unfenced, "").into_owned()
    }

    /// 2. Drop leading labels such as `SQLQuery:` or `MySQL:`.
    pub fn strip_label(&self, text: &str) -> String {
        label_pattern().replace(text, "").into_owned()
    }

    /// 3. Keep only the first `SELECT ... ;` statement when one exists.
    pub fn extract_statement(&self, text: &str) -> String {
        match self.find_statement(text) {
            Some(range) => text[range].to_string(),
            None => text.to_string(),
        }
    }

    /// 4. Remove identifier quoting, leaving bare names.
    ///
    /// Only a terminated quote pair around a plain, non-reserved name with
    /// no word character on either side is removed. Anything else stays
    /// quoted, so the remaining quotes split the text the same way again.
    pub fn strip_identifier_quotes(&self, text: &str) -> String {
        let quote = self.dialect.identifier_quote();
        let mut out = String::with_capacity(text.len());
        for span in self.spans(text) {
            let segment = &text[span.start..span.end];
            let bare = match span.kind {
                SpanKind::Identifier => segment
                    .strip_prefix(quote)
                    .and_then(|inner| inner.strip_suffix(quote))
                    .filter(|name| is_plain_name(name))
                    .filter(|_| {
                        !text[..span.start].chars().next_back().is_some_and(is_word_char)
                            && !text[span.end..].chars().next().is_some_and(is_word_char)
                    }),
                _ => None,
            };
            out.push_str(bare.unwrap_or(segment));
        }
        out
    }

    /// 5. Collapse runs of whitespace to a single space.
    pub fn collapse_whitespace(&self, text: &str) -> String {
        self.map_code(text, |code| whitespace_pattern().replace_all(code, " ").into_owned())
    }

    /// 6. Start each major clause on its own line. Only whitespace before a
    /// keyword becomes a line break; a keyword glued to the previous token
    /// is left as is.
    pub fn break_clauses(&self, text: &str) -> String {
        self.map_code(text, |code| {
            clause_pattern()
                .replace_all(code, |caps: &Captures| {
                    if caps[1].is_empty() {
                        caps[0].to_string()
                    } else {
                        format!("\n{}", &caps[2])
                    }
                })
                .into_owned()
        })
    }

    /// 7. Collapse blank lines and trim.
    pub fn final_cleanup(&self, text: &str) -> String {
        self.map_code(text, |code| blank_line_pattern().replace_all(code, "\n").into_owned())
            .trim()
            .to_string()
    }

    /// The first `SELECT` anywhere, up to the first `;` outside a literal.
    fn find_statement(&self, text: &str) -> Option<Range<usize>> {
        let start = select_pattern().find(text)?.start();
        let tail = &text[start..];
        let terminator = self
            .spans(tail)
            .into_iter()
            .filter(|s| s.kind == SpanKind::Code)
            .find_map(|s| tail[s.start..s.end].find(';').map(|offset| s.start + offset))?;
        Some(start..start + terminator + 1)
    }

    fn map_code<F>(&self, text: &str, f: F) -> String
    where
        F: Fn(&str) -> String,
    {
        let mut out = String::with_capacity(text.len());
        for span in self.spans(text) {
            let segment = &text[span.start..span.end];
            if span.kind == SpanKind::Code {
                out.push_str(&f(segment));
            } else {
                out.push_str(segment);
            }
        }
        out
    }

    /// Split text into code, string literals and quoted identifiers.
    /// An unterminated literal or identifier runs to the end of the text.
    fn spans(&self, text: &str) -> Vec<Span> {
        let ident_quote = self.dialect.identifier_quote();
        let literal_quotes = self.dialect.string_delimiters();
        let backslash_escapes = self.dialect == Dialect::MySql;

        let mut spans = Vec::new();
        let mut chars = text.char_indices().peekable();
        let mut code_start = 0;

        while let Some((i, c)) = chars.next() {
            let kind = if c == ident_quote {
                SpanKind::Identifier
            } else if literal_quotes.contains(&c) {
                SpanKind::Literal
            } else {
                continue;
            };

            if i > code_start {
                spans.push(Span { kind: SpanKind::Code, start: code_start, end: i });
            }

            let mut end = text.len();
            while let Some((j, d)) = chars.next() {
                if kind == SpanKind::Literal && backslash_escapes && d == '\\' {
                    chars.next();
                    continue;
                }
                if d == c {
                    // doubled quote is an escaped quote
                    if chars.peek().map(|&(_, next)| next) == Some(c) {
                        chars.next();
                        continue;
                    }
                    end = j + d.len_utf8();
                    break;
                }
            }
            spans.push(Span { kind, start: i, end });
            code_start = end;
        }

        if code_start < text.len() {
            spans.push(Span { kind: SpanKind::Code, start: code_start, end: text.len() });
        }
        spans
    }
}

/// Words that must stay quoted when used as identifiers.
const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "check", "cross", "default", "delete",
    "desc", "distinct", "else", "end", "exists", "from", "full", "group", "having", "in",
    "index", "inner", "insert", "into", "is", "join", "key", "left", "like", "limit", "not",
    "null", "on", "or", "order", "outer", "right", "select", "set", "table", "then", "union",
    "update", "values", "when", "where", "with",
];

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

fn is_plain_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.iter().any(|word| word.eq_ignore_ascii_case(name))
}

/// Sanitize with the default (MySQL) dialect.
pub fn sanitize(raw: &str) -> String {
    Sanitizer::default().sanitize(raw)
}
