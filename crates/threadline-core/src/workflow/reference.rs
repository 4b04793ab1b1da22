//! Variable reference grammar.
//!
//! Steps read each other's outputs through references of the form
//!
//! ```text
//! @{step_id}.key.nested[0],cycle|default
//! ```
//!
//! - `@{SESSION_ID}.step.key` is accepted as a session-scoped spelling of
//!   `@{step}.key`.
//! - The path is a sequence of `.key` segments and `[n]` indexes.
//! - `,n` selects a cycle of the step (negative values count back from the
//!   newest); without it the newest output is used.
//! - `|default` supplies a fallback: another reference, a quoted JSON
//!   string, a JSON object/array, or a bare literal typed as bool, null,
//!   number or string.
//! - `\@`, `\{`, `\}`, `\|` and `\\` escape the literal character.
//!
//! Parsing produces a typed AST (`Template` / `VariableRef`) so resolution
//! never deals with raw strings.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Reference id that scopes the first path segment as a step id.
pub const SESSION_PLACEHOLDER: &str = "SESSION_ID";

const ESCAPABLE: &[char] = &['@', '{', '}', '|', '\\'];

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// One step of a path into a step output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Fallback used when a reference's path is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Literal(Value),
    Reference(Box<VariableRef>),
}

/// A parsed `@{step}.path,cycle|default` reference.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableRef {
    pub step_id: String,
    pub path: Vec<PathSegment>,
    pub cycle: Option<i64>,
    pub default: Option<DefaultValue>,
}

/// A fragment of a template string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Reference(VariableRef),
}

/// A string with zero or more embedded references.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    pub parts: Vec<TemplatePart>,
}

impl Template {
    /// The reference when the template is exactly one reference and nothing else.
    pub fn single_reference(&self) -> Option<&VariableRef> {
        match self.parts.as_slice() {
            [TemplatePart::Reference(reference)] => Some(reference),
            _ => None,
        }
    }

    pub fn references(&self) -> impl Iterator<Item = &VariableRef> {
        self.parts.iter().filter_map(|part| match part {
            TemplatePart::Reference(reference) => Some(reference),
            TemplatePart::Text(_) => None,
        })
    }

    pub fn has_references(&self) -> bool {
        self.references().next().is_some()
    }
}

impl fmt::Display for VariableRef {
    /// Canonical spelling; parsing the output yields an equal reference.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{{{}}}", self.step_id)?;
        for segment in &self.path {
            match segment {
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        if let Some(cycle) = self.cycle {
            write!(f, ",{cycle}")?;
        }
        match &self.default {
            Some(DefaultValue::Literal(value)) => write!(f, "|{value}"),
            Some(DefaultValue::Reference(inner)) => write!(f, "|{inner}"),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while parsing reference expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("expected a reference starting with '@{{' at offset {0}")]
    NotAReference(usize),

    #[error("unterminated reference starting at offset {0}")]
    Unterminated(usize),

    #[error("empty step id in reference at offset {0}")]
    EmptyStepId(usize),

    #[error("SESSION_ID reference at offset {0} does not name a step")]
    MissingScopedStep(usize),

    #[error("invalid default at offset {offset}: {reason}")]
    InvalidDefault { offset: usize, reason: String },

    #[error("unexpected trailing text '{0}'")]
    TrailingText(String),
}

// ---------------------------------------------------------------------------
// Public parsing API
// ---------------------------------------------------------------------------

/// Parse an expression that may be a lone reference or a template.
///
/// A lone reference keeps the standalone default rules (a bare default runs
/// to the end of the expression); anything else is parsed as a template.
pub fn parse_expression(input: &str) -> Result<Template, ReferenceError> {
    match parse_reference(input) {
        Ok(reference) => Ok(Template {
            parts: vec![TemplatePart::Reference(reference)],
        }),
        Err(_) => parse_template(input),
    }
}

/// Parse exactly one reference spanning the whole (trimmed) input.
pub fn parse_reference(input: &str) -> Result<VariableRef, ReferenceError> {
    let mut cursor = Cursor::new(input.trim());
    let reference = parse_reference_at(&mut cursor, DefaultMode::Standalone)?;
    if !cursor.is_eof() {
        return Err(ReferenceError::TrailingText(cursor.rest().to_string()));
    }
    Ok(reference)
}

/// Parse a reference at the start of `input`, returning the unparsed rest.
///
/// Bare defaults stop at whitespace, so `@{s}.n|0 > 3` yields the reference
/// and `" > 3"`.
pub fn parse_reference_prefix(input: &str) -> Result<(VariableRef, &str), ReferenceError> {
    let mut cursor = Cursor::new(input);
    let reference = parse_reference_at(&mut cursor, DefaultMode::Embedded)?;
    Ok((reference, cursor.rest()))
}

/// Parse a template string with embedded references.
pub fn parse_template(input: &str) -> Result<Template, ReferenceError> {
    let mut cursor = Cursor::new(input);
    let mut parts = Vec::new();
    let mut text = String::new();

    while let Some(c) = cursor.peek() {
        if c == '\\' {
            if let Some(next) = cursor.peek_second().filter(|n| ESCAPABLE.contains(n)) {
                text.push(next);
                cursor.bump();
                cursor.bump();
                continue;
            }
        }
        if cursor.at_reference() {
            if !text.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut text)));
            }
            let reference = parse_reference_at(&mut cursor, DefaultMode::Embedded)?;
            parts.push(TemplatePart::Reference(reference));
            continue;
        }
        text.push(c);
        cursor.bump();
    }

    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }
    Ok(Template { parts })
}

/// Whether a string could contain a reference or an escape and needs parsing.
pub fn needs_parsing(input: &str) -> bool {
    input.contains('@') || input.contains('\\')
}

/// Type a bare literal: booleans (any case), null, numbers, else string.
pub fn parse_literal(text: &str) -> Value {
    let trimmed = text.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Parser internals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefaultMode {
    /// Inside a larger string: bare defaults end at whitespace.
    Embedded,
    /// The reference is the whole expression: bare defaults run to the end.
    Standalone,
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn at_reference(&self) -> bool {
        self.rest().starts_with("@{")
    }

    fn take_digits(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        &self.src[start..self.pos]
    }
}

fn parse_reference_at(
    cursor: &mut Cursor<'_>,
    mode: DefaultMode,
) -> Result<VariableRef, ReferenceError> {
    let start = cursor.pos;
    if !cursor.eat("@{") {
        return Err(ReferenceError::NotAReference(start));
    }

    let mut id = String::new();
    loop {
        match cursor.bump() {
            None => return Err(ReferenceError::Unterminated(start)),
            Some('}') => break,
            Some(c) => id.push(c),
        }
    }
    let id = id.trim();
    if id.is_empty() {
        return Err(ReferenceError::EmptyStepId(start));
    }

    let mut path = parse_path(cursor);
    let step_id = if id == SESSION_PLACEHOLDER {
        match path.first() {
            Some(PathSegment::Key(step)) => {
                let step = step.clone();
                path.remove(0);
                step
            }
            _ => return Err(ReferenceError::MissingScopedStep(start)),
        }
    } else {
        id.to_string()
    };

    let cycle = parse_cycle(cursor);
    let default = if cursor.eat("|") {
        Some(parse_default(cursor, mode)?)
    } else {
        None
    };

    Ok(VariableRef {
        step_id,
        path,
        cycle,
        default,
    })
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn parse_path(cursor: &mut Cursor<'_>) -> Vec<PathSegment> {
    let mut path = Vec::new();
    loop {
        match cursor.peek() {
            // A trailing '.' that starts no key is sentence punctuation.
            Some('.') if cursor.peek_second().is_some_and(is_key_char) => {
                cursor.bump();
                let mut key = String::new();
                while let Some(c) = cursor.peek().filter(|c| is_key_char(*c)) {
                    key.push(c);
                    cursor.bump();
                }
                path.push(PathSegment::Key(key));
            }
            Some('[') => {
                let save = cursor.pos;
                cursor.bump();
                let digits = cursor.take_digits();
                match digits.parse::<usize>() {
                    Ok(index) if cursor.eat("]") => path.push(PathSegment::Index(index)),
                    _ => {
                        cursor.pos = save;
                        break;
                    }
                }
            }
            _ => break,
        }
    }
    path
}

fn parse_cycle(cursor: &mut Cursor<'_>) -> Option<i64> {
    if cursor.peek() != Some(',') {
        return None;
    }
    let save = cursor.pos;
    cursor.bump();
    while cursor.peek() == Some(' ') {
        cursor.bump();
    }
    let negative = cursor.eat("-");
    match cursor.take_digits().parse::<i64>() {
        Ok(n) => Some(if negative { -n } else { n }),
        Err(_) => {
            cursor.pos = save;
            None
        }
    }
}

fn parse_default(
    cursor: &mut Cursor<'_>,
    mode: DefaultMode,
) -> Result<DefaultValue, ReferenceError> {
    let offset = cursor.pos;
    match cursor.peek() {
        Some('@') if cursor.peek_second() == Some('{') => Ok(DefaultValue::Reference(Box::new(
            parse_reference_at(cursor, mode)?,
        ))),
        Some('"') => {
            let raw = scan_quoted(cursor).ok_or_else(|| ReferenceError::InvalidDefault {
                offset,
                reason: "unterminated string".to_string(),
            })?;
            serde_json::from_str::<Value>(raw)
                .map(DefaultValue::Literal)
                .map_err(|e| ReferenceError::InvalidDefault {
                    offset,
                    reason: e.to_string(),
                })
        }
        Some('{') | Some('[') => {
            let raw = scan_balanced(cursor).ok_or_else(|| ReferenceError::InvalidDefault {
                offset,
                reason: "unbalanced brackets".to_string(),
            })?;
            Ok(DefaultValue::Literal(
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
            ))
        }
        _ => {
            let stop_at_whitespace =
                mode == DefaultMode::Embedded || contains_unescaped_reference(cursor.rest());
            Ok(DefaultValue::Literal(parse_literal(&scan_bare(
                cursor,
                stop_at_whitespace,
            ))))
        }
    }
}

fn scan_quoted<'a>(cursor: &mut Cursor<'a>) -> Option<&'a str> {
    let start = cursor.pos;
    cursor.bump();
    loop {
        match cursor.bump() {
            None => {
                cursor.pos = start;
                return None;
            }
            Some('\\') => {
                cursor.bump();
            }
            Some('"') => return Some(&cursor.src[start..cursor.pos]),
            Some(_) => {}
        }
    }
}

fn scan_balanced<'a>(cursor: &mut Cursor<'a>) -> Option<&'a str> {
    let start = cursor.pos;
    let mut depth = 0usize;
    let mut in_string = false;
    while let Some(c) = cursor.bump() {
        if in_string {
            match c {
                '\\' => {
                    cursor.bump();
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&cursor.src[start..cursor.pos]);
                }
            }
            _ => {}
        }
    }
    cursor.pos = start;
    None
}

fn scan_bare(cursor: &mut Cursor<'_>, stop_at_whitespace: bool) -> String {
    let mut text = String::new();
    while let Some(c) = cursor.peek() {
        if (stop_at_whitespace && c.is_whitespace()) || cursor.at_reference() {
            break;
        }
        if c == '\\' {
            if let Some(next) = cursor.peek_second().filter(|n| ESCAPABLE.contains(n)) {
                text.push(next);
                cursor.bump();
                cursor.bump();
                continue;
            }
        }
        text.push(c);
        cursor.bump();
    }
    text
}

fn contains_unescaped_reference(input: &str) -> bool {
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '@' if chars.peek() == Some(&'{') => return true,
            _ => {}
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> PathSegment {
        PathSegment::Key(k.to_string())
    }

    #[test]
    fn test_parse_simple_reference() {
        let r = parse_reference("@{ask}.response").unwrap();
        assert_eq!(r.step_id, "ask");
        assert_eq!(r.path, vec![key("response")]);
        assert_eq!(r.cycle, None);
        assert_eq!(r.default, None);
    }

    #[test]
    fn test_parse_nested_path_and_index() {
        let r = parse_reference("@{extract}.entities[1].name").unwrap();
        assert_eq!(
            r.path,
            vec![key("entities"), PathSegment::Index(1), key("name")]
        );
    }

    #[test]
    fn test_parse_cycle_index() {
        assert_eq!(parse_reference("@{loop}.n,0").unwrap().cycle, Some(0));
        assert_eq!(parse_reference("@{loop}.n, 2").unwrap().cycle, Some(2));
        assert_eq!(parse_reference("@{loop}.n,-1").unwrap().cycle, Some(-1));
    }

    #[test]
    fn test_parse_typed_bare_defaults() {
        let default = |expr: &str| parse_reference(expr).unwrap().default;
        assert_eq!(
            default("@{a}.flag|true"),
            Some(DefaultValue::Literal(json!(true)))
        );
        assert_eq!(
            default("@{a}.flag|FALSE"),
            Some(DefaultValue::Literal(json!(false)))
        );
        assert_eq!(default("@{a}.n|42"), Some(DefaultValue::Literal(json!(42))));
        assert_eq!(default("@{a}.n|2.5"), Some(DefaultValue::Literal(json!(2.5))));
        assert_eq!(default("@{a}.n|null"), Some(DefaultValue::Literal(Value::Null)));
        assert_eq!(
            default("@{a}.name|dear friend"),
            Some(DefaultValue::Literal(json!("dear friend")))
        );
        assert_eq!(default("@{a}.name|"), Some(DefaultValue::Literal(json!(""))));
    }

    #[test]
    fn test_parse_quoted_and_json_defaults() {
        let r = parse_reference(r#"@{a}.name|"x | y""#).unwrap();
        assert_eq!(r.default, Some(DefaultValue::Literal(json!("x | y"))));

        let r = parse_reference(r#"@{a}.cfg|{"retries": 3, "on": true}"#).unwrap();
        assert_eq!(
            r.default,
            Some(DefaultValue::Literal(json!({"retries": 3, "on": true})))
        );

        let r = parse_reference("@{a}.items|[1, 2]").unwrap();
        assert_eq!(r.default, Some(DefaultValue::Literal(json!([1, 2]))));
    }

    #[test]
    fn test_parse_chained_default() {
        let r = parse_reference("@{a}.name|@{b}.name|anonymous").unwrap();
        match r.default {
            Some(DefaultValue::Reference(inner)) => {
                assert_eq!(inner.step_id, "b");
                assert_eq!(
                    inner.default,
                    Some(DefaultValue::Literal(json!("anonymous")))
                );
            }
            other => panic!("expected nested reference default, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_session_scoped_reference() {
        let r = parse_reference("@{SESSION_ID}.ask.response").unwrap();
        assert_eq!(r.step_id, "ask");
        assert_eq!(r.path, vec![key("response")]);

        assert_eq!(
            parse_reference("@{SESSION_ID}"),
            Err(ReferenceError::MissingScopedStep(0))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_reference("@{ask.response"),
            Err(ReferenceError::Unterminated(0))
        ));
        assert!(matches!(
            parse_reference("@{ }.x"),
            Err(ReferenceError::EmptyStepId(0))
        ));
        assert!(matches!(
            parse_reference("ask.response"),
            Err(ReferenceError::NotAReference(0))
        ));
        assert!(matches!(
            parse_reference("@{a}.x and more"),
            Err(ReferenceError::TrailingText(_))
        ));
        assert!(matches!(
            parse_reference(r#"@{a}.x|"open"#),
            Err(ReferenceError::InvalidDefault { .. })
        ));
    }

    #[test]
    fn test_template_with_embedded_references() {
        let t = parse_template("Hello, @{ask}.name! You are @{age}.years,0 years old.").unwrap();
        assert_eq!(t.references().count(), 2);
        assert_eq!(
            t.parts[0],
            TemplatePart::Text("Hello, ".to_string())
        );
        assert_eq!(t.parts[2], TemplatePart::Text("! You are ".to_string()));
        match &t.parts[3] {
            TemplatePart::Reference(r) => assert_eq!(r.cycle, Some(0)),
            other => panic!("expected reference, got {other:?}"),
        }
        assert_eq!(t.parts[4], TemplatePart::Text(" years old.".to_string()));
    }

    #[test]
    fn test_template_trailing_period_is_text() {
        let t = parse_template("Bye @{ask}.name.").unwrap();
        match &t.parts[1] {
            TemplatePart::Reference(r) => assert_eq!(r.path, vec![key("name")]),
            other => panic!("expected reference, got {other:?}"),
        }
        assert_eq!(t.parts[2], TemplatePart::Text(".".to_string()));
    }

    #[test]
    fn test_template_comma_without_digits_is_text() {
        let t = parse_template("@{ask}.name, welcome").unwrap();
        assert_eq!(t.parts.len(), 2);
        assert_eq!(t.parts[1], TemplatePart::Text(", welcome".to_string()));
    }

    #[test]
    fn test_embedded_bare_default_ends_at_whitespace() {
        let t = parse_template("Hi @{ask}.name|friend how are you").unwrap();
        match &t.parts[1] {
            TemplatePart::Reference(r) => {
                assert_eq!(r.default, Some(DefaultValue::Literal(json!("friend"))))
            }
            other => panic!("expected reference, got {other:?}"),
        }
        assert_eq!(t.parts[2], TemplatePart::Text(" how are you".to_string()));
    }

    #[test]
    fn test_escaped_reference_is_literal_text() {
        let t = parse_template(r"Type \@{name} to \{ok\} \\ done").unwrap();
        assert!(!t.has_references());
        assert_eq!(
            t.parts,
            vec![TemplatePart::Text(r"Type @{name} to {ok} \ done".to_string())]
        );
    }

    #[test]
    fn test_escaped_pipe_in_bare_default() {
        let r = parse_reference(r"@{a}.x|left\|right").unwrap();
        assert_eq!(r.default, Some(DefaultValue::Literal(json!("left|right"))));
    }

    #[test]
    fn test_parse_expression_prefers_standalone_reference() {
        let t = parse_expression("@{ask}.name|dear friend").unwrap();
        let r = t.single_reference().unwrap();
        assert_eq!(r.default, Some(DefaultValue::Literal(json!("dear friend"))));

        let t = parse_expression("@{a}.x|none @{b}.y").unwrap();
        assert!(t.single_reference().is_none());
        assert_eq!(t.references().count(), 2);

        let t = parse_expression("plain text").unwrap();
        assert!(!t.has_references());
    }

    #[test]
    fn test_parse_reference_prefix_returns_rest() {
        let (r, rest) = parse_reference_prefix("@{score}.value|0 >= 3").unwrap();
        assert_eq!(r.step_id, "score");
        assert_eq!(r.default, Some(DefaultValue::Literal(json!(0))));
        assert_eq!(rest, " >= 3");
    }

    #[test]
    fn test_display_roundtrips_through_parser() {
        for expr in [
            "@{a}.x",
            "@{a}.items[2].name,1",
            "@{a}.x|\"hello world\"",
            "@{a}.x|@{b}.y|3",
            "@{a}.cfg|{\"k\":true}",
        ] {
            let parsed = parse_reference(expr).unwrap();
            let reparsed = parse_reference(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "roundtrip failed for {expr}");
        }
    }

    #[test]
    fn test_parse_literal_types() {
        assert_eq!(parse_literal(" True "), json!(true));
        assert_eq!(parse_literal("-7"), json!(-7));
        assert_eq!(parse_literal("1e3"), json!(1000.0));
        assert_eq!(parse_literal("NaN"), json!("NaN"));
        assert_eq!(parse_literal("yes"), json!("yes"));
    }
}
