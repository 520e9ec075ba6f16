//! Key templates and key resolution.
//!
//! Templates are literal text with `:identifier` placeholders. A `.` followed
//! by an identifier character extends the placeholder into a nested property
//! path (`:user.id`). A doubled sigil (`::`) emits one literal `:`.
//!
//! Placeholder positions are extracted once by [`KeyTemplate::parse`];
//! resolution then only walks the pre-split segments.

use crate::args::{ArgumentExtractor, BoundArgs, PathExtractor};
use crate::constants::{PLACEHOLDER_SIGIL, RESULT_ALIAS};
use crate::error::TemplateError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// A `:root.path.to.field` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placeholder {
    pub root: String,
    pub path: Vec<String>,
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// A parsed key or version-key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    text: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    /// Parse `text`, extracting placeholder positions.
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let segments = tokenize(&text);
        Self { text, segments }
    }

    /// Apply positional `{n}` substitution, then parse.
    pub fn parse_with_tables(text: &str, tables: &[String]) -> Result<Self, TemplateError> {
        Ok(Self::parse(format_positional(text, tables)?))
    }

    /// The template text as written (after positional substitution).
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p),
            Segment::Literal(_) => None,
        })
    }

    /// Distinct placeholder roots, in order of first appearance.
    pub fn roots(&self) -> Vec<&str> {
        let mut roots: Vec<&str> = Vec::new();
        for p in self.placeholders() {
            if !roots.contains(&p.root.as_str()) {
                roots.push(p.root.as_str());
            }
        }
        roots
    }

    /// True if any placeholder is rooted at the reserved `result` alias.
    pub fn references_result(&self) -> bool {
        self.placeholders().any(|p| p.root == RESULT_ALIAS)
    }

    /// True if every placeholder is rooted at `result` (vacuously true for
    /// templates without placeholders).
    pub fn only_references_result(&self) -> bool {
        self.placeholders().all(|p| p.root == RESULT_ALIAS)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(text: &str) -> Vec<Segment> {
    let chars: Vec<char> = text.chars().collect();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c != PLACEHOLDER_SIGIL {
            literal.push(c);
            i += 1;
            continue;
        }

        match chars.get(i + 1) {
            Some(&next) if next == PLACEHOLDER_SIGIL => {
                literal.push(PLACEHOLDER_SIGIL);
                i += 2;
            }
            Some(&next) if is_ident_start(next) => {
                let mut j = i + 1;
                let root = take_ident(&chars, &mut j);
                let mut path = Vec::new();
                while j + 1 < chars.len() && chars[j] == '.' && is_ident_char(chars[j + 1]) {
                    j += 1;
                    path.push(take_ident(&chars, &mut j));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(Placeholder { root, path }));
                i = j;
            }
            _ => {
                literal.push(c);
                i += 1;
            }
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn take_ident(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && is_ident_char(chars[*pos]) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

/// Replace positional `{n}` markers with `tables[n]`.
///
/// Used for dynamic table/collection names. Runs before placeholder parsing
/// and knows nothing about cache keys. Braces that do not enclose a decimal
/// index are kept verbatim.
pub fn format_positional(text: &str, tables: &[String]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let digits = after.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 && after[digits..].starts_with('}') {
            let index: usize = after[..digits].parse().map_err(|_| TemplateError::UnknownPosition {
                template: text.to_string(),
                index: usize::MAX,
                available: tables.len(),
            })?;
            let table = tables.get(index).ok_or_else(|| TemplateError::UnknownPosition {
                template: text.to_string(),
                index,
                available: tables.len(),
            })?;
            out.push_str(table);
            rest = &after[digits + 1..];
        } else {
            out.push('{');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Renders templates against bound arguments.
#[derive(Clone)]
pub struct KeyResolver {
    extractor: Arc<dyn ArgumentExtractor>,
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new(Arc::new(PathExtractor))
    }
}

impl fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyResolver").finish_non_exhaustive()
    }
}

impl KeyResolver {
    pub fn new(extractor: Arc<dyn ArgumentExtractor>) -> Self {
        Self { extractor }
    }

    /// Resolve `template` against the call arguments.
    ///
    /// Missing and null values are errors; a key must never silently collapse
    /// onto another logical result's key.
    pub fn resolve(&self, template: &KeyTemplate, args: &BoundArgs) -> Result<String, TemplateError> {
        let mut key = String::with_capacity(template.text().len() + 16);
        for segment in template.segments() {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Placeholder(p) => {
                    let value = self
                        .extractor
                        .extract(args, &p.root, &p.path)
                        .ok_or_else(|| unresolved(template, p))?;
                    render(&value, &mut key).ok_or_else(|| unresolved(template, p))?;
                }
            }
        }
        Ok(key)
    }

    /// Resolve `template` with `value` bound as the reserved `result` alias.
    pub fn resolve_with_result(&self, template: &KeyTemplate, value: &Value) -> Result<String, TemplateError> {
        self.resolve(template, &BoundArgs::for_result(value.clone()))
    }
}

fn unresolved(template: &KeyTemplate, placeholder: &Placeholder) -> TemplateError {
    TemplateError::Unresolved {
        template: template.text().to_string(),
        placeholder: placeholder.to_string(),
    }
}

fn render(value: &Value, out: &mut String) -> Option<()> {
    match value {
        Value::Null => return None,
        Value::String(s) => out.push_str(s),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Array(_) | Value::Object(_) => out.push_str(&value.to_string()),
    }
    Some(())
}
