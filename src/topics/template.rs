//! RFC 6570 URI templates compiled to anchored regular expressions
//!
//! Only matching is supported (no expansion). A template like
//! `https://example.com/books/{id}` becomes `^https://example\.com/books/(?:...)$`.
//! Each expression is translated according to its operator:
//!
//! | Operator | Prefix | Separator | Allowed value chars |
//! |----------|--------|-----------|---------------------|
//! | (none)   |        | `,`       | unreserved          |
//! | `+`      |        | `,`       | unreserved + reserved |
//! | `#`      | `#`    | `,`       | unreserved + reserved |
//! | `.`      | `.`    | `.`       | unreserved          |
//! | `/`      | `/`    | `/`       | unreserved          |
//! | `;`      | `;`    | `;`       | unreserved (named)  |
//! | `?`      | `?`    | `&`       | unreserved (named)  |
//! | `&`      | `&`    | `&`       | unreserved (named)  |

use regex::Regex;
use std::fmt::Write;
use thiserror::Error;

const UNRESERVED: &str = r"[A-Za-z0-9\-._~]|%[0-9A-Fa-f]{2}";
const RESERVED: &str = r"[A-Za-z0-9\-._~:/?#\[\]@!$&'()*+,;=]|%[0-9A-Fa-f]{2}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicTemplateError {
    #[error("unterminated expression starting at offset {0}")]
    Unterminated(usize),

    #[error("nested '{{' at offset {0}")]
    Nested(usize),

    #[error("empty expression at offset {0}")]
    EmptyExpression(usize),

    #[error("invalid variable name '{0}'")]
    InvalidVariable(String),

    #[error("invalid prefix modifier '{0}'")]
    InvalidPrefix(String),

    #[error("compiled template is not a valid regex: {0}")]
    Regex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Simple,
    Reserved,
    Fragment,
    Label,
    Path,
    PathParam,
    Query,
    QueryContinuation,
}

impl Operator {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Reserved),
            '#' => Some(Self::Fragment),
            '.' => Some(Self::Label),
            '/' => Some(Self::Path),
            ';' => Some(Self::PathParam),
            '?' => Some(Self::Query),
            '&' => Some(Self::QueryContinuation),
            _ => None,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Simple | Self::Reserved => "",
            Self::Fragment => "#",
            Self::Label => r"\.",
            Self::Path => "/",
            Self::PathParam => ";",
            Self::Query => r"\?",
            Self::QueryContinuation => "&",
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Self::Simple | Self::Reserved | Self::Fragment => ",",
            Self::Label => r"\.",
            Self::Path => "/",
            Self::PathParam => ";",
            Self::Query | Self::QueryContinuation => "&",
        }
    }

    fn named(self) -> bool {
        matches!(self, Self::PathParam | Self::Query | Self::QueryContinuation)
    }

    fn value_class(self) -> &'static str {
        match self {
            Self::Reserved | Self::Fragment => RESERVED,
            _ => UNRESERVED,
        }
    }
}

#[derive(Debug)]
struct VarSpec {
    name: String,
    explode: bool,
}

/// A parsed URI template, ready to match topics
#[derive(Debug, Clone)]
pub struct TopicTemplate {
    source: String,
    regex: Regex,
}

impl TopicTemplate {
    /// Parse a template and compile its matching regex
    pub fn parse(template: &str) -> Result<Self, TopicTemplateError> {
        let pattern = compile(template)?;
        let regex = Regex::new(&pattern).map_err(|e| TopicTemplateError::Regex(e.to_string()))?;

        Ok(Self {
            source: template.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Check if a topic can be produced by expanding this template
    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }
}

/// Translate a template into an anchored regex pattern
fn compile(template: &str) -> Result<String, TopicTemplateError> {
    let mut pattern = String::with_capacity(template.len() * 2);
    pattern.push('^');

    let mut rest = template;
    let mut offset = 0;

    while let Some(open) = rest.find('{') {
        pattern.push_str(&regex::escape(&rest[..open]));

        let body_start = open + 1;
        let close = rest[body_start..]
            .find('}')
            .map(|i| body_start + i)
            .ok_or(TopicTemplateError::Unterminated(offset + open))?;

        let body = &rest[body_start..close];
        if let Some(nested) = body.find('{') {
            return Err(TopicTemplateError::Nested(offset + body_start + nested));
        }

        compile_expression(body, offset + open, &mut pattern)?;

        offset += close + 1;
        rest = &rest[close + 1..];
    }

    pattern.push_str(&regex::escape(rest));
    pattern.push('$');

    Ok(pattern)
}

fn compile_expression(
    body: &str,
    offset: usize,
    pattern: &mut String,
) -> Result<(), TopicTemplateError> {
    let mut chars = body.chars();
    let op = match chars.next() {
        None => return Err(TopicTemplateError::EmptyExpression(offset)),
        Some(c) => Operator::from_char(c),
    };

    let var_list = match op {
        Some(_) => &body[1..],
        None => body,
    };
    let op = op.unwrap_or(Operator::Simple);

    if var_list.is_empty() {
        return Err(TopicTemplateError::EmptyExpression(offset));
    }

    let specs = var_list
        .split(',')
        .map(parse_varspec)
        .collect::<Result<Vec<_>, _>>()?;

    let value = format!("(?:{})*", op.value_class());

    let item = if op.named() {
        let names = specs
            .iter()
            .map(|s| regex::escape(&s.name))
            .collect::<Vec<_>>()
            .join("|");
        // Exploded maps render arbitrary keys instead of the variable name
        let key = if specs.iter().any(|s| s.explode) {
            format!("(?:{}|(?:{})+)", names, UNRESERVED)
        } else {
            format!("(?:{})", names)
        };
        format!("{}(?:={})?", key, value)
    } else {
        value
    };

    // Undefined variables are omitted entirely, so the whole expression is optional
    let _ = write!(
        pattern,
        "(?:{prefix}{item}(?:{sep}{item})*)?",
        prefix = op.prefix(),
        item = item,
        sep = op.separator(),
    );

    Ok(())
}

fn parse_varspec(spec: &str) -> Result<VarSpec, TopicTemplateError> {
    let (name, explode) = match spec.strip_suffix('*') {
        Some(name) => (name, true),
        None => (spec, false),
    };

    let name = match name.split_once(':') {
        Some((name, max_len)) => {
            let valid = !max_len.is_empty()
                && max_len.len() <= 4
                && max_len.chars().all(|c| c.is_ascii_digit())
                && !max_len.starts_with('0');
            if !valid || explode {
                return Err(TopicTemplateError::InvalidPrefix(spec.to_string()));
            }
            name
        }
        None => name,
    };

    if !is_valid_varname(name) {
        return Err(TopicTemplateError::InvalidVariable(spec.to_string()));
    }

    Ok(VarSpec {
        name: name.to_string(),
        explode,
    })
}

/// varname = varchar *( ["."] varchar ), varchar = ALPHA / DIGIT / "_" / pct-encoded
fn is_valid_varname(name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return false;
    }

    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                if !matches!(hex, Some(h) if h.iter().all(u8::is_ascii_hexdigit)) {
                    return false;
                }
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' => i += 1,
            _ => return false,
        }
    }

    true
}
