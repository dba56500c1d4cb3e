//! Tolerant extraction of the canonical summary shape from model text.
//!
//! Models wrap JSON in fences, prepend prose, use curly or single quotes,
//! leave trailing commas and forget to quote keys. `parse` tries a strict
//! parse first and only falls back to isolation + repair when that fails.
//! It never panics and never errors: the worst outcome is `None`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::models::SummaryFields;

const SUMMARY_KEYS: &[&str] = &[
    "summaryText",
    "summary_text",
    "summary",
    "narrative",
    "text",
    "overview",
    "analysis",
];
const PLUS_KEYS: &[&str] = &[
    "plusPoints",
    "plus_points",
    "positives",
    "advantages",
    "strengths",
    "pros",
];
const MINUS_KEYS: &[&str] = &[
    "minusPoints",
    "minus_points",
    "negatives",
    "disadvantages",
    "weaknesses",
    "cons",
    "mistakes",
];
const SUGGESTION_KEYS: &[&str] = &[
    "aiSuggestions",
    "ai_suggestions",
    "suggestions",
    "recommendations",
    "improvements",
    "tips",
];
const STATS_KEYS: &[&str] = &["weeklyStats", "weekly_stats", "stats", "statistics"];

/// Keys tried, in order, when a list item arrives as an object.
const ITEM_TEXT_KEYS: &[&str] = &["text", "point", "description", "title", "suggestion"];

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```[A-Za-z0-9_-]*").expect("valid fence regex"))
}

fn greedy_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid block regex"))
}

fn numbered_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+[.)]\s*").expect("valid numbering regex"))
}

/// Parse and normalize. `None` only when no structured object can be recovered.
pub fn parse(raw: &str) -> Option<SummaryFields> {
    match parse_value(raw)? {
        Value::Object(map) => Some(normalize(&map)),
        // Some gateways double-encode: a JSON string holding the JSON object.
        Value::String(inner) => match parse_value(&inner) {
            Some(Value::Object(map)) => Some(normalize(&map)),
            _ if !inner.trim().is_empty() => Some(SummaryFields {
                summary_text: inner.trim().to_string(),
                ..Default::default()
            }),
            _ => None,
        },
        _ => None,
    }
}

/// The structured value before normalization. Valid JSON comes back exactly
/// as `serde_json::from_str` would return it.
pub fn parse_value(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }

    let cleaned = clean_text(raw);
    let candidate = balanced_object(&cleaned).or_else(|| greedy_object(&cleaned))?;

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }

    let repaired = repair(candidate);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "Model reply could not be repaired into JSON");
            None
        }
    }
}

pub fn strip_fences(raw: &str) -> String {
    fence_re().replace_all(raw, "").into_owned()
}

/// Strip markdown fences and straighten typographic quotes.
pub fn clean_text(raw: &str) -> String {
    strip_fences(raw)
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// From the first `{`, the shortest prefix whose braces balance, ignoring
/// braces inside quoted strings.
pub fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }

        match ch {
            '"' | '\'' => quote = Some(ch),
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

fn greedy_object(text: &str) -> Option<&str> {
    greedy_block_re().find(text).map(|m| m.as_str())
}

/// Fix trailing commas, single-quoted strings and bare keys in one pass.
/// Double-quoted strings are copied through untouched.
pub fn repair(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut last_significant: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '"' => {
                i = copy_double_quoted(&chars, i, &mut out);
                last_significant = Some('"');
            }
            '\'' => {
                i = convert_single_quoted(&chars, i, &mut out);
                last_significant = Some('"');
            }
            ',' if matches!(next_significant(&chars, i + 1), Some('}') | Some(']')) => {
                i += 1;
            }
            c if is_ident_start(c) && matches!(last_significant, Some('{') | Some(',')) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if next_significant(&chars, i) == Some(':') {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
                last_significant = Some('a');
            }
            c => {
                out.push(c);
                if !c.is_whitespace() {
                    last_significant = Some(c);
                }
                i += 1;
            }
        }
    }

    out
}

fn copy_double_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        i += 1;
        if c == '\\' {
            if let Some(&next) = chars.get(i) {
                out.push(next);
                i += 1;
            }
        } else if c == '"' {
            break;
        }
    }
    i
}

fn convert_single_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                match chars.get(i + 1) {
                    Some('\'') => out.push('\''),
                    Some(&next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push_str("\\\\"),
                }
                i += 2;
            }
            '\'' => {
                i += 1;
                break;
            }
            '"' => {
                out.push_str("\\\"");
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    out.push('"');
    i.min(chars.len())
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars.iter().skip(from).copied().find(|c| !c.is_whitespace())
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Map synonym keys onto the canonical shape. Missing fields become empty.
pub fn normalize(map: &Map<String, Value>) -> SummaryFields {
    SummaryFields {
        summary_text: pick(map, SUMMARY_KEYS).map(text_of).unwrap_or_default(),
        plus_points: pick(map, PLUS_KEYS).map(list_of).unwrap_or_default(),
        minus_points: pick(map, MINUS_KEYS).map(list_of).unwrap_or_default(),
        ai_suggestions: pick(map, SUGGESTION_KEYS).map(list_of).unwrap_or_default(),
        weekly_stats: pick(map, STATS_KEYS).cloned(),
    }
}

/// First key (exact, then ASCII-case-insensitive) with a non-null value.
fn pick<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        if let Some(value) = map.get(*key).filter(|v| !v.is_null()) {
            return Some(value);
        }
    }
    keys.iter().find_map(|key| {
        map.iter()
            .find(|(k, v)| k.eq_ignore_ascii_case(key) && !v.is_null())
            .map(|(_, v)| v)
    })
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(item_text)
            .collect::<Vec<_>>()
            .join(" "),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(_) => item_text(value).unwrap_or_default(),
        Value::Null => String::new(),
    }
}

fn list_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(item_text).collect(),
        Value::String(s) => split_list(s),
        Value::Null => Vec::new(),
        other => item_text(other).into_iter().collect(),
    }
}

fn item_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(map) => match pick(map, ITEM_TEXT_KEYS) {
            Some(Value::String(s)) => s.trim().to_string(),
            _ => value.to_string(),
        },
        Value::Array(_) | Value::Null => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Split a newline- or bullet-delimited string into trimmed items.
fn split_list(s: &str) -> Vec<String> {
    s.lines()
        .flat_map(|line| line.split('•'))
        .map(|piece| {
            let piece = piece.trim().trim_start_matches(['-', '*', '·', '–', '—']).trim();
            numbered_prefix_re().replace(piece, "").trim().to_string()
        })
        .filter(|piece| !piece.is_empty())
        .collect()
}
