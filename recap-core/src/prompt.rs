//! Prompt templates. Pure: `(kind, snapshot) → messages`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::SummaryKind;

/// Trades listed in an aggregate prompt are capped at this many.
pub const MAX_SAMPLE_TRADES: usize = 20;

/// First line of every trade prompt.
pub const TRADE_OPENING: &str = "Analyze this trade.";

const RESPONSE_CONTRACT: &str = "Respond with a single JSON object and nothing else, using exactly these keys: \
\"summaryText\" (string), \"plusPoints\" (array of strings), \"minusPoints\" (array of strings), \
\"aiSuggestions\" (array of strings).";

const TRADE_FIELDS: &[(&str, &str)] = &[
    ("symbol", "Symbol"),
    ("side", "Side"),
    ("quantity", "Quantity"),
    ("entryPrice", "Entry price"),
    ("exitPrice", "Exit price"),
    ("entryDate", "Entry date"),
    ("exitDate", "Exit date"),
    ("pnl", "P&L"),
    ("fees", "Fees"),
    ("strategy", "Strategy"),
    ("notes", "Notes"),
];

const AGGREGATE_FIELDS: &[(&str, &str)] = &[
    ("startDate", "Period start"),
    ("endDate", "Period end"),
    ("totalTrades", "Total trades"),
    ("wins", "Winning trades"),
    ("losses", "Losing trades"),
    ("winRate", "Win rate"),
    ("totalPnl", "Total P&L"),
    ("averageWin", "Average win"),
    ("averageLoss", "Average loss"),
    ("largestWin", "Largest win"),
    ("largestLoss", "Largest loss"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

pub fn build_messages(kind: SummaryKind, snapshot: &Value) -> Vec<ChatMessage> {
    match kind {
        SummaryKind::Trade => trade_messages(snapshot),
        SummaryKind::Weekly | SummaryKind::Monthly => aggregate_messages(kind.as_str(), snapshot),
    }
}

fn trade_messages(snapshot: &Value) -> Vec<ChatMessage> {
    let system = format!(
        "You are an experienced trading coach reviewing a single trade from a trader's journal. \
         Be specific and concise. {RESPONSE_CONTRACT}"
    );

    let mut user = format!("{TRADE_OPENING}\n");
    push_fields(&mut user, snapshot, TRADE_FIELDS);

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

fn aggregate_messages(period: &str, snapshot: &Value) -> Vec<ChatMessage> {
    let system = format!(
        "You are an experienced trading coach reviewing a trader's {period} performance. \
         Identify patterns across trades rather than commenting on each one. {RESPONSE_CONTRACT}"
    );

    let mut user = format!("Summarize this {period} trading period.\n");
    push_fields(&mut user, snapshot, AGGREGATE_FIELDS);

    if let Some(trades) = snapshot.get("trades").and_then(Value::as_array) {
        let shown = trades.len().min(MAX_SAMPLE_TRADES);
        user.push_str(&format!("\nSample of trades ({shown} of {}):\n", trades.len()));
        for trade in trades.iter().take(MAX_SAMPLE_TRADES) {
            user.push_str("- ");
            user.push_str(&trade_line(trade));
            user.push('\n');
        }
    }

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

fn push_fields(out: &mut String, snapshot: &Value, fields: &[(&str, &str)]) {
    for (key, label) in fields {
        if let Some(value) = snapshot.get(*key).and_then(render_scalar) {
            out.push_str(&format!("{label}: {value}\n"));
        }
    }
}

fn trade_line(trade: &Value) -> String {
    ["symbol", "side", "pnl", "strategy"]
        .iter()
        .filter_map(|key| trade.get(*key).and_then(render_scalar))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
