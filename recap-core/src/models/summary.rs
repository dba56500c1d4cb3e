use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error messages stored on a record are capped at this many characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Trade,
    Weekly,
    Monthly,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::Trade => "trade",
            SummaryKind::Weekly => "weekly",
            SummaryKind::Monthly => "monthly",
        }
    }

    /// Weekly and monthly share the aggregate template and differ only by label.
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, SummaryKind::Trade)
    }

    /// Text stored in `summaryText` when the reply could not be parsed.
    pub fn fallback_summary(&self) -> &'static str {
        match self {
            SummaryKind::Trade => "Trade analysis (fallback).",
            SummaryKind::Weekly | SummaryKind::Monthly => "Summary (fallback).",
        }
    }
}

impl fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(SummaryKind::Trade),
            "weekly" => Ok(SummaryKind::Weekly),
            "monthly" => Ok(SummaryKind::Monthly),
            other => Err(format!("unknown summary kind: {other}")),
        }
    }
}

/// Record lifecycle. Only ever advances: draft → processing → {ready | failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Draft,
    Processing,
    Ready,
    Failed,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Draft => "draft",
            SummaryStatus::Processing => "processing",
            SummaryStatus::Ready => "ready",
            SummaryStatus::Failed => "failed",
        }
    }

    /// Ready and failed share a rank, so a redelivered job may move a record
    /// between them (last write wins) but never back to processing.
    pub fn rank(&self) -> u8 {
        match self {
            SummaryStatus::Draft => 0,
            SummaryStatus::Processing => 1,
            SummaryStatus::Ready | SummaryStatus::Failed => 2,
        }
    }

    pub fn can_advance_to(&self, next: SummaryStatus) -> bool {
        next.rank() >= self.rank()
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(SummaryStatus::Draft),
            "processing" => Ok(SummaryStatus::Processing),
            "ready" => Ok(SummaryStatus::Ready),
            "failed" => Ok(SummaryStatus::Failed),
            other => Err(format!("unknown summary status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Canonical structured result. Always complete: absent fields are empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryFields {
    pub summary_text: String,
    pub plus_points: Vec<String>,
    pub minus_points: Vec<String>,
    pub ai_suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_stats: Option<serde_json::Value>,
}

impl SummaryFields {
    pub fn fallback(kind: SummaryKind) -> Self {
        Self {
            summary_text: kind.fallback_summary().to_string(),
            ..Default::default()
        }
    }
}

/// Input for creating a draft record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSummary {
    pub owner_id: String,
    pub kind: SummaryKind,
    pub date_range: Option<DateRange>,
    pub input_snapshot: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub kind: SummaryKind,
    pub date_range: Option<DateRange>,
    pub input_snapshot: serde_json::Value,
    pub raw_response: Option<String>,
    pub summary_text: Option<String>,
    pub plus_points: Vec<String>,
    pub minus_points: Vec<String>,
    pub ai_suggestions: Vec<String>,
    pub weekly_stats: Option<serde_json::Value>,
    pub model: Option<String>,
    pub error_message: Option<String>,
    pub status: SummaryStatus,
    pub generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SummaryRecord {
    pub fn draft(new: NewSummary) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            kind: new.kind,
            date_range: new.date_range,
            input_snapshot: new.input_snapshot,
            raw_response: None,
            summary_text: None,
            plus_points: Vec::new(),
            minus_points: Vec::new(),
            ai_suggestions: Vec::new(),
            weekly_stats: None,
            model: None,
            error_message: None,
            status: SummaryStatus::Draft,
            generated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The canonical output shape of a finished record.
    pub fn fields(&self) -> SummaryFields {
        SummaryFields {
            summary_text: self.summary_text.clone().unwrap_or_default(),
            plus_points: self.plus_points.clone(),
            minus_points: self.minus_points.clone(),
            ai_suggestions: self.ai_suggestions.clone(),
            weekly_stats: self.weekly_stats.clone(),
        }
    }

    /// Apply a partial update. A status that would move the record backward
    /// is ignored; every other present field overwrites.
    pub fn apply(&mut self, patch: &RecordPatch) {
        if let Some(raw) = &patch.raw_response {
            self.raw_response = Some(raw.clone());
        }
        if let Some(fields) = &patch.fields {
            self.summary_text = Some(fields.summary_text.clone());
            self.plus_points = fields.plus_points.clone();
            self.minus_points = fields.minus_points.clone();
            self.ai_suggestions = fields.ai_suggestions.clone();
            self.weekly_stats = fields.weekly_stats.clone();
        }
        if let Some(model) = &patch.model {
            self.model = Some(model.clone());
        }
        if patch.clear_error {
            self.error_message = None;
        } else if let Some(message) = &patch.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(status) = patch.status {
            if self.status.can_advance_to(status) {
                self.status = status;
            } else {
                tracing::debug!(
                    id = %self.id,
                    from = %self.status,
                    to = %status,
                    "Ignoring backward status transition"
                );
            }
        }
        if let Some(at) = patch.generated_at {
            self.generated_at = Some(at);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update for `SummaryStore::update_fields`. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub raw_response: Option<String>,
    pub fields: Option<SummaryFields>,
    pub model: Option<String>,
    pub error_message: Option<String>,
    /// Reset `error_message` to null. Takes precedence over `error_message`.
    pub clear_error: bool,
    pub status: Option<SummaryStatus>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl RecordPatch {
    /// Durability checkpoint: raw model output plus `processing`.
    pub fn checkpoint(raw_response: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            raw_response: Some(raw_response.into()),
            model: Some(model.into()),
            status: Some(SummaryStatus::Processing),
            ..Default::default()
        }
    }

    pub fn ready(fields: SummaryFields) -> Self {
        Self {
            fields: Some(fields),
            clear_error: true,
            status: Some(SummaryStatus::Ready),
            generated_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            error_message: Some(truncate_chars(message, MAX_ERROR_MESSAGE_CHARS)),
            status: Some(SummaryStatus::Failed),
            ..Default::default()
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
