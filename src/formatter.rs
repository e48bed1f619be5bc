use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CellValue, ColumnMeta};

/// Time granularity of the temporal axis, as ISO-8601 duration codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeGrain {
    #[serde(rename = "PT1S")]
    Second,
    #[serde(rename = "PT1M")]
    Minute,
    #[serde(rename = "PT5M")]
    FiveMinutes,
    #[serde(rename = "PT10M")]
    TenMinutes,
    #[serde(rename = "PT15M")]
    FifteenMinutes,
    #[serde(rename = "PT30M")]
    ThirtyMinutes,
    #[serde(rename = "PT1H")]
    Hour,
    #[serde(rename = "P1D")]
    Day,
    #[serde(rename = "P1W")]
    Week,
    #[serde(rename = "P1M")]
    Month,
    #[serde(rename = "P3M")]
    Quarter,
    #[serde(rename = "P1Y")]
    Year,
}

impl TimeGrain {
    pub fn code(self) -> &'static str {
        match self {
            Self::Second => "PT1S",
            Self::Minute => "PT1M",
            Self::FiveMinutes => "PT5M",
            Self::TenMinutes => "PT10M",
            Self::FifteenMinutes => "PT15M",
            Self::ThirtyMinutes => "PT30M",
            Self::Hour => "PT1H",
            Self::Day => "P1D",
            Self::Week => "P1W",
            Self::Month => "P1M",
            Self::Quarter => "P3M",
            Self::Year => "P1Y",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(code.to_string())).ok()
    }
}

/// Format a timestamp at the precision implied by the time grain.
/// Without a grain the full date and time is shown.
pub fn format_timestamp(ts: &DateTime<Utc>, grain: Option<TimeGrain>) -> String {
    match grain {
        Some(TimeGrain::Second) | None => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        Some(
            TimeGrain::Minute
            | TimeGrain::FiveMinutes
            | TimeGrain::TenMinutes
            | TimeGrain::FifteenMinutes
            | TimeGrain::ThirtyMinutes
            | TimeGrain::Hour,
        ) => ts.format("%Y-%m-%d %H:%M").to_string(),
        Some(TimeGrain::Day | TimeGrain::Week) => ts.format("%Y-%m-%d").to_string(),
        Some(TimeGrain::Month) => ts.format("%b %Y").to_string(),
        Some(TimeGrain::Quarter) => format!("{} Q{}", ts.year(), (ts.month() - 1) / 3 + 1),
        Some(TimeGrain::Year) => ts.format("%Y").to_string(),
    }
}

/// Display text for a cell, flagged when it should be rendered as markup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedValue {
    pub is_html: bool,
    pub text: String,
}

/// Turns a cell value into display text.
pub trait ValueFormatter {
    fn format(&self, column: &ColumnMeta, value: &CellValue) -> FormattedValue;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter {
    pub time_grain: Option<TimeGrain>,
}

impl PlainFormatter {
    pub fn new(time_grain: Option<TimeGrain>) -> Self {
        Self { time_grain }
    }
}

impl ValueFormatter for PlainFormatter {
    fn format(&self, column: &ColumnMeta, value: &CellValue) -> FormattedValue {
        let text = match value {
            CellValue::Number(n) if column.is_percent_metric => format!("{:.3}%", n * 100.0),
            CellValue::Timestamp(ts) => format_timestamp(ts, self.time_grain),
            other => other.to_string(),
        };
        let is_html = matches!(value, CellValue::String(_)) && is_probably_html(&text);
        FormattedValue { is_html, text }
    }
}

fn is_probably_html(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with('<') && trimmed.ends_with('>') && trimmed.len() > 2
}
