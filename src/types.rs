use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Synthetic column key the query service uses for the time axis
pub const DTTM_ALIAS: &str = "__timestamp";

/// One row of the result set, keyed by column key
pub type DataRecord = HashMap<String, CellValue>;

/// Generic column type as reported by the query service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Numeric,
    String,
    Temporal,
    Boolean,
}

impl DataType {
    /// Map a `coltypes` code from a chart-data response.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Numeric),
            1 => Some(Self::String),
            2 => Some(Self::Temporal),
            3 => Some(Self::Boolean),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Numeric => 0,
            Self::String => 1,
            Self::Temporal => 2,
            Self::Boolean => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HorizontalAlign {
    Left,
    Center,
    Right,
}

impl HorizontalAlign {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Center => "center",
            Self::Right => "right",
        }
    }
}

/// Column width as configured: a pixel count, or any other CSS length
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnWidth {
    Pixels(f64),
    Css(String),
}

/// Approximate pixel width of one terminal cell.
pub const PIXELS_PER_CELL: f64 = 8.0;

impl ColumnWidth {
    /// Numeric strings ("120") are treated as pixel counts, everything else is kept verbatim.
    pub fn normalized(&self) -> ColumnWidth {
        match self {
            ColumnWidth::Css(s) => match s.trim().parse::<f64>() {
                Ok(px) if px.is_finite() => ColumnWidth::Pixels(px),
                _ => self.clone(),
            },
            ColumnWidth::Pixels(_) => self.clone(),
        }
    }

    /// A configured width of zero is treated as "not configured".
    pub fn is_set(&self) -> bool {
        match self.normalized() {
            ColumnWidth::Pixels(px) => px != 0.0,
            ColumnWidth::Css(s) => !s.trim().is_empty(),
        }
    }

    /// Width in terminal cells, when it can be derived from a pixel count.
    pub fn terminal_cells(&self) -> Option<u16> {
        match self.normalized() {
            ColumnWidth::Pixels(px) if px > 0.0 => {
                Some(((px / PIXELS_PER_CELL).round() as u16).max(1))
            }
            ColumnWidth::Css(s) => s
                .trim()
                .strip_suffix("px")
                .and_then(|n| n.trim().parse::<f64>().ok())
                .filter(|px| *px > 0.0)
                .map(|px| ((px / PIXELS_PER_CELL).round() as u16).max(1)),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.normalized() {
            ColumnWidth::Pixels(px) => write!(f, "{}px", px),
            ColumnWidth::Css(s) => write!(f, "{}", s),
        }
    }
}

/// Per-column display overrides. Absent fields fall back to the chart defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderConfig {
    pub horizontal_align: Option<HorizontalAlign>,
    pub column_width: Option<ColumnWidth>,
    pub align_positive_negative: Option<bool>,
    pub color_positive_negative: Option<bool>,
    pub show_cell_bars: Option<bool>,
    pub truncate_long_cells: Option<bool>,
}

/// Metadata for one renderable column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub key: String,
    pub label: String,
    pub data_type: DataType,
    pub is_metric: bool,
    pub is_percent_metric: bool,
    pub is_numeric: bool,
    pub config: RenderConfig,
}

impl ColumnMeta {
    pub fn new(key: impl Into<String>, data_type: DataType) -> Self {
        let key = key.into();
        Self {
            label: key.clone(),
            key,
            data_type,
            is_metric: false,
            is_percent_metric: false,
            is_numeric: data_type == DataType::Numeric,
            config: RenderConfig::default(),
        }
    }

    pub fn with_metric(mut self, is_metric: bool) -> Self {
        self.is_metric = is_metric;
        self
    }

    pub fn with_numeric(mut self, is_numeric: bool) -> Self {
        self.is_numeric = is_numeric;
        self
    }

    pub fn with_config(mut self, config: RenderConfig) -> Self {
        self.config = config;
        self
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    /// Decode a JSON value. Temporal columns turn epoch milliseconds and
    /// ISO-like strings into timestamps.
    pub fn from_json(value: &Value, data_type: Option<DataType>) -> Self {
        let temporal = data_type == Some(DataType::Temporal);
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) => {
                if temporal {
                    if let Some(ts) = n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    {
                        return CellValue::Timestamp(ts);
                    }
                }
                n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Null)
            }
            Value::String(s) => {
                if temporal {
                    if let Some(ts) = parse_timestamp(s) {
                        return CellValue::Timestamp(ts);
                    }
                }
                CellValue::String(s.clone())
            }
            other => CellValue::String(other.to_string()),
        }
    }

    /// Serializable primitive: timestamps become epoch milliseconds.
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(|num| {
                    if n.fract() == 0.0 && n.abs() < 9.0e15 {
                        Value::from(*n as i64)
                    } else {
                        Value::Number(num)
                    }
                })
                .unwrap_or(Value::Null),
            CellValue::String(s) => Value::String(s.clone()),
            CellValue::Timestamp(ts) => Value::from(ts.timestamp_millis()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, CellValue::Number(_))
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::String(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::String(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl From<DateTime<Utc>> for CellValue {
    fn from(ts: DateTime<Utc>) -> Self {
        CellValue::Timestamp(ts)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "N/A"),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            CellValue::String(s) => write!(f, "{}", s),
            CellValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    const FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];
    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
