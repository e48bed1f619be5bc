use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cross_filter::FilterState;
use crate::types::{CellValue, ColumnMeta, ColumnWidth, DataRecord, DataType, HorizontalAlign};
use crate::value_range::{compute_range_with, NumericDetection, ValueRange};

pub const CLASS_IS_FILTER: &str = "dt-is-filter";
pub const CLASS_IS_NULL: &str = "dt-is-null";
pub const CLASS_IS_ACTIVE_FILTER: &str = "dt-is-active-filter";
pub const CLASS_IS_SORTED: &str = "is-sorted";
pub const HEADER_SORT_TITLE: &str = "Shift + Click to sort by multiple columns";
pub const TOTALS_LABEL: &str = "Totals";

/// Opacity bounds used when shading conditional-format matches
const MIN_OPACITY: f64 = 0.3;
const MAX_OPACITY: f64 = 1.0;

/// An RGB color with alpha, rendered as a CSS `rgba(...)` value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: f64,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: f64) -> Self {
        Self { r, g, b, a }
    }

    pub fn with_alpha(self, a: f64) -> Self {
        Self { a, ..self }
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgba({},{},{},{})", self.r, self.g, self.b, self.a)
    }
}

impl FromStr for Rgba {
    type Err = String;

    /// Accepts `#rrggbb`, `#rrggbbaa` and `rgba(r,g,b,a)` / `rgb(r,g,b)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(hex) = trimmed.strip_prefix('#') {
            let channel = |i: usize| {
                hex.get(i..i + 2)
                    .and_then(|c| u8::from_str_radix(c, 16).ok())
                    .ok_or_else(|| format!("Invalid hex color: '{}'", trimmed))
            };
            return match hex.len() {
                6 => Ok(Rgba::new(channel(0)?, channel(2)?, channel(4)?, 1.0)),
                8 => Ok(Rgba::new(
                    channel(0)?,
                    channel(2)?,
                    channel(4)?,
                    channel(6)? as f64 / 255.0,
                )),
                _ => Err(format!("Invalid hex color: '{}'. Expected #rrggbb", trimmed)),
            };
        }

        let lower = trimmed.to_lowercase();
        let inner = lower
            .strip_prefix("rgba(")
            .or_else(|| lower.strip_prefix("rgb("))
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| format!("Unknown color format: '{}'", trimmed))?;
        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(format!("Expected 3 or 4 color components in '{}'", trimmed));
        }
        let component = |p: &str| {
            p.parse::<u8>()
                .map_err(|_| format!("Invalid color component '{}' in '{}'", p, trimmed))
        };
        let a = match parts.get(3) {
            Some(p) => p
                .parse::<f64>()
                .map_err(|_| format!("Invalid alpha '{}' in '{}'", p, trimmed))?,
            None => 1.0,
        };
        Ok(Rgba::new(
            component(parts[0])?,
            component(parts[1])?,
            component(parts[2])?,
            a,
        ))
    }
}

impl TryFrom<String> for Rgba {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rgba> for String {
    fn from(value: Rgba) -> Self {
        value.to_string()
    }
}

/// Chart-wide display options; per-column `RenderConfig` overrides them.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartDefaults {
    pub align_positive_negative: bool,
    pub color_positive_negative: bool,
    pub show_cell_bars: bool,
    pub emit_cross_filters: bool,
    pub is_raw_records: bool,
    pub sort_desc: bool,
    pub allow_rearrange_columns: bool,
    pub numeric_detection: NumericDetection,
}

impl Default for ChartDefaults {
    fn default() -> Self {
        Self {
            align_positive_negative: false,
            color_positive_negative: false,
            show_cell_bars: true,
            emit_cross_filters: false,
            is_raw_records: false,
            sort_desc: false,
            allow_rearrange_columns: false,
            numeric_detection: NumericDetection::FirstRow,
        }
    }
}

/// Conditional-formatting comparator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[default]
    #[serde(rename = "None")]
    None,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "≥", alias = ">=")]
    GreaterOrEqual,
    #[serde(rename = "≤", alias = "<=")]
    LessOrEqual,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "≠", alias = "!=")]
    NotEqual,
    #[serde(rename = "< x <")]
    Between,
    #[serde(rename = "≤ x ≤")]
    BetweenOrEqual,
    #[serde(rename = "≤ x <")]
    BetweenOrLeftEqual,
    #[serde(rename = "< x ≤")]
    BetweenOrRightEqual,
}

/// One configured conditional-formatting rule, as found in form data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalFormattingRule {
    pub column: String,
    #[serde(default)]
    pub operator: Comparator,
    #[serde(default)]
    pub target_value: Option<f64>,
    #[serde(default)]
    pub target_value_left: Option<f64>,
    #[serde(default)]
    pub target_value_right: Option<f64>,
    pub color_scheme: Rgba,
}

/// A conditional formatter bound to the current column values
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalFormatter {
    pub rule: ConditionalFormattingRule,
    extent: Option<ValueRange>,
}

impl ConditionalFormatter {
    /// Bind a rule to the current rows; the `None` comparator and the
    /// open-ended comparators shade relative to the column extent.
    pub fn new(rule: ConditionalFormattingRule, rows: &[DataRecord]) -> Self {
        let extent = compute_range_with(NumericDetection::AllRows, &rule.column, rows, false);
        Self { rule, extent }
    }

    pub fn column(&self) -> &str {
        &self.rule.column
    }

    /// Color for a numeric value, or `None` when the rule does not match.
    pub fn color_for(&self, value: f64) -> Option<Rgba> {
        let (cutoff, extreme) = self.compare(value)?;
        Some(self.rule.color_scheme.with_alpha(opacity(value, cutoff, extreme)))
    }

    fn compare(&self, value: f64) -> Option<(f64, f64)> {
        let rule = &self.rule;
        let (min, max) = self
            .extent
            .map(|r| (r.min, r.max))
            .unwrap_or((value, value));
        let hit = |cond: bool, cutoff: f64, extreme: f64| cond.then_some((cutoff, extreme));
        match rule.operator {
            Comparator::None => hit(value >= min && value <= max, min, max),
            Comparator::GreaterThan => {
                let t = rule.target_value?;
                hit(value > t, t, max)
            }
            Comparator::LessThan => {
                let t = rule.target_value?;
                hit(value < t, t, min)
            }
            Comparator::GreaterOrEqual => {
                let t = rule.target_value?;
                hit(value >= t, t, max)
            }
            Comparator::LessOrEqual => {
                let t = rule.target_value?;
                hit(value <= t, t, min)
            }
            Comparator::Equal => {
                let t = rule.target_value?;
                hit(value == t, t, t)
            }
            Comparator::NotEqual => {
                let t = rule.target_value?;
                hit(value != t, t, if value > t { max } else { min })
            }
            Comparator::Between
            | Comparator::BetweenOrEqual
            | Comparator::BetweenOrLeftEqual
            | Comparator::BetweenOrRightEqual => {
                let (l, r) = (rule.target_value_left?, rule.target_value_right?);
                let cond = match rule.operator {
                    Comparator::Between => value > l && value < r,
                    Comparator::BetweenOrEqual => value >= l && value <= r,
                    Comparator::BetweenOrLeftEqual => value >= l && value < r,
                    _ => value > l && value <= r,
                };
                hit(cond, l, r)
            }
        }
    }
}

fn opacity(value: f64, cutoff: f64, extreme: f64) -> f64 {
    if extreme == cutoff {
        return MAX_OPACITY;
    }
    let raw = ((MAX_OPACITY - MIN_OPACITY) / (extreme - cutoff) * (value - cutoff)).abs()
        + MIN_OPACITY;
    MAX_OPACITY.min((raw * 100.0).round() / 100.0)
}

/// Rounds half toward positive infinity, matching the web table's percentages.
fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Bar width as a percentage of the cell.
pub fn cell_width(value: f64, range: &ValueRange, align_positive_negative: bool) -> f64 {
    if align_positive_negative {
        if range.max == 0.0 {
            return 0.0;
        }
        return round_half_up(value / range.max * 100.0).abs();
    }
    let total = range.pos_extent() + range.neg_extent();
    if total == 0.0 {
        return 0.0;
    }
    round_half_up(value.abs() / total * 100.0)
}

/// Bar left offset as a percentage of the cell: negative bars grow leftward
/// from the zero point, positive bars rightward.
pub fn cell_offset(value: f64, range: &ValueRange, align_positive_negative: bool) -> f64 {
    if align_positive_negative {
        return 0.0;
    }
    let neg = range.neg_extent();
    let total = range.pos_extent() + neg;
    if total == 0.0 {
        return 0.0;
    }
    round_half_up((neg + value).min(neg) / total * 100.0)
}

pub fn cell_background(value: f64, color_positive_negative: bool) -> Rgba {
    let r = if color_positive_negative && value < 0.0 {
        150
    } else {
        0
    };
    Rgba::new(r, 0, 0, 0.2)
}

/// Geometry and tint of a proportional cell bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellBar {
    pub width_pct: f64,
    pub offset_pct: f64,
    pub color: Rgba,
    pub negative: bool,
}

impl CellBar {
    pub fn class_name(&self) -> &'static str {
        if self.negative {
            "cell-bar negative"
        } else {
            "cell-bar positive"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortType {
    Datetime,
    Alphanumeric,
    Basic,
}

impl SortType {
    pub fn for_data_type(data_type: DataType) -> Self {
        match data_type {
            DataType::Temporal => SortType::Datetime,
            DataType::String => SortType::Alphanumeric,
            _ => SortType::Basic,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderRule {
    pub label: String,
    pub title: String,
    pub align: HorizontalAlign,
    /// Invisible element that pins the column width before data paints
    pub width_hint: Option<ColumnWidth>,
    pub draggable: bool,
    filter_class: bool,
}

impl HeaderRule {
    pub fn class_name(&self, is_sorted: bool) -> String {
        let mut classes = Vec::new();
        if self.filter_class {
            classes.push(CLASS_IS_FILTER);
        }
        if is_sorted {
            classes.push(CLASS_IS_SORTED);
        }
        classes.join(" ")
    }
}

/// Everything needed to draw one cell
#[derive(Debug, Clone, PartialEq)]
pub struct CellRender {
    pub align: HorizontalAlign,
    pub background: Option<Rgba>,
    pub bar: Option<CellBar>,
    pub class_name: String,
    pub title: Option<String>,
    pub clickable: bool,
    pub nowrap: bool,
    pub truncate: bool,
    pub truncate_width: Option<ColumnWidth>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FooterContent {
    Label(&'static str),
    Value(CellValue),
}

/// One cell of the totals row, shown bold
#[derive(Debug, Clone, PartialEq)]
pub struct FooterCell {
    pub content: FooterContent,
    pub align: HorizontalAlign,
}

/// Rendering contract for one column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRule {
    /// Position-based id so duplicate column keys stay distinct
    pub id: String,
    pub index: usize,
    pub key: String,
    pub data_type: DataType,
    pub is_metric: bool,
    pub align: HorizontalAlign,
    pub column_width: Option<ColumnWidth>,
    pub align_positive_negative: bool,
    pub color_positive_negative: bool,
    pub truncate_long_cells: bool,
    pub value_range: Option<ValueRange>,
    pub emit_cross_filters: bool,
    pub formatters: Vec<ConditionalFormatter>,
    pub sort_type: SortType,
    pub sort_desc_first: bool,
    pub header: HeaderRule,
}

pub fn horizontal_align(column: &ColumnMeta) -> HorizontalAlign {
    match column.config.horizontal_align {
        Some(align) => align,
        None if column.is_numeric => HorizontalAlign::Right,
        None => HorizontalAlign::Left,
    }
}

/// Derive the rendering contract for a column against the current rows.
pub fn derive_rule(
    index: usize,
    column: &ColumnMeta,
    defaults: &ChartDefaults,
    formatters: &[ConditionalFormatter],
    rows: &[DataRecord],
) -> ColumnRule {
    let config = &column.config;
    let align = horizontal_align(column);
    let align_positive_negative = config
        .align_positive_negative
        .unwrap_or(defaults.align_positive_negative);
    let color_positive_negative = config
        .color_positive_negative
        .unwrap_or(defaults.color_positive_negative);
    let show_cell_bars = config.show_cell_bars.unwrap_or(defaults.show_cell_bars);
    let column_width = config.column_width.as_ref().map(ColumnWidth::normalized);

    let formatters: Vec<ConditionalFormatter> = formatters
        .iter()
        .filter(|f| f.column() == column.key)
        .cloned()
        .collect();

    let wants_bars = formatters.is_empty()
        && show_cell_bars
        && column.data_type == DataType::Numeric
        && (column.is_metric || defaults.is_raw_records || column.is_percent_metric);
    let value_range = if wants_bars {
        compute_range_with(
            defaults.numeric_detection,
            &column.key,
            rows,
            align_positive_negative,
        )
    } else {
        None
    };

    let filter_class = defaults.emit_cross_filters && !column.is_metric;

    ColumnRule {
        id: index.to_string(),
        index,
        key: column.key.clone(),
        data_type: column.data_type,
        is_metric: column.is_metric,
        align,
        align_positive_negative,
        color_positive_negative,
        truncate_long_cells: config.truncate_long_cells.unwrap_or(false),
        value_range,
        emit_cross_filters: defaults.emit_cross_filters,
        formatters,
        sort_type: SortType::for_data_type(column.data_type),
        sort_desc_first: defaults.sort_desc,
        header: HeaderRule {
            label: column.label.clone(),
            title: HEADER_SORT_TITLE.to_string(),
            align,
            width_hint: column_width.clone().filter(ColumnWidth::is_set),
            draggable: defaults.allow_rearrange_columns,
            filter_class,
        },
        column_width,
    }
}

impl ColumnRule {
    /// First matching formatter wins; zero is a real value and is evaluated.
    pub fn formatter_color(&self, value: &CellValue) -> Option<Rgba> {
        let n = value.as_f64()?;
        self.formatters.iter().find_map(|f| f.color_for(n))
    }

    pub fn cell_bar(&self, value: &CellValue) -> Option<CellBar> {
        let range = self.value_range.as_ref()?;
        let v = value.as_f64()?;
        Some(CellBar {
            width_pct: cell_width(v, range, self.align_positive_negative),
            offset_pct: cell_offset(v, range, self.align_positive_negative),
            color: cell_background(v, self.color_positive_negative),
            negative: v < 0.0,
        })
    }

    pub fn is_clickable(&self) -> bool {
        self.emit_cross_filters && self.value_range.is_none() && !self.is_metric
    }

    /// Totals-row cell: the first column carries the label, every other
    /// column its total, null when the totals record lacks it.
    pub fn footer(&self, totals: &DataRecord) -> FooterCell {
        if self.index == 0 {
            return FooterCell {
                content: FooterContent::Label(TOTALS_LABEL),
                align: HorizontalAlign::Left,
            };
        }
        FooterCell {
            content: FooterContent::Value(totals.get(&self.key).cloned().unwrap_or_default()),
            align: self.align,
        }
    }

    pub fn cell(&self, value: &CellValue, filters: &FilterState) -> CellRender {
        let mut classes = Vec::new();
        if value.is_null() {
            classes.push(CLASS_IS_NULL);
        } else {
            if self.emit_cross_filters && !self.is_metric {
                classes.push(CLASS_IS_FILTER);
            }
            if filters.is_active(&self.key, value) {
                classes.push(CLASS_IS_ACTIVE_FILTER);
            }
        }

        CellRender {
            align: self.align,
            background: self.formatter_color(value),
            bar: self.cell_bar(value),
            class_name: classes.join(" "),
            title: value.as_f64().map(|n| CellValue::Number(n).to_string()),
            clickable: self.is_clickable() && !value.is_null(),
            nowrap: matches!(value, CellValue::Timestamp(_)),
            truncate: self.truncate_long_cells,
            truncate_width: if self.truncate_long_cells {
                self.column_width.clone()
            } else {
                None
            },
        }
    }
}
