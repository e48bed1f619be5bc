use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use dyntable_cli::AggregateArg;

use crate::formatter::TimeGrain;
use crate::render_rule::{ChartDefaults, ConditionalFormattingRule};
use crate::types::RenderConfig;

/// Aggregate applied to every selected metric column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateFunction {
    #[default]
    Sum,
    #[serde(rename = "AVG")]
    Average,
    Count,
    CountDistinct,
    Min,
    Max,
}

impl AggregateFunction {
    pub const ALL: [AggregateFunction; 6] = [
        Self::Sum,
        Self::Average,
        Self::Count,
        Self::CountDistinct,
        Self::Min,
        Self::Max,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Sum => "Sum",
            Self::Average => "Average",
            Self::Count => "Count",
            Self::CountDistinct => "Count Distinct",
            Self::Min => "Min",
            Self::Max => "Max",
        }
    }

    /// SQL aggregate code sent to the query service
    pub fn code(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Average => "AVG",
            Self::Count => "COUNT",
            Self::CountDistinct => "COUNT_DISTINCT",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    /// Label of the metric this aggregate produces for a column, e.g. `SUM(sales)`
    pub fn metric_label(self, column: &str) -> String {
        format!("{}({})", self.code(), column)
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for AggregateFunction {
    type Err = String;

    /// Accepts display names ("Count Distinct") and codes ("COUNT_DISTINCT").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .into_iter()
            .find(|f| {
                f.display_name().eq_ignore_ascii_case(needle) || f.code().eq_ignore_ascii_case(needle)
            })
            .ok_or_else(|| {
                format!(
                    "Unknown aggregate function '{}'. Expected one of: {}",
                    needle,
                    Self::ALL.map(|f| f.display_name()).join(", ")
                )
            })
    }
}

impl From<AggregateArg> for AggregateFunction {
    fn from(arg: AggregateArg) -> Self {
        match arg {
            AggregateArg::Sum => Self::Sum,
            AggregateArg::Average => Self::Average,
            AggregateArg::Count => Self::Count,
            AggregateArg::CountDistinct => Self::CountDistinct,
            AggregateArg::Min => Self::Min,
            AggregateArg::Max => Self::Max,
        }
    }
}

/// The user's current group-by, metric and aggregate choices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSelection {
    pub group_by_columns: Vec<String>,
    pub metric_columns: Vec<String>,
    pub aggregate_function: AggregateFunction,
}

impl AggregateSelection {
    /// Initial selection from the form data's defaults
    pub fn from_form_data(form: &FormData, aggregate_function: AggregateFunction) -> Self {
        Self {
            group_by_columns: form.default_groupby_columns.clone(),
            metric_columns: form.default_metrics_columns.clone(),
            aggregate_function,
        }
    }

    pub fn toggle_group_by(&mut self, column: &str) {
        toggle(&mut self.group_by_columns, column);
    }

    pub fn toggle_metric(&mut self, column: &str) {
        toggle(&mut self.metric_columns, column);
    }
}

fn toggle(columns: &mut Vec<String>, column: &str) {
    if let Some(pos) = columns.iter().position(|c| c == column) {
        columns.remove(pos);
    } else {
        columns.push(column.to_string());
    }
}

/// Ordered mapping of metric label to ascending flag
pub type OrderByMetrics = Vec<(String, bool)>;

/// The view's static configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormData {
    /// `"<id>__<type>"`, e.g. `"3__table"`
    pub datasource: String,
    pub viz_type: String,
    /// Columns selectable for group-by
    pub all_columns: Vec<String>,
    /// Columns selectable as metrics
    #[serde(alias = "metric_columns")]
    pub visible_metrics_columns: Vec<String>,
    pub default_groupby_columns: Vec<String>,
    pub default_metrics_columns: Vec<String>,
    pub percent_metrics: Vec<String>,
    pub query_mode: QueryMode,
    pub granularity_sqla: Option<String>,
    pub time_grain_sqla: Option<TimeGrain>,
    pub time_range: Option<String>,
    pub row_limit: Option<u64>,
    pub adhoc_filters: Vec<Value>,
    pub order_desc: bool,
    pub server_pagination: bool,
    /// Request a grand-totals row for the selected metrics
    pub show_totals: bool,
    pub page_length: Option<usize>,
    pub align_pn: Option<bool>,
    pub color_pn: Option<bool>,
    pub show_cell_bars: Option<bool>,
    pub emit_cross_filters: Option<bool>,
    pub sort_desc: Option<bool>,
    pub allow_rearrange_columns: Option<bool>,
    pub column_config: BTreeMap<String, RenderConfig>,
    pub conditional_formatting: Vec<ConditionalFormattingRule>,
    /// Keys this crate does not interpret, echoed back to the service
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for FormData {
    fn default() -> Self {
        Self {
            datasource: String::new(),
            viz_type: "dynamic_table".to_string(),
            all_columns: Vec::new(),
            visible_metrics_columns: Vec::new(),
            default_groupby_columns: Vec::new(),
            default_metrics_columns: Vec::new(),
            percent_metrics: Vec::new(),
            query_mode: QueryMode::Aggregate,
            granularity_sqla: None,
            time_grain_sqla: None,
            time_range: None,
            row_limit: None,
            adhoc_filters: Vec::new(),
            order_desc: true,
            server_pagination: false,
            show_totals: false,
            page_length: None,
            align_pn: None,
            color_pn: None,
            show_cell_bars: None,
            emit_cross_filters: None,
            sort_desc: None,
            allow_rearrange_columns: None,
            column_config: BTreeMap::new(),
            conditional_formatting: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Aggregate,
    Raw,
}

impl FormData {
    pub fn is_raw_records(&self) -> bool {
        self.query_mode == QueryMode::Raw
    }

    /// Overlay the form data's display flags onto configured defaults.
    pub fn chart_defaults(&self, base: &ChartDefaults) -> ChartDefaults {
        ChartDefaults {
            align_positive_negative: self.align_pn.unwrap_or(base.align_positive_negative),
            color_positive_negative: self.color_pn.unwrap_or(base.color_positive_negative),
            show_cell_bars: self.show_cell_bars.unwrap_or(base.show_cell_bars),
            emit_cross_filters: self.emit_cross_filters.unwrap_or(base.emit_cross_filters),
            is_raw_records: self.is_raw_records(),
            sort_desc: self.sort_desc.unwrap_or(base.sort_desc),
            allow_rearrange_columns: self
                .allow_rearrange_columns
                .unwrap_or(base.allow_rearrange_columns),
            numeric_detection: base.numeric_detection,
        }
    }

    /// Fingerprint of the configuration, used to key the base query. Stable
    /// within a process only.
    pub fn fingerprint(&self) -> u64 {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        encoded.hash(&mut hasher);
        hasher.finish()
    }

    /// Whether a grand-totals query rides along with the main one.
    pub fn wants_totals(&self) -> bool {
        self.show_totals && !self.is_raw_records()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceRef {
    pub id: Value,
    #[serde(rename = "type")]
    pub kind: String,
}

impl DatasourceRef {
    /// Split `"<id>__<type>"`. A missing type defaults to `table`; numeric ids
    /// are sent as numbers.
    pub fn parse(datasource: &str) -> Self {
        let (id, kind) = datasource
            .split_once("__")
            .unwrap_or((datasource, "table"));
        let id = id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(id.to_string()));
        Self {
            id,
            kind: kind.to_string(),
        }
    }
}

/// Column descriptor embedded in a SIMPLE metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricColumn {
    pub column_name: String,
    pub expression: String,
    pub filterable: bool,
    pub groupby: bool,
    pub is_dttm: bool,
    #[serde(rename = "type")]
    pub type_name: String,
    pub type_generic: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFormMetric {
    pub expression_type: String,
    pub column: MetricColumn,
    pub aggregate: AggregateFunction,
    pub has_custom_label: bool,
    pub label: String,
    pub option_name: String,
}

impl QueryFormMetric {
    pub fn simple(column: &str, aggregate: AggregateFunction) -> Self {
        let label = aggregate.metric_label(column);
        Self {
            expression_type: "SIMPLE".to_string(),
            column: MetricColumn {
                column_name: column.to_string(),
                expression: String::new(),
                filterable: true,
                groupby: true,
                is_dttm: false,
                type_name: "BIGINT".to_string(),
                type_generic: 0,
            },
            aggregate,
            has_custom_label: false,
            option_name: {
                let mut hasher = DefaultHasher::new();
                label.hash(&mut hasher);
                format!("metric_{:016x}", hasher.finish())
            },
            label,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryExtras {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_grain_sqla: Option<TimeGrain>,
    pub having: String,
    #[serde(rename = "where")]
    pub where_clause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryObject {
    pub columns: Vec<String>,
    pub metrics: Vec<QueryFormMetric>,
    pub orderby: Vec<(String, bool)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
    pub filters: Vec<Value>,
    pub extras: QueryExtras,
    pub order_desc: bool,
    pub annotation_layers: Vec<Value>,
    pub post_processing: Vec<Value>,
}

/// Request body for the chart-data endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    pub datasource: DatasourceRef,
    pub force: bool,
    pub queries: Vec<QueryObject>,
    pub form_data: Value,
    pub result_format: String,
    pub result_type: String,
}

impl QueryContext {
    /// Base query for a form, before any selection is applied.
    pub fn from_form_data(form: &FormData) -> Self {
        let query = QueryObject {
            columns: form.default_groupby_columns.clone(),
            metrics: form
                .default_metrics_columns
                .iter()
                .map(|c| QueryFormMetric::simple(c, AggregateFunction::default()))
                .collect(),
            orderby: Vec::new(),
            row_limit: form.row_limit,
            time_range: form.time_range.clone(),
            granularity: form.granularity_sqla.clone(),
            filters: form.adhoc_filters.clone(),
            extras: QueryExtras {
                time_grain_sqla: form.time_grain_sqla,
                ..Default::default()
            },
            order_desc: form.order_desc,
            annotation_layers: Vec::new(),
            post_processing: Vec::new(),
        };
        let mut queries = vec![query];
        if form.wants_totals() {
            queries.push(totals_query(&queries[0]));
        }
        Self {
            datasource: DatasourceRef::parse(&form.datasource),
            force: false,
            queries,
            form_data: serde_json::to_value(form).unwrap_or(Value::Null),
            result_format: "json".to_string(),
            result_type: "full".to_string(),
        }
    }

    pub fn primary(&self) -> Option<&QueryObject> {
        self.queries.first()
    }

    /// The grand-totals query, when the form asked for one.
    pub fn totals(&self) -> Option<&QueryObject> {
        self.queries.get(1)
    }
}

/// Same metrics and filters as `query`, without grouping, ordering or limit.
fn totals_query(query: &QueryObject) -> QueryObject {
    QueryObject {
        columns: Vec::new(),
        orderby: Vec::new(),
        row_limit: Some(0),
        post_processing: Vec::new(),
        ..query.clone()
    }
}

/// Base query memoized by form fingerprint, invalidated explicitly.
#[derive(Debug, Default)]
pub struct BaseQueryCache {
    entry: Option<(u64, QueryContext)>,
}

impl BaseQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&mut self, form: &FormData) -> &QueryContext {
        let fingerprint = form.fingerprint();
        if !matches!(&self.entry, Some((fp, _)) if *fp == fingerprint) {
            self.entry = None;
        }
        let (_, ctx) = self.entry.get_or_insert_with(|| {
            tracing::debug!(fingerprint, "building base query");
            (fingerprint, QueryContext::from_form_data(form))
        });
        ctx
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn is_cached(&self, form: &FormData) -> bool {
        matches!(&self.entry, Some((fp, _)) if *fp == form.fingerprint())
    }
}

/// Rewrite a base query for the given selections. Pure: the base is not modified.
pub fn build(
    base: &QueryContext,
    group_by_columns: &[String],
    aggregate_function: AggregateFunction,
    metric_columns: &[String],
    order_by: &OrderByMetrics,
) -> QueryContext {
    let mut ctx = base.clone();
    if ctx.queries.is_empty() {
        ctx.queries.push(QueryObject::default());
    }
    if let Some(query) = ctx.queries.first_mut() {
        query.columns = group_by_columns.to_vec();
        query.metrics = metric_columns
            .iter()
            .map(|c| QueryFormMetric::simple(c, aggregate_function))
            .collect();
        query.orderby = order_by.clone();
    }
    if ctx.queries.len() > 1 {
        let totals = totals_query(&ctx.queries[0]);
        ctx.queries.truncate(1);
        ctx.queries.push(totals);
    }
    ctx
}

/// Builds queries from selections, caching the form's base query.
#[derive(Debug, Default)]
pub struct AggregateQueryBuilder {
    cache: BaseQueryCache,
}

impl AggregateQueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(
        &mut self,
        form: &FormData,
        selection: &AggregateSelection,
        order_by: &OrderByMetrics,
    ) -> QueryContext {
        let base = self.cache.get_or_build(form);
        build(
            base,
            &selection.group_by_columns,
            selection.aggregate_function,
            &selection.metric_columns,
            order_by,
        )
    }

    pub fn invalidate(&mut self) {
        self.cache.invalidate();
    }

    pub fn cache(&self) -> &BaseQueryCache {
        &self.cache
    }
}
