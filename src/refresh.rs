//! Refresh cycle: selections in, renderable table model out.
//!
//! A cycle moves `Idle -> Building -> AwaitingResponse -> Applying -> Idle`, or
//! from `AwaitingResponse` through `Failed` back to `Idle`. Cycles may overlap;
//! every cycle carries the generation captured when it was built and a
//! response is applied only if it is newer than the last applied one.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::layout::{page_size_options, LayoutCalculator, TableSize};
use crate::query::{AggregateQueryBuilder, AggregateSelection, FormData, OrderByMetrics, QueryContext};
use crate::render_rule::{derive_rule, ChartDefaults, ColumnRule, ConditionalFormatter};
use crate::transport::{parse_envelope, ChartDataResult, EnvelopeError, Transport, TransportError};
use crate::types::{CellValue, ColumnMeta, DataRecord, DataType};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RefreshError {
    #[error("fetch failed: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed chart data: {0}")]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Building,
    AwaitingResponse,
    Applying,
    Failed,
}

/// How response columns are typed.
///
/// `Coarse` treats every column as numeric and every non-group-by column as a
/// metric. `Declared` trusts the service's type codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnTyping {
    #[default]
    Coarse,
    Declared,
}

impl ColumnTyping {
    pub fn column_meta(
        self,
        key: &str,
        code: Option<i64>,
        group_by: &[String],
        form: &FormData,
    ) -> ColumnMeta {
        let declared = code.and_then(DataType::from_code);
        let (data_type, is_numeric) = match self {
            ColumnTyping::Coarse => (declared.unwrap_or(DataType::Numeric), true),
            ColumnTyping::Declared => {
                let dt = declared.unwrap_or(DataType::String);
                (dt, dt == DataType::Numeric)
            }
        };
        let mut meta = ColumnMeta::new(key, data_type)
            .with_metric(!group_by.iter().any(|g| g == key))
            .with_numeric(is_numeric)
            .with_config(form.column_config.get(key).cloned().unwrap_or_default());
        meta.is_percent_metric = form.percent_metrics.iter().any(|p| p == key);
        meta
    }
}

/// Settings fixed for the lifetime of an orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSettings {
    pub endpoint: String,
    pub chart_defaults: ChartDefaults,
    pub column_typing: ColumnTyping,
    pub layout: LayoutCalculator,
    pub page_size: usize,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            endpoint: crate::transport::CHART_DATA_ENDPOINT.to_string(),
            chart_defaults: ChartDefaults::default(),
            column_typing: ColumnTyping::default(),
            layout: LayoutCalculator::default(),
            page_size: 0,
        }
    }
}

/// Immutable snapshot handed to the table widget
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableModel {
    pub generation: u64,
    pub columns: Vec<ColumnMeta>,
    pub rules: Vec<ColumnRule>,
    pub rows: Vec<DataRecord>,
    pub row_count: usize,
    pub size: TableSize,
    pub page_size: usize,
    pub page_size_options: Vec<usize>,
    pub server_pagination: bool,
    /// Grand totals for the metric columns, when requested
    pub totals: Option<DataRecord>,
}

impl TableModel {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Rows shown on a page; page size 0 shows everything.
    pub fn page(&self, page: usize) -> &[DataRecord] {
        if self.page_size == 0 || self.server_pagination {
            return &self.rows;
        }
        let start = (page * self.page_size).min(self.rows.len());
        let end = (start + self.page_size).min(self.rows.len());
        &self.rows[start..end]
    }

    pub fn page_count(&self) -> usize {
        if self.page_size == 0 {
            return 1;
        }
        self.row_count.div_ceil(self.page_size).max(1)
    }
}

/// One dispatched fetch
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshTicket {
    pub generation: u64,
    pub query: QueryContext,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Applied(Arc<TableModel>),
    /// A newer generation was already applied; the response was dropped.
    Stale { generation: u64, latest: u64 },
    Failed(RefreshError),
}

/// Post a query and parse the chart-data envelope.
pub fn fetch(
    transport: &dyn Transport,
    endpoint: &str,
    query: &QueryContext,
) -> Result<ChartDataResult, RefreshError> {
    let body = serde_json::to_value(query)
        .map_err(|e| TransportError::Rejected(format!("could not encode query: {}", e)))?;
    let response = transport.post(endpoint, &body)?;
    Ok(parse_envelope(&response)?)
}

pub struct RefreshOrchestrator {
    form: FormData,
    transport: Arc<dyn Transport>,
    settings: RefreshSettings,
    builder: AggregateQueryBuilder,
    phase: RefreshPhase,
    next_generation: u64,
    last_applied: u64,
    /// Group-by columns of each in-flight generation
    in_flight: BTreeMap<u64, Vec<String>>,
    model: Arc<TableModel>,
}

impl RefreshOrchestrator {
    pub fn new(form: FormData, transport: Arc<dyn Transport>, settings: RefreshSettings) -> Self {
        let model = Arc::new(TableModel {
            page_size: settings.page_size,
            server_pagination: form.server_pagination,
            ..Default::default()
        });
        Self {
            form,
            transport,
            settings,
            builder: AggregateQueryBuilder::new(),
            phase: RefreshPhase::Idle,
            next_generation: 0,
            last_applied: 0,
            in_flight: BTreeMap::new(),
            model,
        }
    }

    pub fn form(&self) -> &FormData {
        &self.form
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn phase(&self) -> RefreshPhase {
        self.phase
    }

    pub fn model(&self) -> Arc<TableModel> {
        Arc::clone(&self.model)
    }

    pub fn last_applied_generation(&self) -> u64 {
        self.last_applied
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Replace the form data; the cached base query is dropped.
    pub fn set_form(&mut self, form: FormData) {
        self.form = form;
        self.builder.invalidate();
    }

    pub fn invalidate_base_query(&mut self) {
        self.builder.invalidate();
    }

    fn transition(&mut self, phase: RefreshPhase) {
        debug!(from = ?self.phase, to = ?phase, "refresh phase");
        self.phase = phase;
    }

    fn settle_phase(&mut self) {
        let phase = if self.in_flight.is_empty() {
            RefreshPhase::Idle
        } else {
            RefreshPhase::AwaitingResponse
        };
        self.transition(phase);
    }

    /// Build the query for the current selections and register a new cycle.
    pub fn begin(
        &mut self,
        selection: &AggregateSelection,
        order_by: &OrderByMetrics,
    ) -> RefreshTicket {
        self.transition(RefreshPhase::Building);
        self.next_generation += 1;
        let generation = self.next_generation;
        let query = self.builder.build(&self.form, selection, order_by);
        self.in_flight
            .insert(generation, selection.group_by_columns.clone());
        info!(
            generation,
            group_by = ?selection.group_by_columns,
            metrics = ?selection.metric_columns,
            aggregate = selection.aggregate_function.code(),
            "refresh started"
        );
        self.transition(RefreshPhase::AwaitingResponse);
        RefreshTicket { generation, query }
    }

    /// Apply or discard the response for a cycle.
    pub fn complete(
        &mut self,
        generation: u64,
        result: Result<ChartDataResult, RefreshError>,
        viewport: TableSize,
    ) -> RefreshOutcome {
        let group_by = self.in_flight.remove(&generation).unwrap_or_default();

        if generation <= self.last_applied {
            debug!(generation, latest = self.last_applied, "discarding stale response");
            self.settle_phase();
            return RefreshOutcome::Stale {
                generation,
                latest: self.last_applied,
            };
        }

        match result {
            Ok(data) => {
                self.transition(RefreshPhase::Applying);
                let model = Arc::new(self.build_model(generation, data, &group_by, viewport));
                info!(
                    generation,
                    columns = model.columns.len(),
                    rows = model.rows.len(),
                    "refresh applied"
                );
                self.model = Arc::clone(&model);
                self.last_applied = generation;
                self.settle_phase();
                RefreshOutcome::Applied(model)
            }
            Err(err) => {
                self.transition(RefreshPhase::Failed);
                warn!(generation, error = %err, "refresh failed, keeping previous table");
                self.settle_phase();
                RefreshOutcome::Failed(err)
            }
        }
    }

    /// Run a whole cycle on the calling thread.
    pub fn refresh(
        &mut self,
        selection: &AggregateSelection,
        order_by: &OrderByMetrics,
        viewport: TableSize,
    ) -> RefreshOutcome {
        let ticket = self.begin(selection, order_by);
        let result = fetch(self.transport.as_ref(), &self.settings.endpoint, &ticket.query);
        self.complete(ticket.generation, result, viewport)
    }

    /// Refit the current model to a new viewport. Returns whether it changed.
    pub fn resize(&mut self, viewport: TableSize) -> bool {
        match self.settings.layout.fit(viewport, self.model.size) {
            Some(size) if size != self.model.size => {
                let mut next = (*self.model).clone();
                next.size = size;
                self.model = Arc::new(next);
                true
            }
            _ => false,
        }
    }

    /// Change the page size of the current model.
    pub fn set_page_size(&mut self, page_size: usize) {
        if self.model.page_size == page_size {
            return;
        }
        let mut next = (*self.model).clone();
        next.page_size = page_size;
        self.model = Arc::new(next);
    }

    fn build_model(
        &self,
        generation: u64,
        data: ChartDataResult,
        group_by: &[String],
        viewport: TableSize,
    ) -> TableModel {
        let columns: Vec<ColumnMeta> = data
            .colnames
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let code = data.coltypes.get(i).copied().flatten();
                self.settings
                    .column_typing
                    .column_meta(name, code, group_by, &self.form)
            })
            .collect();

        let typed = |raw: &Map<String, Value>| -> DataRecord {
            raw.iter()
                .map(|(key, value)| {
                    let dt = columns.iter().find(|c| &c.key == key).map(|c| c.data_type);
                    (key.clone(), CellValue::from_json(value, dt))
                })
                .collect()
        };
        let rows: Vec<DataRecord> = data.rows.iter().map(typed).collect();
        let totals = if self.form.wants_totals() {
            data.totals.as_ref().map(typed)
        } else {
            None
        };

        let defaults = self.form.chart_defaults(&self.settings.chart_defaults);
        let formatters: Vec<ConditionalFormatter> = self
            .form
            .conditional_formatting
            .iter()
            .cloned()
            .map(|rule| ConditionalFormatter::new(rule, &rows))
            .collect();
        let rules = columns
            .iter()
            .enumerate()
            .map(|(i, col)| derive_rule(i, col, &defaults, &formatters, &rows))
            .collect();

        let server_pagination = self.form.server_pagination;
        let row_count = if server_pagination {
            data.rowcount.unwrap_or(rows.len())
        } else {
            rows.len()
        };

        TableModel {
            generation,
            page_size: self.model.page_size,
            page_size_options: page_size_options(server_pagination, row_count, rows.len()),
            size: self.settings.layout.settle(viewport, viewport),
            server_pagination,
            totals,
            columns,
            rules,
            rows,
            row_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::AggregateFunction;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Replays canned responses in order and records the requests it saw.
    struct Scripted {
        responses: Mutex<Vec<Result<Value, TransportError>>>,
        requests: Mutex<Vec<Value>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Value, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for Scripted {
        fn post(&self, _endpoint: &str, body: &Value) -> Result<Value, TransportError> {
            self.requests.lock().unwrap().push(body.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(TransportError::Rejected("no scripted response".to_string()));
            }
            responses.remove(0)
        }
    }

    fn envelope(rows: Value) -> Value {
        json!({
            "result": [{
                "colnames": ["region", "SUM(profit)"],
                "coltypes": [1, 0],
                "data": rows
            }]
        })
    }

    fn selection() -> AggregateSelection {
        AggregateSelection {
            group_by_columns: vec!["region".to_string()],
            metric_columns: vec!["profit".to_string()],
            aggregate_function: AggregateFunction::Sum,
        }
    }

    fn orchestrator(transport: Arc<dyn Transport>) -> RefreshOrchestrator {
        let form = FormData {
            datasource: "1__table".to_string(),
            ..Default::default()
        };
        RefreshOrchestrator::new(form, transport, RefreshSettings::default())
    }

    fn result(rows: Value) -> Result<ChartDataResult, RefreshError> {
        Ok(parse_envelope(&envelope(rows)).unwrap())
    }

    const VIEW: TableSize = TableSize {
        width: 80,
        height: 24,
    };

    #[test]
    fn test_refresh_builds_model() {
        let transport = Arc::new(Scripted::new(vec![Ok(envelope(json!([
            {"region": "West", "SUM(profit)": -10},
            {"region": "East", "SUM(profit)": 5},
            {"region": "North", "SUM(profit)": 20}
        ])))]));
        let mut orch = orchestrator(transport.clone());
        let outcome = orch.refresh(&selection(), &Vec::new(), VIEW);
        let model = match outcome {
            RefreshOutcome::Applied(model) => model,
            other => panic!("expected applied, got {:?}", other),
        };
        assert_eq!(orch.phase(), RefreshPhase::Idle);
        assert_eq!(model.generation, 1);
        assert_eq!(model.row_count, 3);
        assert!(!model.columns[0].is_metric);
        assert!(model.columns[1].is_metric);
        assert!(model.columns[0].is_numeric);
        assert_eq!(model.columns[0].data_type, DataType::String);
        assert!(model.rules[0].value_range.is_none());
        let bar = model.rules[1].cell_bar(&CellValue::Number(-10.0)).unwrap();
        assert_eq!((bar.width_pct, bar.offset_pct), (33.0, 0.0));
        assert_eq!(model.size, TableSize::new(80, 20));

        let sent = transport.requests.lock().unwrap();
        assert_eq!(sent[0]["queries"][0]["columns"], json!(["region"]));
        assert_eq!(sent[0]["queries"][0]["metrics"][0]["label"], json!("SUM(profit)"));
    }

    #[test]
    fn test_stale_response_is_discarded() {
        let mut orch = orchestrator(Arc::new(Scripted::new(Vec::new())));
        let first = orch.begin(&selection(), &Vec::new());
        let second = orch.begin(&selection(), &Vec::new());
        assert_eq!(orch.in_flight(), 2);
        assert_eq!(orch.phase(), RefreshPhase::AwaitingResponse);

        let applied = orch.complete(
            second.generation,
            result(json!([{"region": "B", "SUM(profit)": 2}])),
            VIEW,
        );
        assert!(matches!(applied, RefreshOutcome::Applied(_)));
        assert_eq!(orch.phase(), RefreshPhase::AwaitingResponse);

        let stale = orch.complete(
            first.generation,
            result(json!([{"region": "A", "SUM(profit)": 1}])),
            VIEW,
        );
        assert_eq!(
            stale,
            RefreshOutcome::Stale {
                generation: 1,
                latest: 2
            }
        );
        assert_eq!(orch.phase(), RefreshPhase::Idle);
        let model = orch.model();
        assert_eq!(model.generation, 2);
        assert_eq!(model.rows[0]["region"], CellValue::from("B"));
    }

    #[test]
    fn test_in_order_overlap_applies_both() {
        let mut orch = orchestrator(Arc::new(Scripted::new(Vec::new())));
        let first = orch.begin(&selection(), &Vec::new());
        let second = orch.begin(&selection(), &Vec::new());
        assert!(matches!(
            orch.complete(first.generation, result(json!([])), VIEW),
            RefreshOutcome::Applied(_)
        ));
        assert!(matches!(
            orch.complete(second.generation, result(json!([])), VIEW),
            RefreshOutcome::Applied(_)
        ));
        assert_eq!(orch.last_applied_generation(), 2);
    }

    #[test]
    fn test_failure_keeps_previous_model() {
        let transport = Arc::new(Scripted::new(vec![
            Ok(envelope(json!([{"region": "West", "SUM(profit)": 1}]))),
            Err(TransportError::Status {
                url: "http://x/api/v1/chart/data".to_string(),
                status: 500,
                body: "boom".to_string(),
            }),
            Ok(json!({"unexpected": true})),
            Ok(envelope(json!([{"region": "East", "SUM(profit)": 2}]))),
        ]));
        let mut orch = orchestrator(transport);
        orch.refresh(&selection(), &Vec::new(), VIEW);
        let before = orch.model();

        let failed = orch.refresh(&selection(), &Vec::new(), VIEW);
        assert!(matches!(failed, RefreshOutcome::Failed(RefreshError::Transport(_))));
        assert_eq!(orch.phase(), RefreshPhase::Idle);
        assert_eq!(orch.model(), before);

        let malformed = orch.refresh(&selection(), &Vec::new(), VIEW);
        assert!(matches!(malformed, RefreshOutcome::Failed(RefreshError::Envelope(_))));
        assert_eq!(orch.model(), before);

        let recovered = orch.refresh(&selection(), &Vec::new(), VIEW);
        assert!(matches!(recovered, RefreshOutcome::Applied(_)));
        assert_eq!(orch.model().generation, 4);
        assert_eq!(orch.model().rows[0]["region"], CellValue::from("East"));
    }

    #[test]
    fn test_declared_typing() {
        let form = FormData::default();
        let group_by = vec!["region".to_string()];
        let region = ColumnTyping::Declared.column_meta("region", Some(1), &group_by, &form);
        assert!(!region.is_numeric);
        assert!(!region.is_metric);
        let coarse = ColumnTyping::Coarse.column_meta("region", Some(1), &group_by, &form);
        assert!(coarse.is_numeric);
        let unknown = ColumnTyping::Coarse.column_meta("x", None, &group_by, &form);
        assert_eq!(unknown.data_type, DataType::Numeric);
        assert!(unknown.is_metric);
    }

    #[test]
    fn test_paging_and_resize() {
        let mut orch = orchestrator(Arc::new(Scripted::new(Vec::new())));
        let ticket = orch.begin(&selection(), &Vec::new());
        let rows: Vec<Value> = (0..25)
            .map(|i| json!({"region": format!("r{}", i), "SUM(profit)": i}))
            .collect();
        orch.complete(ticket.generation, result(Value::Array(rows)), VIEW);
        orch.set_page_size(10);
        let model = orch.model();
        assert_eq!(model.page_count(), 3);
        assert_eq!(model.page(2).len(), 5);
        assert_eq!(model.page_size_options, vec![0, 10, 20, 50]);

        assert!(orch.resize(TableSize::new(120, 40)));
        assert!(!orch.resize(TableSize::new(120, 40)));
    }
}
