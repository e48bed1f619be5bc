#![allow(dead_code)]

use dyntable::transport::{Transport, TransportError};
use dyntable::FormData;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// (region, country, sales, profit)
pub const SALES: [(&str, &str, f64, f64); 4] = [
    ("West", "US", 100.0, -10.0),
    ("East", "US", 50.0, 5.0),
    ("North", "CA", 30.0, 20.0),
    ("West", "CA", 20.0, 4.0),
];

/// In-memory query service: groups `SALES` by the requested columns and
/// applies each metric's aggregate, answering with a chart-data envelope.
#[derive(Default)]
pub struct FakeService {
    pub requests: Mutex<Vec<Value>>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Value {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or(Value::Null)
    }
}

fn field(row: &(&str, &str, f64, f64), column: &str) -> Value {
    match column {
        "region" => json!(row.0),
        "country" => json!(row.1),
        "sales" => json!(row.2),
        "profit" => json!(row.3),
        _ => Value::Null,
    }
}

fn aggregate(code: &str, values: &[Value]) -> Value {
    let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
    match code {
        "SUM" => json!(numbers.iter().sum::<f64>()),
        "AVG" if !numbers.is_empty() => json!(numbers.iter().sum::<f64>() / numbers.len() as f64),
        "COUNT" => json!(values.iter().filter(|v| !v.is_null()).count()),
        "COUNT_DISTINCT" => {
            let mut distinct: Vec<String> = values.iter().map(Value::to_string).collect();
            distinct.sort();
            distinct.dedup();
            json!(distinct.len())
        }
        "MIN" => json!(numbers.iter().cloned().fold(f64::INFINITY, f64::min)),
        "MAX" => json!(numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
        _ => Value::Null,
    }
}

fn answer(query: &Value) -> Value {
    let columns: Vec<String> = query["columns"]
        .as_array()
        .map(|cols| {
            cols.iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let metrics: Vec<(String, String, String)> = query["metrics"]
        .as_array()
        .map(|metrics| {
            metrics
                .iter()
                .map(|m| {
                    (
                        m["label"].as_str().unwrap_or_default().to_string(),
                        m["column"]["column_name"].as_str().unwrap_or_default().to_string(),
                        m["aggregate"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let mut groups: BTreeMap<Vec<String>, Vec<&(&str, &str, f64, f64)>> = BTreeMap::new();
    for row in &SALES {
        let key = columns.iter().map(|c| field(row, c).to_string()).collect();
        groups.entry(key).or_default().push(row);
    }

    let data: Vec<Value> = groups
        .values()
        .map(|rows| {
            let mut record = Map::new();
            for column in &columns {
                record.insert(column.clone(), field(rows[0], column));
            }
            for (label, column, code) in &metrics {
                let values: Vec<Value> = rows.iter().map(|r| field(r, column)).collect();
                record.insert(label.clone(), aggregate(code, &values));
            }
            Value::Object(record)
        })
        .collect();

    let colnames: Vec<&String> = columns.iter().chain(metrics.iter().map(|m| &m.0)).collect();
    let coltypes: Vec<u8> = columns
        .iter()
        .map(|_| 1)
        .chain(metrics.iter().map(|_| 0))
        .collect();

    let rowcount = data.len();
    json!({
        "colnames": colnames,
        "coltypes": coltypes,
        "data": data,
        "rowcount": rowcount
    })
}

impl Transport for FakeService {
    fn post(&self, _endpoint: &str, body: &Value) -> Result<Value, TransportError> {
        self.requests.lock().unwrap().push(body.clone());
        let result: Vec<Value> = body["queries"]
            .as_array()
            .map(|queries| queries.iter().map(answer).collect())
            .unwrap_or_default();
        Ok(json!({ "result": result }))
    }
}

/// Always fails with a server error.
pub struct FailingTransport;

impl Transport for FailingTransport {
    fn post(&self, endpoint: &str, _body: &Value) -> Result<Value, TransportError> {
        Err(TransportError::Status {
            url: format!("http://localhost:8088/{}", endpoint),
            status: 500,
            body: "internal error".to_string(),
        })
    }
}

pub fn sales_form() -> FormData {
    serde_json::from_value(json!({
        "datasource": "7__table",
        "viz_type": "dynamic_table",
        "all_columns": ["region", "country"],
        "metric_columns": ["sales", "profit"],
        "default_groupby_columns": ["region"],
        "default_metrics_columns": ["sales"],
        "row_limit": 1000,
        "emit_cross_filters": true
    }))
    .unwrap()
}
