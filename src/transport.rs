use serde_json::{Map, Value};
use thiserror::Error;

/// Default path of the chart-data endpoint, relative to the service host
pub const CHART_DATA_ENDPOINT: &str = "api/v1/chart/data";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("could not reach {url}: {message}")]
    Connection { url: String, message: String },
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("response has no `result` array")]
    MissingResult,
    #[error("response `result` array is empty")]
    EmptyResult,
    #[error("result is missing `{0}`")]
    MissingField(&'static str),
    #[error("`{field}` has an unexpected shape: {detail}")]
    Malformed { field: &'static str, detail: String },
}

/// Posts JSON to the query service. Implementations own their timeouts.
pub trait Transport: Send + Sync {
    fn post(&self, endpoint: &str, body: &Value) -> Result<Value, TransportError>;
}

/// First result of a chart-data response, rows not yet typed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartDataResult {
    pub colnames: Vec<String>,
    /// Generic type codes aligned with `colnames`; `None` where the service sent none
    pub coltypes: Vec<Option<i64>>,
    pub rows: Vec<Map<String, Value>>,
    pub rowcount: Option<usize>,
    /// First row of the second result, answered for a grand-totals query
    pub totals: Option<Map<String, Value>>,
}

/// Parse `{ "result": [ { data, colnames, coltypes, rowcount? }, totals? ] }`.
///
/// `data` may be an array of row objects, an array of row arrays aligned with
/// `colnames`, or an object keyed by row index holding either shape.
pub fn parse_envelope(response: &Value) -> Result<ChartDataResult, EnvelopeError> {
    let results = response
        .get("result")
        .and_then(Value::as_array)
        .ok_or(EnvelopeError::MissingResult)?;
    let first = results.first().ok_or(EnvelopeError::EmptyResult)?;

    let colnames: Vec<String> = first
        .get("colnames")
        .ok_or(EnvelopeError::MissingField("colnames"))?
        .as_array()
        .ok_or_else(|| malformed("colnames", "expected an array"))?
        .iter()
        .map(|name| match name {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    let coltypes = match first.get("coltypes") {
        Some(Value::Array(types)) => types.iter().map(Value::as_i64).collect(),
        Some(Value::Null) | None => vec![None; colnames.len()],
        Some(_) => return Err(malformed("coltypes", "expected an array")),
    };

    let data = first.get("data").ok_or(EnvelopeError::MissingField("data"))?;
    let raw_rows: Vec<&Value> = match data {
        Value::Array(rows) => rows.iter().collect(),
        Value::Object(keyed) => {
            let mut entries: Vec<(&String, &Value)> = keyed.iter().collect();
            // numeric keys first in numeric order, then the rest by name
            entries.sort_by_key(|&(key, _)| {
                (
                    key.parse::<u64>().map_or((1, 0), |n| (0, n)),
                    key.as_str(),
                )
            });
            entries.into_iter().map(|(_, row)| row).collect()
        }
        Value::Null => Vec::new(),
        _ => return Err(malformed("data", "expected an array or object")),
    };

    let rows = raw_rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(map) => Ok(map.clone()),
            Value::Array(cells) => Ok(colnames
                .iter()
                .cloned()
                .zip(cells.iter().cloned())
                .collect::<Map<String, Value>>()),
            _ => Err(malformed("data", &format!("row {} is not an object or array", i))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let rowcount = first
        .get("rowcount")
        .and_then(Value::as_u64)
        .map(|n| n as usize);

    let totals = results
        .get(1)
        .and_then(|result| result.get("data"))
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_object)
        .cloned();

    Ok(ChartDataResult {
        colnames,
        coltypes,
        rows,
        rowcount,
        totals,
    })
}

fn malformed(field: &'static str, detail: &str) -> EnvelopeError {
    EnvelopeError::Malformed {
        field,
        detail: detail.to_string(),
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::{Transport, TransportError};
    use serde_json::Value;
    use std::time::Duration;

    /// JSON-over-HTTP transport backed by a blocking `ureq` agent
    pub struct HttpTransport {
        base_url: String,
        agent: ureq::Agent,
    }

    impl HttpTransport {
        pub fn new(protocol: &str, host: &str, timeout: Duration) -> Self {
            let agent = ureq::AgentBuilder::new().timeout(timeout).build();
            Self {
                base_url: format!("{}://{}", protocol, host.trim_end_matches('/')),
                agent,
            }
        }

        pub fn url_for(&self, endpoint: &str) -> String {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }

    impl Transport for HttpTransport {
        fn post(&self, endpoint: &str, body: &Value) -> Result<Value, TransportError> {
            let url = self.url_for(endpoint);
            tracing::debug!(%url, "posting query");
            let response = self
                .agent
                .post(&url)
                .set("Accept", "application/json")
                .send_json(body)
                .map_err(|e| match e {
                    ureq::Error::Status(status, response) => TransportError::Status {
                        url: url.clone(),
                        status,
                        body: response.into_string().unwrap_or_default(),
                    },
                    ureq::Error::Transport(t) => TransportError::Connection {
                        url: url.clone(),
                        message: t.to_string(),
                    },
                })?;
            response
                .into_json::<Value>()
                .map_err(|e| TransportError::Decode(e.to_string()))
        }
    }

}
