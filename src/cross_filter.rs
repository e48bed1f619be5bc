use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::formatter::{format_timestamp, TimeGrain, ValueFormatter};
use crate::types::{CellValue, ColumnMeta, DataRecord, DTTM_ALIAS};

/// Active cross filters: column key to the selected values, in insertion order.
///
/// A key is only present while its value list is non-empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterState {
    entries: Vec<(String, Vec<CellValue>)>,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the values for a column. An empty list removes the column.
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<CellValue>) {
        let key = key.into();
        if values.is_empty() {
            self.remove(&key);
            return;
        }
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = values,
            None => self.entries.push((key, values)),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, key: &str) -> Option<&[CellValue]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn is_active(&self, key: &str, value: &CellValue) -> bool {
        self.get(key).is_some_and(|values| values.contains(value))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[CellValue])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Fold a data mask emitted by the coordinator back into this state.
    pub fn apply(&mut self, mask: &DataMask) {
        if let Some(filter_state) = &mask.filter_state {
            *self = filter_state.filters.clone().unwrap_or_default();
        }
    }
}

impl Serialize for FilterState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, values) in &self.entries {
            let json: Vec<Value> = values.iter().map(CellValue::to_json).collect();
            map.serialize_entry(key, &json)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterOp {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "IS NULL")]
    IsNull,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterClause {
    pub col: String,
    pub op: FilterOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grain: Option<TimeGrain>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtraFormData {
    pub filters: Vec<FilterClause>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterStateMask {
    pub label: String,
    pub value: Option<Vec<Value>>,
    pub filters: Option<FilterState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnState {
    pub current_page: usize,
    pub page_size: usize,
}

/// Filter payload handed to the host's filter-state sink
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMask {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_form_data: Option<ExtraFormData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_state: Option<FilterStateMask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub own_state: Option<OwnState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossFilterResult {
    pub data_mask: DataMask,
    pub is_current_value_selected: bool,
}

/// Receives data masks proposed by the coordinator.
pub trait FilterStateSink {
    fn set_data_mask(&mut self, mask: DataMask);
}

impl FilterStateSink for FilterState {
    fn set_data_mask(&mut self, mask: DataMask) {
        self.apply(&mask);
    }
}

/// `==` clause used by drill-to-detail and drill-by
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillClause {
    pub col: String,
    pub op: &'static str,
    pub val: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_val: Option<String>,
}

impl DrillClause {
    fn equals(col: &str, value: &CellValue, formatted_val: Option<String>) -> Self {
        Self {
            col: col.to_string(),
            op: "==",
            val: value.to_json(),
            formatted_val,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillBy {
    pub filters: Vec<DrillClause>,
    pub groupby_field_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextMenuPayload {
    pub drill_to_detail: Vec<DrillClause>,
    pub cross_filter: Option<CrossFilterResult>,
    pub drill_by: Option<DrillBy>,
}

/// Cell under the pointer when a context menu is requested
#[derive(Debug, Clone, Copy)]
pub struct CellPoint<'a> {
    pub key: &'a str,
    pub value: &'a CellValue,
    pub is_metric: bool,
}

/// Turns cell clicks into data masks. Never mutates the filter state it reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossFilterCoordinator {
    pub time_grain: Option<TimeGrain>,
    pub emit_cross_filters: bool,
}

impl CrossFilterCoordinator {
    pub fn new(time_grain: Option<TimeGrain>, emit_cross_filters: bool) -> Self {
        Self {
            time_grain,
            emit_cross_filters,
        }
    }

    /// Compute the mask for clicking `(key, value)`.
    ///
    /// Clicking the active value clears every filter; any other click replaces
    /// the state with exactly `{ key: [value] }`.
    pub fn compute_data_mask(
        &self,
        current: &FilterState,
        key: &str,
        value: &CellValue,
    ) -> CrossFilterResult {
        let is_current_value_selected = current.is_active(key, value);

        let mut updated = FilterState::new();
        if !is_current_value_selected {
            updated.insert(key, vec![value.clone()]);
        }

        let label = updated
            .iter()
            .map(|(col, values)| {
                values
                    .iter()
                    .map(|v| self.label_for(col, v))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .collect::<Vec<_>>()
            .join(", ");

        let filters = updated
            .iter()
            .map(|(col, values)| {
                if values.is_empty() {
                    FilterClause {
                        col: col.to_string(),
                        op: FilterOp::IsNull,
                        val: None,
                        grain: None,
                    }
                } else {
                    FilterClause {
                        col: col.to_string(),
                        op: FilterOp::In,
                        val: Some(values.iter().map(CellValue::to_json).collect()),
                        grain: if col == DTTM_ALIAS {
                            self.time_grain
                        } else {
                            None
                        },
                    }
                }
            })
            .collect();

        let value: Vec<Value> = updated
            .iter()
            .flat_map(|(_, values)| values.iter().map(CellValue::to_json))
            .collect();

        CrossFilterResult {
            data_mask: DataMask {
                extra_form_data: Some(ExtraFormData { filters }),
                filter_state: Some(FilterStateMask {
                    label,
                    value: (!value.is_empty()).then_some(value),
                    filters: (!updated.is_empty()).then_some(updated),
                }),
                own_state: None,
            },
            is_current_value_selected,
        }
    }

    /// Mask to emit for a click, or `None` when cross filters are off or the
    /// user was selecting text.
    pub fn on_cell_click(
        &self,
        current: &FilterState,
        key: &str,
        value: &CellValue,
        text_selected: bool,
    ) -> Option<DataMask> {
        if !self.emit_cross_filters || text_selected {
            return None;
        }
        Some(self.compute_data_mask(current, key, value).data_mask)
    }

    /// Context-menu payload for a cell; raw-record views have none.
    pub fn context_menu(
        &self,
        current: &FilterState,
        columns: &[ColumnMeta],
        row: &DataRecord,
        point: CellPoint<'_>,
        formatter: &dyn ValueFormatter,
        is_raw_records: bool,
    ) -> Option<ContextMenuPayload> {
        if is_raw_records {
            return None;
        }
        let drill_to_detail = columns
            .iter()
            .filter(|col| !col.is_metric)
            .map(|col| {
                let value = row.get(&col.key).cloned().unwrap_or_default();
                let formatted = formatter.format(col, &value).text;
                DrillClause::equals(&col.key, &value, Some(formatted))
            })
            .collect();

        let (cross_filter, drill_by) = if point.is_metric {
            (None, None)
        } else {
            (
                Some(self.compute_data_mask(current, point.key, point.value)),
                Some(DrillBy {
                    filters: vec![DrillClause::equals(point.key, point.value, None)],
                    groupby_field_name: "groupby".to_string(),
                }),
            )
        };

        Some(ContextMenuPayload {
            drill_to_detail,
            cross_filter,
            drill_by,
        })
    }

    /// Mask that drops every cross filter.
    pub fn clear_mask(&self) -> DataMask {
        DataMask {
            extra_form_data: Some(ExtraFormData {
                filters: Vec::new(),
            }),
            filter_state: Some(FilterStateMask {
                label: String::new(),
                value: None,
                filters: None,
            }),
            own_state: None,
        }
    }

    pub fn server_pagination_mask(&self, current_page: usize, page_size: usize) -> DataMask {
        DataMask {
            own_state: Some(OwnState {
                current_page,
                page_size,
            }),
            ..Default::default()
        }
    }

    fn label_for(&self, col: &str, value: &CellValue) -> String {
        match value {
            CellValue::Timestamp(ts) if col == DTTM_ALIAS => format_timestamp(ts, self.time_grain),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::PlainFormatter;
    use crate::types::DataType;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn coordinator() -> CrossFilterCoordinator {
        CrossFilterCoordinator::new(None, true)
    }

    #[test]
    fn test_first_click_selects_value() {
        let result =
            coordinator().compute_data_mask(&FilterState::new(), "region", &"West".into());
        assert!(!result.is_current_value_selected);
        let state = result.data_mask.filter_state.as_ref().unwrap();
        assert_eq!(state.label, "West");
        assert_eq!(state.value, Some(vec![json!("West")]));

        let json = serde_json::to_value(&result.data_mask).unwrap();
        assert_eq!(
            json,
            json!({
                "extraFormData": {"filters": [{"col": "region", "op": "IN", "val": ["West"]}]},
                "filterState": {"label": "West", "value": ["West"], "filters": {"region": ["West"]}}
            })
        );
    }

    #[test]
    fn test_second_click_clears_all_filters() {
        let coordinator = coordinator();
        let mut state = FilterState::new();
        state.apply(&coordinator.compute_data_mask(&state, "region", &"West".into()).data_mask);

        let result = coordinator.compute_data_mask(&state, "region", &"West".into());
        assert!(result.is_current_value_selected);
        let mask = result.data_mask.filter_state.unwrap();
        assert_eq!(mask.value, None);
        assert_eq!(mask.filters, None);
        assert_eq!(mask.label, "");
        assert!(result.data_mask.extra_form_data.unwrap().filters.is_empty());
    }

    #[test]
    fn test_click_replaces_other_filters() {
        let mut state = FilterState::new();
        state.insert("region", vec!["West".into()]);
        state.insert("country", vec!["US".into(), "CA".into()]);

        let result = coordinator().compute_data_mask(&state, "country", &"MX".into());
        let filters = result.data_mask.filter_state.unwrap().filters.unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters.get("country"), Some(&[CellValue::from("MX")][..]));
        assert!(filters.get("region").is_none());
    }

    #[test]
    fn test_toggle_law() {
        let coordinator = coordinator();
        for (key, value) in [
            ("region", CellValue::from("East")),
            ("year", CellValue::from(2020i64)),
            ("flag", CellValue::from(true)),
        ] {
            let mut state = FilterState::new();
            state.apply(&coordinator.compute_data_mask(&state, key, &value).data_mask);
            assert!(state.is_active(key, &value));
            state.apply(&coordinator.compute_data_mask(&state, key, &value).data_mask);
            assert!(state.is_empty());
        }
    }

    #[test]
    fn test_filter_state_never_holds_empty_lists() {
        let mut state = FilterState::new();
        state.insert("region", vec!["West".into()]);
        state.insert("region", vec![]);
        assert!(state.is_empty());
        state.insert("country", vec![]);
        assert!(state.get("country").is_none());
    }

    #[test]
    fn test_temporal_alias_uses_grain() {
        let ts = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap();
        let coordinator = CrossFilterCoordinator::new(Some(TimeGrain::Month), true);
        let result = coordinator.compute_data_mask(&FilterState::new(), DTTM_ALIAS, &ts.into());
        let mask = result.data_mask;
        assert_eq!(mask.filter_state.as_ref().unwrap().label, "Mar 2021");
        let clause = &mask.extra_form_data.as_ref().unwrap().filters[0];
        assert_eq!(clause.grain, Some(TimeGrain::Month));
        assert_eq!(clause.val, Some(vec![json!(ts.timestamp_millis())]));

        let other = coordinator.compute_data_mask(&FilterState::new(), "region", &"West".into());
        assert_eq!(other.data_mask.extra_form_data.unwrap().filters[0].grain, None);
    }

    #[test]
    fn test_on_cell_click_gates() {
        let state = FilterState::new();
        let value = CellValue::from("West");
        assert!(coordinator().on_cell_click(&state, "region", &value, true).is_none());
        let disabled = CrossFilterCoordinator::new(None, false);
        assert!(disabled.on_cell_click(&state, "region", &value, false).is_none());
        assert!(coordinator().on_cell_click(&state, "region", &value, false).is_some());
    }

    #[test]
    fn test_sink_applies_mask() {
        let mut state = FilterState::new();
        let mask = coordinator().compute_data_mask(&state, "region", &"West".into()).data_mask;
        state.set_data_mask(mask);
        assert!(state.is_active("region", &"West".into()));

        // masks without filter state leave the filters alone
        state.set_data_mask(coordinator().server_pagination_mask(2, 50));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_context_menu() {
        let columns = vec![
            ColumnMeta::new("region", DataType::String),
            ColumnMeta::new("SUM(sales)", DataType::Numeric).with_metric(true),
        ];
        let row = DataRecord::from([
            ("region".to_string(), CellValue::from("West")),
            ("SUM(sales)".to_string(), CellValue::from(120.0)),
        ]);
        let formatter = PlainFormatter::default();
        let state = FilterState::new();
        let value = CellValue::from("West");

        let payload = coordinator()
            .context_menu(
                &state,
                &columns,
                &row,
                CellPoint {
                    key: "region",
                    value: &value,
                    is_metric: false,
                },
                &formatter,
                false,
            )
            .unwrap();
        assert_eq!(payload.drill_to_detail.len(), 1);
        assert_eq!(payload.drill_to_detail[0].formatted_val.as_deref(), Some("West"));
        assert!(payload.cross_filter.is_some());
        assert_eq!(payload.drill_by.unwrap().groupby_field_name, "groupby");

        let metric_value = CellValue::from(120.0);
        let metric = coordinator()
            .context_menu(
                &state,
                &columns,
                &row,
                CellPoint {
                    key: "SUM(sales)",
                    value: &metric_value,
                    is_metric: true,
                },
                &formatter,
                false,
            )
            .unwrap();
        assert!(metric.cross_filter.is_none());
        assert!(metric.drill_by.is_none());

        let raw = coordinator().context_menu(
            &state,
            &columns,
            &row,
            CellPoint {
                key: "region",
                value: &value,
                is_metric: false,
            },
            &formatter,
            true,
        );
        assert!(raw.is_none());
    }

    #[test]
    fn test_server_pagination_mask() {
        let mask = coordinator().server_pagination_mask(3, 20);
        assert_eq!(
            serde_json::to_value(&mask).unwrap(),
            json!({"ownState": {"currentPage": 3, "pageSize": 20}})
        );
    }

    #[test]
    fn test_clear_mask_empties_state() {
        let mut state = FilterState::new();
        state.insert("region", vec![CellValue::from("West")]);
        state.apply(&coordinator().clear_mask());
        assert!(state.is_empty());
    }
}
