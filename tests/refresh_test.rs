mod common;

use common::{sales_form, FailingTransport, FakeService};
use dyntable::layout::TableSize;
use dyntable::query::{AggregateFunction, AggregateSelection};
use dyntable::refresh::{RefreshOrchestrator, RefreshOutcome, RefreshPhase, RefreshSettings};
use dyntable::render_rule::{Comparator, ConditionalFormattingRule, Rgba};
use dyntable::types::CellValue;
use dyntable::{RefreshError, Transport};
use serde_json::json;
use std::sync::Arc;

const VIEW: TableSize = TableSize {
    width: 100,
    height: 30,
};

fn selection(group_by: &[&str], metrics: &[&str], agg: AggregateFunction) -> AggregateSelection {
    AggregateSelection {
        group_by_columns: group_by.iter().map(|s| s.to_string()).collect(),
        metric_columns: metrics.iter().map(|s| s.to_string()).collect(),
        aggregate_function: agg,
    }
}

fn applied(outcome: RefreshOutcome) -> Arc<dyntable::TableModel> {
    match outcome {
        RefreshOutcome::Applied(model) => model,
        other => panic!("expected an applied refresh, got {:?}", other),
    }
}

fn row_for<'a>(
    model: &'a dyntable::TableModel,
    region: &str,
) -> &'a dyntable::types::DataRecord {
    model
        .rows
        .iter()
        .find(|r| r["region"] == CellValue::from(region))
        .unwrap()
}

#[test]
fn test_group_by_region_sums_sales() {
    let service = Arc::new(FakeService::new());
    let mut orch = RefreshOrchestrator::new(sales_form(), service.clone(), RefreshSettings::default());

    let model = applied(orch.refresh(
        &selection(&["region"], &["sales"], AggregateFunction::Sum),
        &Vec::new(),
        VIEW,
    ));

    let query = &service.last_request()["queries"][0];
    assert_eq!(query["columns"], json!(["region"]));
    assert_eq!(query["metrics"].as_array().unwrap().len(), 1);
    assert_eq!(query["metrics"][0]["aggregate"], json!("SUM"));
    assert_eq!(query["metrics"][0]["label"], json!("SUM(sales)"));
    assert_eq!(query["row_limit"], json!(1000));
    assert_eq!(service.last_request()["datasource"], json!({"id": 7, "type": "table"}));

    assert_eq!(model.row_count, 3);
    assert_eq!(
        row_for(&model, "West")["SUM(sales)"],
        CellValue::Number(120.0)
    );
    assert!(model.columns[1].is_metric);
    assert!(!model.columns[0].is_metric);
}

#[test]
fn test_reconfigure_between_refreshes() {
    let service = Arc::new(FakeService::new());
    let mut orch = RefreshOrchestrator::new(sales_form(), service.clone(), RefreshSettings::default());

    applied(orch.refresh(
        &selection(&["region"], &["sales"], AggregateFunction::Sum),
        &Vec::new(),
        VIEW,
    ));
    let model = applied(orch.refresh(
        &selection(&["country"], &["sales", "profit"], AggregateFunction::Max),
        &vec![("MAX(sales)".to_string(), false)],
        VIEW,
    ));

    let keys: Vec<&str> = model.columns.iter().map(|c| c.key.as_str()).collect();
    assert_eq!(keys, vec!["country", "MAX(sales)", "MAX(profit)"]);
    assert_eq!(model.generation, 2);

    let query = &service.last_request()["queries"][0];
    assert_eq!(query["orderby"], json!([["MAX(sales)", false]]));
    assert_eq!(query["metrics"][1]["label"], json!("MAX(profit)"));
}

#[test]
fn test_empty_metrics_still_fetch() {
    let service = Arc::new(FakeService::new());
    let mut orch = RefreshOrchestrator::new(sales_form(), service.clone(), RefreshSettings::default());
    let model = applied(orch.refresh(
        &selection(&["country"], &[], AggregateFunction::Count),
        &Vec::new(),
        VIEW,
    ));
    assert_eq!(service.last_request()["queries"][0]["metrics"], json!([]));
    assert_eq!(model.columns.len(), 1);
    assert_eq!(model.row_count, 2);
}

#[test]
fn test_totals_row_for_selected_metrics() {
    let service = Arc::new(FakeService::new());
    let mut form = sales_form();
    form.show_totals = true;
    let mut orch = RefreshOrchestrator::new(form, service.clone(), RefreshSettings::default());

    let model = applied(orch.refresh(
        &selection(&["region"], &["sales", "profit"], AggregateFunction::Sum),
        &Vec::new(),
        VIEW,
    ));

    let totals_query = &service.last_request()["queries"][1];
    assert_eq!(totals_query["columns"], json!([]));
    assert_eq!(totals_query["row_limit"], json!(0));

    let totals = model.totals.as_ref().unwrap();
    assert_eq!(totals["SUM(sales)"], CellValue::Number(200.0));
    assert_eq!(totals["SUM(profit)"], CellValue::Number(19.0));
    assert_eq!(model.row_count, 3);

    let plain = applied(
        RefreshOrchestrator::new(sales_form(), service.clone(), RefreshSettings::default())
            .refresh(
                &selection(&["region"], &["sales"], AggregateFunction::Sum),
                &Vec::new(),
                VIEW,
            ),
    );
    assert!(plain.totals.is_none());
    assert_eq!(service.last_request()["queries"].as_array().unwrap().len(), 1);
}

#[test]
fn test_cell_bars_follow_profit_extent() {
    let service = Arc::new(FakeService::new());
    let mut orch = RefreshOrchestrator::new(sales_form(), service, RefreshSettings::default());
    let model = applied(orch.refresh(
        &selection(&["region", "country"], &["profit"], AggregateFunction::Sum),
        &Vec::new(),
        VIEW,
    ));

    let profit = model.rules.iter().find(|r| r.key == "SUM(profit)").unwrap();
    let range = profit.value_range.unwrap();
    assert_eq!((range.min, range.max), (-10.0, 20.0));

    let bar = profit.cell_bar(&CellValue::Number(-10.0)).unwrap();
    assert_eq!((bar.width_pct, bar.offset_pct), (33.0, 0.0));
    assert!(bar.negative);

    let region = model.rules.iter().find(|r| r.key == "region").unwrap();
    assert!(region.value_range.is_none());
    assert!(region.is_clickable());
}

#[test]
fn test_conditional_formatting_replaces_bars() {
    let mut form = sales_form();
    form.conditional_formatting = vec![ConditionalFormattingRule {
        column: "SUM(profit)".to_string(),
        operator: Comparator::LessThan,
        target_value: Some(0.0),
        target_value_left: None,
        target_value_right: None,
        color_scheme: Rgba::new(255, 0, 0, 1.0),
    }];
    let mut orch = RefreshOrchestrator::new(form, Arc::new(FakeService::new()), RefreshSettings::default());
    let model = applied(orch.refresh(
        &selection(&["region", "country"], &["profit"], AggregateFunction::Sum),
        &Vec::new(),
        VIEW,
    ));

    let profit = model.rules.iter().find(|r| r.key == "SUM(profit)").unwrap();
    assert!(profit.value_range.is_none());
    assert!(profit.formatter_color(&CellValue::Number(-10.0)).is_some());
    assert!(profit.formatter_color(&CellValue::Number(20.0)).is_none());
}

#[test]
fn test_last_triggered_wins_across_threads() {
    let service: Arc<dyn Transport> = Arc::new(FakeService::new());
    let mut orch = RefreshOrchestrator::new(sales_form(), service.clone(), RefreshSettings::default());
    let settings = orch.settings().clone();

    let older = orch.begin(
        &selection(&["region"], &["sales"], AggregateFunction::Sum),
        &Vec::new(),
    );
    let newer = orch.begin(
        &selection(&["country"], &["sales"], AggregateFunction::Sum),
        &Vec::new(),
    );

    let handles: Vec<_> = [older.clone(), newer.clone()]
        .into_iter()
        .map(|ticket| {
            let transport = service.clone();
            let endpoint = settings.endpoint.clone();
            std::thread::spawn(move || {
                (
                    ticket.generation,
                    dyntable::refresh::fetch(transport.as_ref(), &endpoint, &ticket.query),
                )
            })
        })
        .collect();
    let mut results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // deliver the newer response first
    results.sort_by_key(|(generation, _)| std::cmp::Reverse(*generation));
    let outcomes: Vec<RefreshOutcome> = results
        .into_iter()
        .map(|(generation, result)| orch.complete(generation, result, VIEW))
        .collect();

    assert!(matches!(outcomes[0], RefreshOutcome::Applied(_)));
    assert_eq!(
        outcomes[1],
        RefreshOutcome::Stale {
            generation: older.generation,
            latest: newer.generation
        }
    );
    let model = orch.model();
    assert_eq!(model.generation, newer.generation);
    assert_eq!(model.columns[0].key, "country");
    assert_eq!(orch.phase(), RefreshPhase::Idle);
}

#[test]
fn test_failure_keeps_table_and_recovers() {
    let mut orch = RefreshOrchestrator::new(
        sales_form(),
        Arc::new(FakeService::new()),
        RefreshSettings::default(),
    );
    let sel = selection(&["region"], &["sales"], AggregateFunction::Sum);
    let before = applied(orch.refresh(&sel, &Vec::new(), VIEW));

    let mut failing = RefreshOrchestrator::new(
        sales_form(),
        Arc::new(FailingTransport),
        RefreshSettings::default(),
    );
    let outcome = failing.refresh(&sel, &Vec::new(), VIEW);
    match outcome {
        RefreshOutcome::Failed(RefreshError::Transport(err)) => {
            assert!(err.to_string().contains("500"));
        }
        other => panic!("expected transport failure, got {:?}", other),
    }
    assert_eq!(failing.phase(), RefreshPhase::Idle);
    assert!(failing.model().is_empty());

    // a failed cycle in between leaves the applied model untouched
    let ticket = orch.begin(&sel, &Vec::new());
    let failed = orch.complete(
        ticket.generation,
        Err(RefreshError::Transport(dyntable::TransportError::Rejected(
            "offline".to_string(),
        ))),
        VIEW,
    );
    assert!(matches!(failed, RefreshOutcome::Failed(_)));
    assert_eq!(orch.model(), before);

    let after = applied(orch.refresh(&sel, &Vec::new(), VIEW));
    assert_eq!(after.generation, 3);
    assert_eq!(after.rows, before.rows);
}
