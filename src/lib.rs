use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    widgets::{Block, Paragraph, StatefulWidget, Widget},
};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod cache;
pub mod config;
pub mod cross_filter;
pub mod formatter;
pub mod layout;
pub mod query;
pub mod refresh;
pub mod render_rule;
pub mod transport;
pub mod types;
pub mod value_range;
pub mod widgets;

pub use cache::CacheManager;
pub use config::{AppConfig, ColorParser, ConfigManager, Theme};
pub use cross_filter::{CrossFilterCoordinator, DataMask, FilterState, FilterStateSink};
pub use dyntable_cli::Args;
pub use query::{AggregateFunction, AggregateQueryBuilder, AggregateSelection, FormData};
pub use refresh::{RefreshError, RefreshOrchestrator, RefreshOutcome, RefreshPhase, TableModel};
pub use transport::{ChartDataResult, Transport, TransportError};

use cross_filter::CellPoint;
use formatter::PlainFormatter;
use layout::{page_size_label, TableSize};
use query::OrderByMetrics;
use widgets::aggregate_table::{AggregateTable, TableColors, TableViewState};
use widgets::controls::Controls;
use widgets::debug::DebugState;
use widgets::selector::OptionRow;

pub const APP_NAME: &str = "dyntable";

#[derive(Debug, Clone)]
pub enum AppEvent {
    Key(KeyEvent),
    /// Build and dispatch a query for the current selections
    Refresh,
    /// A worker finished the fetch for a generation
    Fetched {
        generation: u64,
        result: Result<ChartDataResult, RefreshError>,
    },
    DataMask(DataMask),
    Exit,
    Crash(String),
    Resize(u16, u16), // resized (width, height)
}

/// Which part of the screen receives navigation keys
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    GroupBy,
    Metrics,
    Aggregate,
    #[default]
    Table,
}

impl Focus {
    fn next(self) -> Self {
        match self {
            Focus::GroupBy => Focus::Metrics,
            Focus::Metrics => Focus::Aggregate,
            Focus::Aggregate => Focus::Table,
            Focus::Table => Focus::GroupBy,
        }
    }

    fn prev(self) -> Self {
        match self {
            Focus::GroupBy => Focus::Table,
            Focus::Metrics => Focus::GroupBy,
            Focus::Aggregate => Focus::Metrics,
            Focus::Table => Focus::Aggregate,
        }
    }
}

pub struct App {
    events: Sender<AppEvent>,
    orchestrator: RefreshOrchestrator,
    selection: AggregateSelection,
    order_by: OrderByMetrics,
    filters: FilterState,
    coordinator: CrossFilterCoordinator,
    formatter: PlainFormatter,
    focus: Focus,
    group_by_cursor: usize,
    metric_cursor: usize,
    aggregate_cursor: usize,
    table_state: TableViewState,
    viewport: TableSize,
    theme: Theme,
    parser: ColorParser,
    debug: DebugState,
    status: Option<String>,
    error: Option<String>,
    /// Last data mask handed to the filter-state sink
    last_mask: Option<DataMask>,
}

impl App {
    pub fn new(
        events: Sender<AppEvent>,
        orchestrator: RefreshOrchestrator,
        selection: AggregateSelection,
        config: &AppConfig,
    ) -> App {
        let theme = Theme::from_config(&config.theme).unwrap_or_else(|e| {
            warn!(error = %e, "invalid theme, using defaults");
            Theme::default()
        });
        Self::with_theme(events, orchestrator, selection, config, theme)
    }

    pub fn with_theme(
        events: Sender<AppEvent>,
        orchestrator: RefreshOrchestrator,
        selection: AggregateSelection,
        config: &AppConfig,
        theme: Theme,
    ) -> App {
        let form = orchestrator.form();
        let defaults = form.chart_defaults(&orchestrator.settings().chart_defaults);
        let coordinator =
            CrossFilterCoordinator::new(form.time_grain_sqla, defaults.emit_cross_filters);
        let formatter = PlainFormatter::new(form.time_grain_sqla);
        let aggregate_cursor = AggregateFunction::ALL
            .iter()
            .position(|f| *f == selection.aggregate_function)
            .unwrap_or(0);

        App {
            events,
            orchestrator,
            selection,
            order_by: OrderByMetrics::new(),
            filters: FilterState::new(),
            coordinator,
            formatter,
            focus: Focus::default(),
            group_by_cursor: 0,
            metric_cursor: 0,
            aggregate_cursor,
            table_state: TableViewState::default(),
            viewport: TableSize::default(),
            theme,
            parser: ColorParser::new(),
            debug: DebugState::new(
                config.debug.enabled,
                config.debug.show_query,
                config.debug.show_generation,
            ),
            status: None,
            error: None,
            last_mask: None,
        }
    }

    pub fn send_event(&mut self, event: AppEvent) -> color_eyre::Result<()> {
        self.events.send(event)?;
        Ok(())
    }

    pub fn selection(&self) -> &AggregateSelection {
        &self.selection
    }

    pub fn filters(&self) -> &FilterState {
        &self.filters
    }

    pub fn order_by(&self) -> &OrderByMetrics {
        &self.order_by
    }

    pub fn model(&self) -> Arc<TableModel> {
        self.orchestrator.model()
    }

    pub fn orchestrator(&self) -> &RefreshOrchestrator {
        &self.orchestrator
    }

    pub fn focus(&self) -> Focus {
        self.focus
    }

    pub fn table_state(&self) -> &TableViewState {
        &self.table_state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn last_mask(&self) -> Option<&DataMask> {
        self.last_mask.as_ref()
    }

    fn color(&self, name: &str) -> Color {
        self.theme.get(name)
    }

    pub fn event(&mut self, event: &AppEvent) -> Option<AppEvent> {
        self.debug.num_events += 1;
        match event {
            AppEvent::Key(key) => self.key(key),
            AppEvent::Refresh => {
                self.dispatch_refresh();
                None
            }
            AppEvent::Fetched { generation, result } => {
                self.apply_fetch(*generation, result.clone());
                None
            }
            AppEvent::DataMask(mask) => {
                self.set_data_mask(mask.clone());
                None
            }
            AppEvent::Resize(cols, rows) => {
                self.viewport = TableSize::new(*cols, *rows);
                if self.orchestrator.resize(self.viewport) {
                    debug!(width = cols, height = rows, "table refitted");
                }
                None
            }
            AppEvent::Crash(msg) => {
                self.error = Some(msg.clone());
                None
            }
            AppEvent::Exit => None,
        }
    }

    /// Start a new refresh cycle. The fetch runs on a worker thread that
    /// reports back with `AppEvent::Fetched`.
    fn dispatch_refresh(&mut self) {
        let ticket = self.orchestrator.begin(&self.selection, &self.order_by);
        if self.debug.show_query {
            self.debug.last_query = serde_json::to_string(&ticket.query).ok();
        }
        self.status = Some(format!("Fetching (generation {})", ticket.generation));
        self.sync_debug();

        let transport = self.orchestrator.transport();
        let endpoint = self.orchestrator.settings().endpoint.clone();
        let events = self.events.clone();
        std::thread::spawn(move || {
            let result = refresh::fetch(transport.as_ref(), &endpoint, &ticket.query);
            // the receiver is gone once the app has exited
            let _ = events.send(AppEvent::Fetched {
                generation: ticket.generation,
                result,
            });
        });
    }

    fn apply_fetch(&mut self, generation: u64, result: Result<ChartDataResult, RefreshError>) {
        match self.orchestrator.complete(generation, result, self.viewport) {
            RefreshOutcome::Applied(model) => {
                self.table_state.clamp_to(&model);
                self.status = Some(format!("{} rows", model.row_count));
                self.error = None;
            }
            RefreshOutcome::Stale { .. } => {
                self.debug.stale_dropped += 1;
            }
            RefreshOutcome::Failed(err) => {
                self.error = Some(err.to_string());
                self.status = None;
            }
        }
        if self.orchestrator.in_flight() > 0 {
            self.status = Some(format!(
                "Fetching ({} in flight)",
                self.orchestrator.in_flight()
            ));
        }
        self.sync_debug();
    }

    fn sync_debug(&mut self) {
        self.debug.phase = Some(self.orchestrator.phase());
        self.debug.generation = self.orchestrator.last_applied_generation();
        self.debug.in_flight = self.orchestrator.in_flight();
    }

    fn key(&mut self, event: &KeyEvent) -> Option<AppEvent> {
        if event.kind != KeyEventKind::Press {
            return None;
        }
        self.debug.last_event = format!("{:?}", event.code);

        match event.code {
            KeyCode::Char('c') if event.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(AppEvent::Exit)
            }
            KeyCode::Char('q') | KeyCode::Esc => Some(AppEvent::Exit),
            KeyCode::Tab => {
                self.focus = self.focus.next();
                None
            }
            KeyCode::BackTab => {
                self.focus = self.focus.prev();
                None
            }
            KeyCode::Char('r') => Some(AppEvent::Refresh),
            KeyCode::Enter if self.focus != Focus::Table => Some(AppEvent::Refresh),
            KeyCode::Char('f') => Some(AppEvent::DataMask(self.coordinator.clear_mask())),
            KeyCode::Char('[') => self.turn_page(-1),
            KeyCode::Char(']') => self.turn_page(1),
            KeyCode::Char('p') => {
                self.cycle_page_size();
                None
            }
            KeyCode::Char('o') => self.toggle_order(),
            KeyCode::Char('d') => {
                self.drill();
                None
            }
            _ => match self.focus {
                Focus::Table => self.table_key(event),
                _ => {
                    self.selector_key(event);
                    None
                }
            },
        }
    }

    fn table_key(&mut self, event: &KeyEvent) -> Option<AppEvent> {
        let model = self.orchestrator.model();
        match event.code {
            KeyCode::Up | KeyCode::Char('k') => self.table_state.move_rows(&model, -1),
            KeyCode::Down | KeyCode::Char('j') => self.table_state.move_rows(&model, 1),
            KeyCode::Left | KeyCode::Char('h') => self.table_state.move_cols(&model, -1),
            KeyCode::Right | KeyCode::Char('l') => self.table_state.move_cols(&model, 1),
            KeyCode::PageUp => {
                let step = self.table_state.visible_rows.max(1) as isize;
                self.table_state.move_rows(&model, -step);
            }
            KeyCode::PageDown => {
                let step = self.table_state.visible_rows.max(1) as isize;
                self.table_state.move_rows(&model, step);
            }
            KeyCode::Enter | KeyCode::Char(' ') => return self.click_cell(&model),
            _ => {}
        }
        None
    }

    /// Cross-filter on the selected cell, when its column allows it.
    fn click_cell(&mut self, model: &TableModel) -> Option<AppEvent> {
        let (rule, _, row) = self.table_state.selected(model)?;
        let value = row.get(&rule.key).cloned().unwrap_or_default();
        if !rule.cell(&value, &self.filters).clickable {
            return None;
        }
        self.coordinator
            .on_cell_click(&self.filters, &rule.key, &value, false)
            .map(AppEvent::DataMask)
    }

    fn drill(&mut self) {
        let model = self.orchestrator.model();
        let Some((rule, _, row)) = self.table_state.selected(&model) else {
            return;
        };
        let value = row.get(&rule.key).cloned().unwrap_or_default();
        let payload = self.coordinator.context_menu(
            &self.filters,
            &model.columns,
            row,
            CellPoint {
                key: &rule.key,
                value: &value,
                is_metric: rule.is_metric,
            },
            &self.formatter,
            self.orchestrator.form().is_raw_records(),
        );
        match payload {
            Some(payload) => {
                let detail = payload
                    .drill_to_detail
                    .iter()
                    .map(|c| {
                        format!(
                            "{} == {}",
                            c.col,
                            c.formatted_val.clone().unwrap_or_else(|| c.val.to_string())
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(
                    drill_to_detail = %serde_json::to_string(&payload.drill_to_detail).unwrap_or_default(),
                    drill_by = %serde_json::to_string(&payload.drill_by).unwrap_or_default(),
                    cross_filter = payload.cross_filter.is_some(),
                    "context menu"
                );
                self.status = Some(format!("Drill to detail: {}", detail));
            }
            None => self.status = Some("No drill actions for raw records".to_string()),
        }
    }

    fn turn_page(&mut self, delta: isize) -> Option<AppEvent> {
        let model = self.orchestrator.model();
        if !self.table_state.turn_page(&model, delta) {
            return None;
        }
        if model.server_pagination {
            let mask = self
                .coordinator
                .server_pagination_mask(self.table_state.page, model.page_size);
            return Some(AppEvent::DataMask(mask));
        }
        None
    }

    fn cycle_page_size(&mut self) {
        let model = self.orchestrator.model();
        if model.page_size_options.is_empty() {
            return;
        }
        let next = model
            .page_size_options
            .iter()
            .position(|n| *n == model.page_size)
            .map(|i| (i + 1) % model.page_size_options.len())
            .unwrap_or(0);
        let page_size = model.page_size_options[next];
        self.orchestrator.set_page_size(page_size);
        self.table_state.page = 0;
        self.table_state.clamp_to(&self.orchestrator.model());
        self.status = Some(format!("Page size {}", page_size_label(page_size)));
    }

    /// Cycle the selected metric column through descending, ascending and
    /// unordered, then refresh.
    fn toggle_order(&mut self) -> Option<AppEvent> {
        let model = self.orchestrator.model();
        let (rule, _, _) = self.table_state.selected(&model)?;
        if !rule.is_metric {
            return None;
        }
        let label = rule.header.label.clone();
        match self.order_by.iter().position(|(l, _)| *l == label) {
            None => self.order_by.push((label, false)),
            Some(i) if !self.order_by[i].1 => self.order_by[i].1 = true,
            Some(i) => {
                self.order_by.remove(i);
            }
        }
        Some(AppEvent::Refresh)
    }

    fn selector_key(&mut self, event: &KeyEvent) {
        let len = match self.focus {
            Focus::GroupBy => self.orchestrator.form().all_columns.len(),
            Focus::Metrics => self.orchestrator.form().visible_metrics_columns.len(),
            Focus::Aggregate => AggregateFunction::ALL.len(),
            Focus::Table => return,
        };
        let cursor = match self.focus {
            Focus::GroupBy => &mut self.group_by_cursor,
            Focus::Metrics => &mut self.metric_cursor,
            _ => &mut self.aggregate_cursor,
        };
        match event.code {
            KeyCode::Left | KeyCode::Char('h') => *cursor = cursor.saturating_sub(1),
            KeyCode::Right | KeyCode::Char('l') => {
                *cursor = (*cursor + 1).min(len.saturating_sub(1));
            }
            KeyCode::Char(' ') => self.toggle_selected_option(),
            _ => {}
        }
    }

    fn toggle_selected_option(&mut self) {
        let form = self.orchestrator.form();
        match self.focus {
            Focus::GroupBy => {
                if let Some(column) = form.all_columns.get(self.group_by_cursor).cloned() {
                    self.selection.toggle_group_by(&column);
                }
            }
            Focus::Metrics => {
                if let Some(column) = form
                    .visible_metrics_columns
                    .get(self.metric_cursor)
                    .cloned()
                {
                    self.selection.toggle_metric(&column);
                }
            }
            Focus::Aggregate => {
                if let Some(function) = AggregateFunction::ALL.get(self.aggregate_cursor) {
                    self.selection.aggregate_function = *function;
                }
            }
            Focus::Table => {}
        }
    }

    fn option_rows(&self) -> [OptionRow<'static>; 3] {
        let form = self.orchestrator.form();
        let accent = self.color("primary");
        let dimmed = self.color("dimmed");
        let group_by = OptionRow::new(
            "Group by",
            form.all_columns.clone(),
            form.all_columns
                .iter()
                .map(|c| self.selection.group_by_columns.contains(c))
                .collect(),
        )
        .cursor(self.group_by_cursor)
        .focused(self.focus == Focus::GroupBy);
        let metrics = OptionRow::new(
            "Metrics",
            form.visible_metrics_columns.clone(),
            form.visible_metrics_columns
                .iter()
                .map(|c| self.selection.metric_columns.contains(c))
                .collect(),
        )
        .cursor(self.metric_cursor)
        .focused(self.focus == Focus::Metrics);
        let aggregate = OptionRow::new(
            "Aggregate",
            AggregateFunction::ALL
                .iter()
                .map(|f| f.display_name().to_string())
                .collect(),
            AggregateFunction::ALL
                .iter()
                .map(|f| *f == self.selection.aggregate_function)
                .collect(),
        )
        .cursor(self.aggregate_cursor)
        .focused(self.focus == Focus::Aggregate)
        .single(true);
        [group_by, metrics, aggregate].map(|row| row.colors(accent, dimmed))
    }
}

impl FilterStateSink for App {
    fn set_data_mask(&mut self, mask: DataMask) {
        info!(
            mask = %serde_json::to_string(&mask).unwrap_or_default(),
            "data mask emitted"
        );
        self.filters.apply(&mask);
        if let Some(own) = &mask.own_state {
            self.status = Some(format!("Page {}", own.current_page + 1));
        } else if let Some(state) = &mask.filter_state {
            self.status = Some(if state.label.is_empty() {
                "Cross filters cleared".to_string()
            } else {
                format!("Cross filter: {}", state.label)
            });
        }
        self.last_mask = Some(mask);
    }
}

impl Widget for &mut App {
    fn render(self, area: Rect, buf: &mut Buffer) {
        self.debug.num_frames += 1;

        let background_color = self.color("background");
        Block::default()
            .style(Style::default().bg(background_color))
            .render(area, buf);

        let mut constraints = vec![
            Constraint::Length(3), // selectors
            Constraint::Fill(1),
            Constraint::Length(1), // status
            Constraint::Length(1), // controls
        ];
        if self.debug.enabled {
            constraints.push(Constraint::Length(self.debug.height()));
        }
        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(area);

        let selectors = Layout::new(Direction::Vertical, [Constraint::Length(1); 3]).split(layout[0]);
        for (row, rect) in self.option_rows().iter().zip(selectors.iter()) {
            row.render(*rect, buf);
        }

        let model = self.orchestrator.model();
        let size = model.size;
        let table_area = if size.width > 0 && size.height > 0 {
            Rect::new(
                layout[1].x,
                layout[1].y,
                size.width.min(layout[1].width),
                size.height.min(layout[1].height),
            )
        } else {
            layout[1]
        };
        let colors = TableColors::from_theme(&self.theme);
        let table = AggregateTable::new(&model, &self.filters, &self.formatter, &self.parser)
            .order_by(&self.order_by)
            .colors(colors)
            .focused(self.focus == Focus::Table);
        (&table).render(table_area, buf, &mut self.table_state);

        let (message, color) = match (&self.error, &self.status) {
            (Some(err), _) => (err.as_str(), self.color("error")),
            (None, Some(status)) => (status.as_str(), self.color("text_secondary")),
            (None, None) => ("", self.color("text_secondary")),
        };
        Paragraph::new(message)
            .style(Style::default().fg(color))
            .render(layout[2], buf);

        let controls = Controls::with_row_count(model.row_count)
            .with_loading(self.orchestrator.in_flight() > 0)
            .with_background(self.color("controls_bg"));
        controls.render(layout[3], buf);

        if self.debug.enabled {
            self.sync_debug();
            self.debug.render(layout[4], buf);
        }
    }
}
