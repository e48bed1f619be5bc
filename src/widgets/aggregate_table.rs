use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{
        Block, Borders, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState,
        StatefulWidget, Widget,
    },
};

use crate::config::{ColorParser, Theme};
use crate::cross_filter::FilterState;
use crate::formatter::ValueFormatter;
use crate::layout::page_size_label;
use crate::query::OrderByMetrics;
use crate::refresh::TableModel;
use crate::render_rule::{
    CellBar, ColumnRule, FooterContent, CLASS_IS_ACTIVE_FILTER, CLASS_IS_FILTER, CLASS_IS_NULL,
    CLASS_IS_SORTED,
};
use crate::types::{CellValue, ColumnMeta, DataRecord, HorizontalAlign};

const MIN_COLUMN_WIDTH: u16 = 4;
const MAX_COLUMN_WIDTH: u16 = 40;
const COLUMN_GAP: u16 = 1;

/// Colors the table draws with, resolved once from the theme
#[derive(Debug, Clone, Copy)]
pub struct TableColors {
    pub header: Color,
    pub border: Color,
    pub text: Color,
    pub dimmed: Color,
    pub selected: Color,
    pub bar_positive: Color,
    pub bar_negative: Color,
    pub active_filter: Color,
    /// Backdrop that translucent formatter colors are composited over
    pub background: (u8, u8, u8),
}

impl TableColors {
    pub fn from_theme(theme: &Theme) -> Self {
        let background = match theme.get("background") {
            Color::Rgb(r, g, b) => (r, g, b),
            Color::White => (255, 255, 255),
            _ => (0, 0, 0),
        };
        Self {
            header: theme.get("table_header"),
            border: theme.get("table_border"),
            text: theme.get("text_primary"),
            dimmed: theme.get("dimmed"),
            selected: theme.get("table_selected"),
            bar_positive: theme.get("bar_positive"),
            bar_negative: theme.get("bar_negative"),
            active_filter: theme.get("active_filter"),
            background,
        }
    }
}

impl Default for TableColors {
    fn default() -> Self {
        Self::from_theme(&Theme::default())
    }
}

/// Cursor and scroll position within the current model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableViewState {
    /// Selected row within the current page
    pub row: usize,
    pub col: usize,
    pub page: usize,
    pub row_offset: usize,
    pub col_offset: usize,
    /// Body rows that fit on screen after the last render
    pub visible_rows: usize,
}

impl TableViewState {
    /// Clamp the cursor after the model changed underneath it.
    pub fn clamp_to(&mut self, model: &TableModel) {
        self.page = self.page.min(model.page_count().saturating_sub(1));
        let rows = model.page(self.page).len();
        self.row = self.row.min(rows.saturating_sub(1));
        self.col = self.col.min(model.rules.len().saturating_sub(1));
        self.row_offset = self.row_offset.min(self.row);
        self.col_offset = self.col_offset.min(self.col);
    }

    pub fn move_rows(&mut self, model: &TableModel, delta: isize) {
        let rows = model.page(self.page).len();
        if rows == 0 {
            return;
        }
        self.row = self.row.saturating_add_signed(delta).min(rows - 1);
        if self.row < self.row_offset {
            self.row_offset = self.row;
        } else if self.visible_rows > 0 && self.row >= self.row_offset + self.visible_rows {
            self.row_offset = self.row + 1 - self.visible_rows;
        }
    }

    pub fn move_cols(&mut self, model: &TableModel, delta: isize) {
        if model.rules.is_empty() {
            return;
        }
        self.col = self
            .col
            .saturating_add_signed(delta)
            .min(model.rules.len() - 1);
        if self.col < self.col_offset {
            self.col_offset = self.col;
        }
    }

    /// Move to another page; returns whether the page changed.
    pub fn turn_page(&mut self, model: &TableModel, delta: isize) -> bool {
        let last = model.page_count().saturating_sub(1);
        let next = self.page.saturating_add_signed(delta).min(last);
        if next == self.page {
            return false;
        }
        self.page = next;
        self.row = 0;
        self.row_offset = 0;
        true
    }

    /// Rule, meta and row under the cursor.
    pub fn selected<'m>(
        &self,
        model: &'m TableModel,
    ) -> Option<(&'m ColumnRule, &'m ColumnMeta, &'m DataRecord)> {
        let row = model.page(self.page).get(self.row)?;
        let rule = model.rules.get(self.col)?;
        let meta = model.columns.get(self.col)?;
        Some((rule, meta, row))
    }
}

pub struct AggregateTable<'a> {
    model: &'a TableModel,
    filters: &'a FilterState,
    formatter: &'a dyn ValueFormatter,
    order_by: &'a OrderByMetrics,
    colors: TableColors,
    parser: &'a ColorParser,
    focused: bool,
}

impl<'a> AggregateTable<'a> {
    pub fn new(
        model: &'a TableModel,
        filters: &'a FilterState,
        formatter: &'a dyn ValueFormatter,
        parser: &'a ColorParser,
    ) -> Self {
        Self {
            model,
            filters,
            formatter,
            order_by: &NO_ORDER,
            colors: TableColors::default(),
            parser,
            focused: true,
        }
    }

    pub fn order_by(mut self, order_by: &'a OrderByMetrics) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn colors(mut self, colors: TableColors) -> Self {
        self.colors = colors;
        self
    }

    pub fn focused(mut self, focused: bool) -> Self {
        self.focused = focused;
        self
    }

    fn text_for(&self, meta: &ColumnMeta, value: &CellValue) -> String {
        self.formatter.format(meta, value).text
    }

    /// Terminal width of each column: configured widths win, otherwise the
    /// widest of header and page values.
    pub fn column_widths(&self, rows: &[DataRecord]) -> Vec<u16> {
        self.model
            .rules
            .iter()
            .zip(&self.model.columns)
            .map(|(rule, meta)| {
                if let Some(cells) = rule.column_width.as_ref().and_then(|w| w.terminal_cells()) {
                    return cells;
                }
                let widest = rows
                    .iter()
                    .map(|row| {
                        let value = row.get(&rule.key).cloned().unwrap_or_default();
                        self.text_for(meta, &value).chars().count()
                    })
                    .max()
                    .unwrap_or(0)
                    .max(rule.header.label.chars().count() + 2);
                (widest as u16).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH)
            })
            .collect()
    }

    fn sort_marker(&self, rule: &ColumnRule) -> Option<&'static str> {
        self.order_by
            .iter()
            .find(|(label, _)| *label == rule.header.label)
            .map(|(_, ascending)| if *ascending { " ▲" } else { " ▼" })
    }

    fn class_style(&self, classes: &str) -> Style {
        let mut style = Style::default().fg(self.colors.text);
        for class in classes.split_whitespace() {
            style = match class {
                CLASS_IS_NULL => style.fg(self.colors.dimmed).add_modifier(Modifier::ITALIC),
                CLASS_IS_ACTIVE_FILTER => style
                    .fg(self.colors.active_filter)
                    .add_modifier(Modifier::BOLD),
                CLASS_IS_FILTER => style,
                CLASS_IS_SORTED => style.add_modifier(Modifier::UNDERLINED),
                _ => style,
            };
        }
        style
    }

    fn render_header(&self, columns: &[(usize, Rect)], buf: &mut Buffer) {
        for &(i, rect) in columns {
            let rule = &self.model.rules[i];
            let marker = self.sort_marker(rule);
            let class_name = rule.header.class_name(marker.is_some());
            let mut style = self
                .class_style(&class_name)
                .fg(self.colors.header)
                .add_modifier(Modifier::BOLD);
            if class_name.contains(CLASS_IS_FILTER) {
                style = style.add_modifier(Modifier::ITALIC);
            }
            let label = format!("{}{}", rule.header.label, marker.unwrap_or(""));
            write_aligned(buf, rect, &label, rule.header.align, true, style);
        }
    }

    fn render_cell(
        &self,
        rect: Rect,
        (rule, meta): (&ColumnRule, &ColumnMeta),
        value: &CellValue,
        selected: bool,
        buf: &mut Buffer,
    ) {
        let render = rule.cell(value, self.filters);

        if let Some(bg) = render.background {
            let color = self.parser.blend(&bg, self.colors.background);
            fill(buf, rect, color);
        }
        if let Some(bar) = render.bar {
            self.render_bar(rect, &bar, buf);
        }

        let mut style = self.class_style(&render.class_name);
        if selected {
            style = style.add_modifier(Modifier::REVERSED);
            if self.colors.selected != Color::Reset {
                style = style.bg(self.colors.selected);
            }
        }
        let text = self.text_for(meta, value);
        write_aligned(buf, rect, &text, render.align, render.truncate, style);
    }

    fn render_totals(
        &self,
        columns: &[(usize, Rect)],
        y: u16,
        totals: &DataRecord,
        buf: &mut Buffer,
    ) {
        let style = Style::default()
            .fg(self.colors.text)
            .add_modifier(Modifier::BOLD);
        for &(i, rect) in columns {
            let cell = self.model.rules[i].footer(totals);
            let text = match &cell.content {
                FooterContent::Label(label) => label.to_string(),
                FooterContent::Value(value) => self.text_for(&self.model.columns[i], value),
            };
            let rect = Rect::new(rect.x, y, rect.width, 1);
            write_aligned(buf, rect, &text, cell.align, true, style);
        }
    }

    fn render_bar(&self, rect: Rect, bar: &CellBar, buf: &mut Buffer) {
        let (start, len) = bar_span(rect.width, bar);
        let color = if bar.negative && rule_colors_negative(bar) {
            self.colors.bar_negative
        } else {
            self.colors.bar_positive
        };
        fill(
            buf,
            Rect::new(rect.x + start, rect.y, len, rect.height),
            color,
        );
    }
}

static NO_ORDER: OrderByMetrics = Vec::new();

/// Negative bars get their own tint only when the column colors by sign.
fn rule_colors_negative(bar: &CellBar) -> bool {
    bar.color.r > 0
}

/// Horizontal start and length of a bar within a cell of `width` cells.
pub fn bar_span(width: u16, bar: &CellBar) -> (u16, u16) {
    let w = f64::from(width);
    let start = ((bar.offset_pct / 100.0) * w).round().clamp(0.0, w) as u16;
    let mut len = ((bar.width_pct / 100.0) * w).round() as u16;
    if len == 0 && bar.width_pct > 0.0 {
        len = 1;
    }
    (start, len.min(width - start.min(width)))
}

fn fill(buf: &mut Buffer, rect: Rect, color: Color) {
    for y in rect.top()..rect.bottom() {
        for x in rect.left()..rect.right() {
            if let Some(cell) = buf.cell_mut((x, y)) {
                cell.set_bg(color);
            }
        }
    }
}

fn write_aligned(
    buf: &mut Buffer,
    rect: Rect,
    text: &str,
    align: HorizontalAlign,
    truncate: bool,
    style: Style,
) {
    let width = rect.width as usize;
    if width == 0 {
        return;
    }
    let len = text.chars().count();
    let shown: String = if len > width && truncate && width > 1 {
        text.chars().take(width - 1).chain(std::iter::once('…')).collect()
    } else {
        text.chars().take(width).collect()
    };
    let shown_len = shown.chars().count() as u16;
    let pad = match align {
        HorizontalAlign::Left => 0,
        HorizontalAlign::Center => (rect.width - shown_len) / 2,
        HorizontalAlign::Right => rect.width - shown_len,
    };
    buf.set_stringn(rect.x + pad, rect.y, &shown, width, style);
}

impl StatefulWidget for &AggregateTable<'_> {
    type State = TableViewState;

    fn render(self, area: Rect, buf: &mut Buffer, state: &mut TableViewState) {
        let model = self.model;
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(if self.focused {
                self.colors.header
            } else {
                self.colors.border
            }));
        let inner = block.inner(area);
        block.render(area, buf);

        let totals_height = u16::from(model.totals.is_some() && !model.is_empty());
        let [body, totals_row, footer] = Layout::new(
            Direction::Vertical,
            [
                Constraint::Fill(1),
                Constraint::Length(totals_height),
                Constraint::Length(1),
            ],
        )
        .areas(inner);

        if model.is_empty() {
            Paragraph::new("No results")
                .style(Style::default().fg(self.colors.dimmed))
                .centered()
                .render(body, buf);
            return;
        }

        state.clamp_to(model);
        let rows = model.page(state.page);
        let widths = self.column_widths(rows);

        // keep the selected column on screen
        let content_width = body.width.saturating_sub(1);
        while state.col_offset < state.col {
            let used: u16 = widths[state.col_offset..=state.col]
                .iter()
                .map(|w| w + COLUMN_GAP)
                .sum();
            if used <= content_width {
                break;
            }
            state.col_offset += 1;
        }

        let mut columns = Vec::new();
        let mut x = body.x;
        for (i, width) in widths.iter().enumerate().skip(state.col_offset) {
            let right = body.x + content_width;
            if x >= right {
                break;
            }
            let w = (*width).min(right - x);
            columns.push((i, Rect::new(x, body.y, w, 1)));
            x += w + COLUMN_GAP;
        }

        self.render_header(&columns, buf);

        let body_rows = body.height.saturating_sub(1) as usize;
        state.visible_rows = body_rows;
        if state.row >= state.row_offset + body_rows.max(1) {
            state.row_offset = state.row + 1 - body_rows.max(1);
        }

        for (line, (index, row)) in rows
            .iter()
            .enumerate()
            .skip(state.row_offset)
            .take(body_rows)
            .enumerate()
        {
            let y = body.y + 1 + line as u16;
            for &(i, header_rect) in &columns {
                let rule = &model.rules[i];
                let meta = &model.columns[i];
                let value = row.get(&rule.key).cloned().unwrap_or_default();
                let selected = self.focused && index == state.row && i == state.col;
                let rect = Rect::new(header_rect.x, y, header_rect.width, 1);
                self.render_cell(rect, (rule, meta), &value, selected, buf);
            }
        }

        if let Some(totals) = &model.totals {
            self.render_totals(&columns, totals_row.y, totals, buf);
        }

        if rows.len() > body_rows && body_rows > 0 {
            let mut scroll = ScrollbarState::new(rows.len().saturating_sub(body_rows))
                .position(state.row_offset);
            Scrollbar::new(ScrollbarOrientation::VerticalRight).render(
                Rect::new(body.x, body.y + 1, body.width, body.height.saturating_sub(1)),
                buf,
                &mut scroll,
            );
        }

        let footer_text = format!(
            "Page {}/{}  Rows {}  Page size {}  Filters {}",
            state.page + 1,
            model.page_count(),
            model.row_count,
            page_size_label(model.page_size),
            self.filters.len()
        );
        Paragraph::new(footer_text)
            .style(Style::default().fg(self.colors.dimmed))
            .right_aligned()
            .render(footer, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::PlainFormatter;
    use crate::render_rule::{derive_rule, ChartDefaults, Rgba};
    use crate::types::DataType;

    fn model() -> TableModel {
        let columns = vec![
            ColumnMeta::new("region", DataType::String),
            ColumnMeta::new("SUM(profit)", DataType::Numeric).with_metric(true),
        ];
        let rows: Vec<DataRecord> = [("East", -10.0), ("West", 20.0), ("North", 5.0)]
            .iter()
            .map(|(r, p)| {
                DataRecord::from([
                    ("region".to_string(), CellValue::from(*r)),
                    ("SUM(profit)".to_string(), CellValue::Number(*p)),
                ])
            })
            .collect();
        let defaults = ChartDefaults {
            emit_cross_filters: true,
            ..Default::default()
        };
        let rules = columns
            .iter()
            .enumerate()
            .map(|(i, c)| derive_rule(i, c, &defaults, &[], &rows))
            .collect();
        TableModel {
            generation: 1,
            columns,
            rules,
            row_count: rows.len(),
            rows,
            page_size: 2,
            page_size_options: vec![0, 10],
            ..Default::default()
        }
    }

    #[test]
    fn test_bar_span_rounds_and_clamps() {
        let bar = CellBar {
            width_pct: 33.0,
            offset_pct: 0.0,
            color: Rgba::new(0, 0, 0, 0.2),
            negative: true,
        };
        assert_eq!(bar_span(10, &bar), (0, 3));

        let tiny = CellBar {
            width_pct: 0.5,
            offset_pct: 100.0,
            ..bar
        };
        assert_eq!(bar_span(10, &tiny), (10, 0));

        let sliver = CellBar {
            width_pct: 0.5,
            offset_pct: 50.0,
            ..bar
        };
        assert_eq!(bar_span(10, &sliver), (5, 1));
    }

    #[test]
    fn test_view_state_paging_and_cursor() {
        let model = model();
        let mut state = TableViewState::default();
        state.move_rows(&model, 5);
        assert_eq!(state.row, 1);
        assert!(state.turn_page(&model, 1));
        assert_eq!((state.page, state.row), (1, 0));
        assert!(!state.turn_page(&model, 1));
        state.move_cols(&model, 3);
        assert_eq!(state.col, 1);

        let (rule, _, row) = state.selected(&model).unwrap();
        assert_eq!(rule.key, "SUM(profit)");
        assert_eq!(row["region"], CellValue::from("North"));
    }

    #[test]
    fn test_render_marks_active_filter_and_draws_bars() {
        let model = model();
        let mut filters = FilterState::new();
        filters.insert("region", vec![CellValue::from("East")]);
        let formatter = PlainFormatter::default();
        let parser = ColorParser::with_capabilities(true, true);
        let colors = TableColors {
            bar_positive: Color::Indexed(238),
            bar_negative: Color::Indexed(52),
            active_filter: Color::Yellow,
            ..TableColors::default()
        };
        let table = AggregateTable::new(&model, &filters, &formatter, &parser)
            .colors(colors)
            .focused(false);

        let area = Rect::new(0, 0, 40, 8);
        let mut buf = Buffer::empty(area);
        let mut state = TableViewState::default();
        (&table).render(area, &mut buf, &mut state);

        let east_x = (0..area.width)
            .find(|&x| buf[(x, 2)].symbol() == "E")
            .unwrap();
        assert_eq!(buf[(east_x, 2)].fg, Color::Yellow);

        let has_bar = (0..area.width).any(|x| buf[(x, 3)].bg == Color::Indexed(238));
        assert!(has_bar);
        assert_eq!(state.visible_rows, 4);
    }

    #[test]
    fn test_totals_row_above_footer() {
        let mut model = model();
        model.totals = Some(DataRecord::from([(
            "SUM(profit)".to_string(),
            CellValue::Number(15.0),
        )]));
        let filters = FilterState::new();
        let formatter = PlainFormatter::default();
        let parser = ColorParser::with_capabilities(true, true);
        let table = AggregateTable::new(&model, &filters, &formatter, &parser);

        let area = Rect::new(0, 0, 40, 8);
        let mut buf = Buffer::empty(area);
        let mut state = TableViewState::default();
        (&table).render(area, &mut buf, &mut state);

        let line = |y: u16| -> String {
            (0..area.width).map(|x| buf[(x, y)].symbol().to_string()).collect()
        };
        let totals_line = line(5);
        assert!(totals_line.contains("Totals"));
        assert!(totals_line.trim_end_matches(['│', ' ']).ends_with("15"));
        assert!(buf[(1, 5)].modifier.contains(Modifier::BOLD));
        assert!(line(6).contains("Page 1/2"));
        assert_eq!(state.visible_rows, 3);
    }

    #[test]
    fn test_configured_width_wins() {
        let mut model = model();
        model.rules[0].column_width = Some(crate::types::ColumnWidth::Pixels(80.0));
        let filters = FilterState::new();
        let formatter = PlainFormatter::default();
        let parser = ColorParser::with_capabilities(true, true);
        let table = AggregateTable::new(&model, &filters, &formatter, &parser);
        let widths = table.column_widths(model.page(0));
        assert_eq!(widths[0], 10);
        assert!(widths[1] >= "SUM(profit)".len() as u16);
    }
}
