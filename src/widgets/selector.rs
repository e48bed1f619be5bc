use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Paragraph, Widget},
};

/// One row of selectable options: group-by columns, metrics or aggregate
/// functions. Checked options are drawn as `[x]`; `single` rows use `(*)`.
pub struct OptionRow<'a> {
    label: &'a str,
    options: Vec<String>,
    checked: Vec<bool>,
    cursor: usize,
    focused: bool,
    single: bool,
    accent: Color,
    dimmed: Color,
}

impl<'a> OptionRow<'a> {
    pub fn new(label: &'a str, options: Vec<String>, checked: Vec<bool>) -> Self {
        Self {
            label,
            options,
            checked,
            cursor: 0,
            focused: false,
            single: false,
            accent: Color::Cyan,
            dimmed: Color::DarkGray,
        }
    }

    pub fn cursor(mut self, cursor: usize) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn focused(mut self, focused: bool) -> Self {
        self.focused = focused;
        self
    }

    pub fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    pub fn colors(mut self, accent: Color, dimmed: Color) -> Self {
        self.accent = accent;
        self.dimmed = dimmed;
        self
    }

    fn spans(&self) -> Vec<Span<'_>> {
        let label_style = if self.focused {
            Style::default().fg(self.accent).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(self.dimmed)
        };
        let mut spans = vec![Span::styled(format!("{}: ", self.label), label_style)];

        if self.options.is_empty() {
            spans.push(Span::styled("none", Style::default().fg(self.dimmed)));
            return spans;
        }

        for (i, option) in self.options.iter().enumerate() {
            let checked = self.checked.get(i).copied().unwrap_or(false);
            let mark = match (self.single, checked) {
                (true, true) => "(*)",
                (true, false) => "( )",
                (false, true) => "[x]",
                (false, false) => "[ ]",
            };
            let mut style = if checked {
                Style::default().add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            if self.focused && i == self.cursor {
                style = style.add_modifier(Modifier::REVERSED);
            }
            spans.push(Span::styled(format!("{} {}", mark, option), style));
            spans.push(Span::raw("  "));
        }
        spans
    }
}

impl Widget for &OptionRow<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        // scroll so the cursor stays visible on narrow terminals
        let spans = self.spans();
        let mut skip = 0;
        if self.focused && !self.options.is_empty() {
            let cursor_span = 1 + self.cursor * 2;
            let width_through_cursor: usize = spans
                .iter()
                .take(cursor_span + 1)
                .map(|s| s.content.chars().count())
                .sum();
            let mut overflow = width_through_cursor.saturating_sub(area.width as usize);
            while overflow > 0 && skip + 1 < cursor_span {
                overflow = overflow.saturating_sub(spans[1 + skip].content.chars().count());
                skip += 1;
            }
        }
        let mut visible = vec![spans[0].clone()];
        visible.extend(spans.into_iter().skip(1 + skip));
        Paragraph::new(Line::from(visible)).render(area, buf);
    }
}
