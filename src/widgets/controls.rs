use ratatui::style::Stylize;
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    widgets::{Paragraph, Widget},
};

const CONTROLS: [(&str, &str); 8] = [
    ("Tab", "Focus"),
    ("Spc", "Pick"),
    ("Enter", "Run"),
    ("f", "Clear"),
    ("o", "Order"),
    ("[]", "Page"),
    ("p", "Size"),
    ("q", "Quit"),
];

#[derive(Default)]
pub struct Controls {
    pub row_count: Option<usize>,
    pub loading: bool,
    pub dimmed: bool,
    pub background: Option<Color>,
}

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row_count(row_count: usize) -> Self {
        Self {
            row_count: Some(row_count),
            ..Self::default()
        }
    }

    pub fn with_loading(mut self, loading: bool) -> Self {
        self.loading = loading;
        self
    }

    pub fn with_dimmed(mut self, dimmed: bool) -> Self {
        self.dimmed = dimmed;
        self
    }

    pub fn with_background(mut self, background: Color) -> Self {
        self.background = Some(background);
        self
    }
}

impl Widget for &Controls {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let mut constraints = CONTROLS.iter().fold(vec![], |mut acc, (key, action)| {
            acc.push(Constraint::Length(key.chars().count() as u16 + 2));
            acc.push(Constraint::Length(action.chars().count() as u16 + 1));
            acc
        });
        constraints.push(Constraint::Fill(1));
        constraints.push(Constraint::Length(12)); // "Loading..." or "Rows: 12345"

        let layout = Layout::new(Direction::Horizontal, constraints).split(area);
        let color = self.background.unwrap_or(Color::DarkGray);

        let base_style = if self.dimmed {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default()
        };

        for (i, (key, action)) in CONTROLS.iter().enumerate() {
            let j = i * 2;
            Paragraph::new(*key)
                .style(base_style.bold())
                .centered()
                .render(layout[j], buf);
            Paragraph::new(*action)
                .style(base_style.bg(color))
                .render(layout[j + 1], buf);
        }

        let fill_idx = CONTROLS.len() * 2;
        Paragraph::new("")
            .style(base_style.bg(color))
            .render(layout[fill_idx], buf);

        let status = if self.loading {
            Some("Loading...".to_string())
        } else {
            self.row_count.map(|count| format!("Rows: {}", count))
        };
        Paragraph::new(status.unwrap_or_default())
            .style(base_style.bg(color).fg(if self.dimmed {
                Color::DarkGray
            } else if self.loading {
                Color::Yellow
            } else {
                Color::White
            }))
            .right_aligned()
            .render(layout[fill_idx + 1], buf);
    }
}
