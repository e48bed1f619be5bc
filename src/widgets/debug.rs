use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Style},
    widgets::{Paragraph, Widget, Wrap},
};

use crate::refresh::RefreshPhase;

/// Counters shown in the debug row
#[derive(Debug, Clone, Default)]
pub struct DebugState {
    pub enabled: bool,
    pub show_query: bool,
    pub show_generation: bool,
    pub num_events: usize,
    pub num_frames: usize,
    pub phase: Option<RefreshPhase>,
    pub generation: u64,
    pub in_flight: usize,
    pub stale_dropped: usize,
    pub last_event: String,
    /// Query JSON of the most recent dispatch
    pub last_query: Option<String>,
}

impl DebugState {
    pub fn new(enabled: bool, show_query: bool, show_generation: bool) -> Self {
        Self {
            enabled,
            show_query,
            show_generation,
            ..Default::default()
        }
    }

    /// Rows the debug area needs
    pub fn height(&self) -> u16 {
        match (self.enabled, self.show_query && self.last_query.is_some()) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => 3,
        }
    }

    fn summary(&self) -> String {
        let mut parts = vec![
            format!("events {}", self.num_events),
            format!("frames {}", self.num_frames),
        ];
        if let Some(phase) = self.phase {
            parts.push(format!("phase {:?}", phase));
        }
        if self.show_generation {
            parts.push(format!("gen {}", self.generation));
            parts.push(format!("in-flight {}", self.in_flight));
            parts.push(format!("stale {}", self.stale_dropped));
        }
        if !self.last_event.is_empty() {
            parts.push(format!("last {}", self.last_event));
        }
        parts.join(" | ")
    }
}

impl Widget for &DebugState {
    fn render(self, area: Rect, buf: &mut Buffer) {
        if !self.enabled || area.height == 0 {
            return;
        }
        let style = Style::default().fg(Color::DarkGray);
        let mut text = self.summary();
        if self.show_query {
            if let Some(query) = &self.last_query {
                text.push('\n');
                text.push_str(query);
            }
        }
        Paragraph::new(text)
            .style(style)
            .wrap(Wrap { trim: true })
            .render(area, buf);
    }
}
