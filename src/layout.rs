use serde::{Deserialize, Serialize};

/// Page sizes offered by the table; 0 means all rows
pub const PAGE_SIZE_OPTIONS: [usize; 6] = [0, 10, 20, 50, 100, 200];

/// Width and height in terminal cells
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSize {
    pub width: u16,
    pub height: u16,
}

impl TableSize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

/// Sizes the table inside the viewport, leaving room for the selection
/// controls, padding and scrollbars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutCalculator {
    pub scrollbar_size: u16,
    pub padding: u16,
    pub control_height: u16,
}

impl Default for LayoutCalculator {
    fn default() -> Self {
        Self {
            scrollbar_size: 1,
            padding: 1,
            control_height: 3,
        }
    }
}

impl LayoutCalculator {
    /// New table size for a viewport change, or `None` when the difference is
    /// only scrollbar jitter and the table should stay as it is.
    pub fn fit(&self, viewport: TableSize, current: TableSize) -> Option<TableSize> {
        let sb = i32::from(self.scrollbar_size);
        let chrome = i32::from(self.control_height) + i32::from(self.padding);
        let (vw, vh) = (i32::from(viewport.width), i32::from(viewport.height));
        let (tw, th) = (i32::from(current.width), i32::from(current.height));

        if vw - tw > sb || vh - th > sb + chrome {
            // growing
            Some(TableSize::new(clamp(vw - sb), clamp(vh - sb - chrome)))
        } else if tw - vw > sb || th - vh > sb - chrome {
            // shrinking
            Some(TableSize::new(viewport.width, clamp(vh - chrome)))
        } else {
            None
        }
    }

    /// Apply `fit` until the size is stable.
    pub fn settle(&self, viewport: TableSize, mut current: TableSize) -> TableSize {
        for _ in 0..4 {
            match self.fit(viewport, current) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current
    }
}

fn clamp(n: i32) -> u16 {
    n.clamp(0, i32::from(u16::MAX)) as u16
}

/// Page sizes worth offering for the current data.
///
/// With server pagination a size is offered when it does not exceed the total
/// row count; otherwise when it does not exceed twice the loaded rows.
pub fn page_size_options(server_pagination: bool, row_count: usize, data_len: usize) -> Vec<usize> {
    PAGE_SIZE_OPTIONS
        .into_iter()
        .filter(|n| {
            if server_pagination {
                *n <= row_count
            } else {
                *n <= 2 * data_len
            }
        })
        .collect()
}

pub fn page_size_label(n: usize) -> String {
    if n == 0 {
        "All".to_string()
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_reserves_room_for_controls() {
        let calc = LayoutCalculator::default();
        let viewport = TableSize::new(120, 40);
        assert_eq!(calc.settle(viewport, viewport), TableSize::new(120, 36));
    }

    #[test]
    fn test_growth_from_empty() {
        let calc = LayoutCalculator::default();
        let size = calc.fit(TableSize::new(100, 30), TableSize::default());
        assert_eq!(size, Some(TableSize::new(99, 25)));
    }

    #[test]
    fn test_scrollbar_jitter_is_ignored() {
        let calc = LayoutCalculator::default();
        let viewport = TableSize::new(100, 30);
        let settled = calc.settle(viewport, TableSize::default());
        assert_eq!(calc.fit(viewport, settled), None);
        assert_eq!(calc.fit(TableSize::new(98, 30), settled), None);
        assert!(calc.fit(TableSize::new(110, 30), settled).is_some());
    }

    #[test]
    fn test_tiny_viewport_saturates() {
        let calc = LayoutCalculator::default();
        let size = calc.settle(TableSize::new(2, 2), TableSize::new(80, 24));
        assert_eq!(size.height, 0);
    }

    #[test]
    fn test_page_size_options() {
        assert_eq!(page_size_options(false, 0, 30), vec![0, 10, 20, 50]);
        assert_eq!(page_size_options(false, 0, 0), vec![0]);
        assert_eq!(page_size_options(true, 120, 10), vec![0, 10, 20, 50, 100]);
        assert_eq!(page_size_label(0), "All");
        assert_eq!(page_size_label(50), "50");
    }
}
