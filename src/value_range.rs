use crate::types::DataRecord;
use serde::{Deserialize, Serialize};

/// `[min, max]` over a column's current numeric cell values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Extent above zero
    pub fn pos_extent(&self) -> f64 {
        self.max.max(0.0).abs()
    }

    /// Extent below zero, as a positive number
    pub fn neg_extent(&self) -> f64 {
        self.min.min(0.0).abs()
    }
}

/// How a column is judged to be numeric before computing its range.
///
/// `FirstRow` looks at the first row only; `AllRows` requires every non-null
/// value to be numeric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericDetection {
    #[default]
    FirstRow,
    AllRows,
}

impl NumericDetection {
    pub fn is_numeric(self, key: &str, rows: &[DataRecord]) -> bool {
        match self {
            NumericDetection::FirstRow => rows
                .first()
                .and_then(|row| row.get(key))
                .is_some_and(|v| v.is_number()),
            NumericDetection::AllRows => {
                let mut seen = false;
                for value in rows.iter().filter_map(|row| row.get(key)) {
                    if value.is_null() {
                        continue;
                    }
                    if !value.is_number() {
                        return false;
                    }
                    seen = true;
                }
                seen
            }
        }
    }
}

/// Compute the range used for proportional cell bars.
///
/// Returns `None` for empty row sets and for columns that are not numeric
/// under the first-row heuristic.
pub fn compute_range(
    column_key: &str,
    rows: &[DataRecord],
    align_positive_negative: bool,
) -> Option<ValueRange> {
    compute_range_with(
        NumericDetection::FirstRow,
        column_key,
        rows,
        align_positive_negative,
    )
}

pub fn compute_range_with(
    detection: NumericDetection,
    column_key: &str,
    rows: &[DataRecord],
    align_positive_negative: bool,
) -> Option<ValueRange> {
    if !detection.is_numeric(column_key, rows) {
        return None;
    }
    let mut nums = rows
        .iter()
        .filter_map(|row| row.get(column_key).and_then(|v| v.as_f64()))
        .filter(|n| !n.is_nan());

    let first = nums.next()?;
    if align_positive_negative {
        let max = nums.fold(first.abs(), |acc, n| acc.max(n.abs()));
        Some(ValueRange::new(0.0, max))
    } else {
        let (min, max) = nums.fold((first, first), |(lo, hi), n| (lo.min(n), hi.max(n)));
        Some(ValueRange::new(min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CellValue;

    fn rows(key: &str, values: Vec<CellValue>) -> Vec<DataRecord> {
        values
            .into_iter()
            .map(|v| DataRecord::from([(key.to_string(), v)]))
            .collect()
    }

    #[test]
    fn test_standard_extent() {
        let data = rows("profit", vec![(-10.0).into(), 5.0.into(), 20.0.into()]);
        assert_eq!(
            compute_range("profit", &data, false),
            Some(ValueRange::new(-10.0, 20.0))
        );
    }

    #[test]
    fn test_aligned_extent_uses_absolute_max() {
        let data = rows("profit", vec![(-30.0).into(), 5.0.into(), 20.0.into()]);
        assert_eq!(
            compute_range("profit", &data, true),
            Some(ValueRange::new(0.0, 30.0))
        );
    }

    #[test]
    fn test_empty_rows() {
        assert_eq!(compute_range("profit", &[], false), None);
    }

    #[test]
    fn test_first_row_decides_type() {
        let data = rows("x", vec!["a".into(), 5.0.into()]);
        assert_eq!(compute_range("x", &data, false), None);

        let data = rows("x", vec![5.0.into(), "a".into(), 9.0.into()]);
        assert_eq!(compute_range("x", &data, false), Some(ValueRange::new(5.0, 9.0)));
    }

    #[test]
    fn test_all_rows_detection_rejects_mixed_columns() {
        let data = rows("x", vec![5.0.into(), "a".into(), 9.0.into()]);
        assert_eq!(
            compute_range_with(NumericDetection::AllRows, "x", &data, false),
            None
        );
        let data = rows("x", vec![CellValue::Null, 1.0.into(), 9.0.into()]);
        assert_eq!(
            compute_range_with(NumericDetection::AllRows, "x", &data, false),
            Some(ValueRange::new(1.0, 9.0))
        );
    }

    #[test]
    fn test_range_contains_every_value() {
        let values = [3.5, -2.0, 0.0, 17.25, -8.5, 4.0];
        let data = rows("v", values.iter().map(|v| (*v).into()).collect());
        let range = compute_range("v", &data, false).unwrap();
        for v in values {
            assert!(range.min <= v && v <= range.max);
        }
        let aligned = compute_range("v", &data, true).unwrap();
        assert_eq!(aligned.min, 0.0);
        assert_eq!(aligned.max, 17.25);
    }

    #[test]
    fn test_extents() {
        let range = ValueRange::new(-10.0, 20.0);
        assert_eq!(range.pos_extent(), 20.0);
        assert_eq!(range.neg_extent(), 10.0);
        let positive = ValueRange::new(5.0, 9.0);
        assert_eq!(positive.neg_extent(), 0.0);
    }
}
