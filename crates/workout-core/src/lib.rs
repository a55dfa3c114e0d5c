//! Core domain model for workout-history ingestion.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "workout-core";

pub const DATE_SUBMITTED: &str = "Date Submitted";
pub const WORKOUT_DATE: &str = "Workout Date";
pub const ACTIVITY_TYPE: &str = "Activity Type";
pub const CALORIES_BURNED: &str = "Calories Burned (kcal)";
pub const DISTANCE_MI: &str = "Distance (mi)";
pub const WORKOUT_TIME_SECONDS: &str = "Workout Time (seconds)";
pub const AVG_PACE: &str = "Avg Pace (min/mi)";
pub const MAX_PACE: &str = "Max Pace (min/mi)";
pub const STEPS: &str = "Steps";
pub const LINK: &str = "Link";

pub const EXPORT_COLUMNS: [&str; 10] = [
    DATE_SUBMITTED,
    WORKOUT_DATE,
    ACTIVITY_TYPE,
    CALORIES_BURNED,
    DISTANCE_MI,
    WORKOUT_TIME_SECONDS,
    AVG_PACE,
    MAX_PACE,
    STEPS,
    LINK,
];

/// Loosely-typed cell value. `Absent` is the explicit "no value" marker.
// Untagged: `Date` must stay ahead of `Text` so ISO dates read back as dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Absent,
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn is_non_finite(&self) -> bool {
        matches!(self, Self::Number(n) if !n.is_finite())
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("None"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Absent)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(with = "cells_as_map")]
    cells: Vec<(String, Scalar)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cells(cells: Vec<(String, Scalar)>) -> Self {
        Self { cells }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Scalar>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> &Scalar {
        const ABSENT: &Scalar = &Scalar::Absent;
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
            .unwrap_or(ABSENT)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn cells(&self) -> &[(String, Scalar)] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<(String, Scalar)> {
        self.cells
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawBatch {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawBatch {
    pub fn new(columns: Vec<String>, rows: Vec<RawRow>) -> Self {
        Self { columns, rows }
    }

    pub fn from_rows(rows: Vec<RawRow>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for column in row.columns() {
                if !columns.iter().any(|c| c == column) {
                    columns.push(column.to_string());
                }
            }
        }
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRow {
    position: usize,
    workout_date: NaiveDate,
    #[serde(with = "cells_as_map")]
    cells: Vec<(String, Scalar)>,
}

impl CleanRow {
    /// `cells` must already carry the date under its column as `Scalar::Date`.
    pub fn new(position: usize, workout_date: NaiveDate, cells: Vec<(String, Scalar)>) -> Self {
        Self {
            position,
            workout_date,
            cells,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn workout_date(&self) -> NaiveDate {
        self.workout_date
    }

    pub fn get(&self, column: &str) -> &Scalar {
        const ABSENT: &Scalar = &Scalar::Absent;
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
            .unwrap_or(ABSENT)
    }

    pub fn cells(&self) -> &[(String, Scalar)] {
        &self.cells
    }
}

impl From<CleanRow> for RawRow {
    fn from(row: CleanRow) -> Self {
        RawRow::from_cells(row.cells)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutRecord {
    row: CleanRow,
    workout_id: Option<String>,
}

impl WorkoutRecord {
    pub fn new(row: CleanRow, workout_id: Option<String>) -> Self {
        Self { row, workout_id }
    }

    pub fn row(&self) -> &CleanRow {
        &self.row
    }

    pub fn workout_id(&self) -> Option<&str> {
        self.workout_id.as_deref()
    }

    pub fn into_row(self) -> CleanRow {
        self.row
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierSet(BTreeSet<String>);

impl IdentifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.0.insert(id.into())
    }
}

impl<S: Into<String>> FromIterator<S> for IdentifierSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> Extend<S> for IdentifierSet {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}

mod cells_as_map {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};

    use super::Scalar;

    pub fn serialize<S: Serializer>(cells: &[(String, Scalar)], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(cells.iter().map(|(k, v)| (k, v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(String, Scalar)>, D::Error> {
        struct CellsVisitor;

        impl<'de> Visitor<'de> for CellsVisitor {
            type Value = Vec<(String, Scalar)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of column name to value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut cells = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, Scalar>()? {
                    cells.push((key, value));
                }
                Ok(cells)
            }
        }

        deserializer.deserialize_map(CellsVisitor)
    }
}
