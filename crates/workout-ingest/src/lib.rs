//! Cleaning, identity extraction and deduplication for workout-history batches.
//!
//! Everything here is a pure transformation over an in-memory batch. Callers fetch the
//! export and the known-identifier snapshot, call [`IngestionOrchestrator::ingest`], and
//! persist whatever comes back in [`IngestOutcome`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use workout_core::{
    CleanRow, IdentifierSet, RawBatch, RawRow, Scalar, WorkoutRecord, ACTIVITY_TYPE, AVG_PACE,
    CALORIES_BURNED, DATE_SUBMITTED, DISTANCE_MI, LINK, MAX_PACE, STEPS, WORKOUT_DATE,
    WORKOUT_TIME_SECONDS,
};

pub const CRATE_NAME: &str = "workout-ingest";

/// Candidate date formats, tried in this order. The first full match wins.
pub const DATE_FORMATS: [&str; 6] = [
    "%b. %d, %Y", // Aug. 1, 2024
    "%d-%b-%y",   // 31-Jul-24
    "%d-%b-%Y",   // 31-Jul-2024
    "%B %d, %Y",  // July 31, 2024
    "%d-%m-%y",   // 20-06-23
    "%Y-%m-%d",   // 2024-08-01
];

pub const REQUIRED_COLUMNS: [&str; 7] = [
    DATE_SUBMITTED,
    WORKOUT_DATE,
    ACTIVITY_TYPE,
    CALORIES_BURNED,
    DISTANCE_MI,
    WORKOUT_TIME_SECONDS,
    LINK,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("missing required columns: {}", join_columns(.0))]
    MissingColumns(BTreeSet<String>),
    #[error("input contains no rows")]
    EmptyInput,
    #[error("processing failed: {0}")]
    Processing(String),
}

impl IngestError {
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::MissingColumns(_) | Self::EmptyInput)
    }
}

fn join_columns(columns: &BTreeSet<String>) -> String {
    columns.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn workout_link_re() -> &'static Regex {
    static WORKOUT_LINK_RE: OnceLock<Regex> = OnceLock::new();
    WORKOUT_LINK_RE
        .get_or_init(|| Regex::new(r"/workout/([0-9]+)").expect("valid workout link regex"))
}

fn digit_run_re() -> &'static Regex {
    static DIGIT_RUN_RE: OnceLock<Regex> = OnceLock::new();
    DIGIT_RUN_RE.get_or_init(|| Regex::new(r"[0-9]+").expect("valid digit run regex"))
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

const MONTH_ABBREVIATIONS: &str = "Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec";
const MONTH_NAMES: &str =
    "January|February|March|April|May|June|July|August|September|October|November|December";

/// Anchored regex for the exact text `format` admits: fixed-width years, single literal
/// spaces, month names of the requested length. `None` for directives it does not know.
fn format_shape(format: &str) -> Option<Regex> {
    let mut pattern = String::from("^");
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
            continue;
        }
        match chars.next()? {
            'Y' => pattern.push_str("[0-9]{4}"),
            'y' => pattern.push_str("[0-9]{2}"),
            'm' => pattern.push_str("(?:1[0-2]|0?[1-9])"),
            'd' => pattern.push_str("(?:3[01]|[12][0-9]|0?[1-9])"),
            'b' | 'h' => pattern.push_str(&format!("(?i:{MONTH_ABBREVIATIONS})")),
            'B' => pattern.push_str(&format!("(?i:{MONTH_NAMES})")),
            '%' => pattern.push('%'),
            _ => return None,
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

#[derive(Debug, Clone)]
struct DatePattern {
    format: String,
    shape: Option<Regex>,
}

impl DatePattern {
    fn parse(&self, raw: &str) -> Option<NaiveDate> {
        if !self.shape.as_ref().map_or(true, |shape| shape.is_match(raw)) {
            return None;
        }
        NaiveDate::parse_from_str(raw, &self.format).ok()
    }
}

#[derive(Debug, Clone)]
pub struct DateNormalizer {
    patterns: Vec<DatePattern>,
}

impl Default for DateNormalizer {
    fn default() -> Self {
        Self::with_formats(DATE_FORMATS)
    }
}

impl DateNormalizer {
    pub fn with_formats<I, S>(formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = formats
            .into_iter()
            .map(|format| {
                let format = format.into();
                DatePattern {
                    shape: format_shape(&format),
                    format,
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn formats(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.format.as_str())
    }

    /// `None` means unparseable. Surrounding whitespace never matches.
    pub fn normalize(&self, raw: &str) -> Option<NaiveDate> {
        self.normalize_with_format(raw).map(|(date, _)| date)
    }

    pub fn normalize_with_format(&self, raw: &str) -> Option<(NaiveDate, &str)> {
        if raw.is_empty() || raw.trim() != raw {
            return None;
        }
        self.patterns
            .iter()
            .find_map(|p| p.parse(raw).map(|date| (date, p.format.as_str())))
    }

    pub fn normalize_scalar(&self, value: &Scalar) -> Option<NaiveDate> {
        match value {
            Scalar::Date(date) => Some(*date),
            Scalar::Text(raw) => self.normalize(raw),
            Scalar::Number(n) => self.normalize(&n.to_string()),
            Scalar::Absent => None,
        }
    }
}

pub fn date_shape(raw: &str) -> String {
    digit_run_re().replace_all(raw, "%").into_owned()
}

// ---------------------------------------------------------------------------
// Row cleaning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub date_column: String,
    pub duration_column: String,
    pub link_column: String,
    pub numeric_columns: Vec<String>,
    pub string_columns: Vec<String>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            date_column: WORKOUT_DATE.to_string(),
            duration_column: WORKOUT_TIME_SECONDS.to_string(),
            link_column: LINK.to_string(),
            numeric_columns: [
                CALORIES_BURNED,
                DISTANCE_MI,
                WORKOUT_TIME_SECONDS,
                AVG_PACE,
                MAX_PACE,
                STEPS,
            ]
            .map(String::from)
            .to_vec(),
            string_columns: [ACTIVITY_TYPE, LINK].map(String::from).to_vec(),
        }
    }
}

impl CleaningConfig {
    pub fn check(&self) -> Result<(), IngestError> {
        for (name, value) in [
            ("date_column", &self.date_column),
            ("duration_column", &self.duration_column),
            ("link_column", &self.link_column),
        ] {
            if value.trim().is_empty() {
                return Err(IngestError::Processing(format!(
                    "cleaning config `{name}` must name a column"
                )));
            }
        }
        Ok(())
    }

    fn is_numeric(&self, column: &str) -> bool {
        self.numeric_columns.iter().any(|c| c == column)
    }

    fn is_string(&self, column: &str) -> bool {
        self.string_columns.iter().any(|c| c == column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidDate {
    pub position: usize,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningReport {
    pub input_rows: usize,
    pub zero_duration_dropped: usize,
    pub invalid_date_dropped: usize,
    pub output_rows: usize,
    pub invalid_dates: Vec<InvalidDate>,
    pub date_shapes: BTreeMap<String, usize>,
}

impl CleaningReport {
    pub fn has_drops(&self) -> bool {
        self.zero_duration_dropped > 0 || self.invalid_date_dropped > 0
    }
}

enum RowVerdict {
    ZeroDuration,
    InvalidDate(InvalidDate),
    Kept {
        date: NaiveDate,
        shape: String,
        cells: Vec<(String, Scalar)>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RowCleaner {
    config: CleaningConfig,
    dates: DateNormalizer,
}

impl RowCleaner {
    pub fn new(config: CleaningConfig) -> Self {
        Self {
            config,
            dates: DateNormalizer::default(),
        }
    }

    pub fn with_date_normalizer(mut self, dates: DateNormalizer) -> Self {
        self.dates = dates;
        self
    }

    pub fn config(&self) -> &CleaningConfig {
        &self.config
    }

    /// Normalize a batch, dropping zero-duration rows and rows without a usable date.
    /// Surviving rows keep their relative order and get dense positions.
    pub fn clean(&self, rows: &[RawRow]) -> (Vec<CleanRow>, CleaningReport) {
        let initial = CleaningReport {
            input_rows: rows.len(),
            ..CleaningReport::default()
        };

        let (kept, mut report) = rows
            .iter()
            .enumerate()
            .map(|(position, row)| self.judge(position, row))
            .fold((Vec::new(), initial), |(mut kept, mut report), verdict| {
                match verdict {
                    RowVerdict::ZeroDuration => report.zero_duration_dropped += 1,
                    RowVerdict::InvalidDate(invalid) => {
                        report.invalid_date_dropped += 1;
                        report.invalid_dates.push(invalid);
                    }
                    RowVerdict::Kept { date, shape, cells } => {
                        *report.date_shapes.entry(shape).or_default() += 1;
                        kept.push(CleanRow::new(kept.len(), date, cells));
                    }
                }
                (kept, report)
            });

        report.output_rows = kept.len();
        (kept, report)
    }

    fn judge(&self, position: usize, row: &RawRow) -> RowVerdict {
        if row.get(&self.config.duration_column).as_f64() == Some(0.0) {
            return RowVerdict::ZeroDuration;
        }

        let raw_date = row.get(&self.config.date_column);
        let Some(date) = self.dates.normalize_scalar(raw_date) else {
            return RowVerdict::InvalidDate(InvalidDate {
                position,
                value: raw_date.to_string(),
            });
        };

        let cells = row
            .cells()
            .iter()
            .map(|(column, value)| {
                let value = if *column == self.config.date_column {
                    Scalar::Date(date)
                } else if self.config.is_numeric(column) {
                    coerce_numeric(value)
                } else if self.config.is_string(column) {
                    blank_to_absent(value)
                } else {
                    value.clone()
                };
                (column.clone(), sweep_non_finite(value))
            })
            .collect();

        RowVerdict::Kept {
            date,
            shape: date_shape(&raw_date.to_string()),
            cells,
        }
    }
}

fn coerce_numeric(value: &Scalar) -> Scalar {
    match value {
        Scalar::Number(n) if n.is_finite() => Scalar::Number(*n),
        Scalar::Text(s) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Scalar::Number(n),
            _ => Scalar::Absent,
        },
        _ => Scalar::Absent,
    }
}

fn blank_to_absent(value: &Scalar) -> Scalar {
    match value {
        Scalar::Text(s) if s.is_empty() => Scalar::Absent,
        other => other.clone(),
    }
}

fn sweep_non_finite(value: Scalar) -> Scalar {
    if value.is_non_finite() {
        Scalar::Absent
    } else {
        value
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

pub fn extract_workout_id(link: &Scalar) -> Option<String> {
    link.as_text().and_then(extract_workout_id_str)
}

pub fn extract_workout_id_str(link: &str) -> Option<String> {
    workout_link_re()
        .captures(link)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn is_workout_link(link: &Scalar) -> bool {
    link.as_text()
        .map(|s| workout_link_re().is_match(s))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkWarning {
    pub position: usize,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub rows: usize,
    pub link_warnings: Vec<LinkWarning>,
}

#[derive(Debug, Clone)]
pub struct SchemaValidator {
    required: BTreeSet<String>,
    link_column: String,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::for_config(&CleaningConfig::default())
    }
}

impl SchemaValidator {
    pub fn for_config(config: &CleaningConfig) -> Self {
        let mut required: BTreeSet<String> = REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect();
        required.insert(config.date_column.clone());
        required.insert(config.duration_column.clone());
        required.insert(config.link_column.clone());
        Self {
            required,
            link_column: config.link_column.clone(),
        }
    }

    pub fn required_columns(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn validate(&self, batch: &RawBatch) -> Result<ValidationOutcome, IngestError> {
        let missing: BTreeSet<String> = self
            .required
            .iter()
            .filter(|column| !batch.has_column(column))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::MissingColumns(missing));
        }
        if batch.is_empty() {
            return Err(IngestError::EmptyInput);
        }

        let link_warnings = batch
            .rows
            .iter()
            .enumerate()
            .filter_map(|(position, row)| {
                let link = row.get(&self.link_column);
                (!is_workout_link(link)).then(|| LinkWarning {
                    position,
                    link: link.as_text().map(str::to_string),
                })
            })
            .collect();

        Ok(ValidationOutcome {
            rows: batch.len(),
            link_warnings,
        })
    }
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupPartition {
    pub new: Vec<WorkoutRecord>,
    pub duplicate_count: usize,
    /// Identifiers that appear more than once among `new`. Both rows are kept.
    pub repeated_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DedupEngine;

impl DedupEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn is_new(record: &WorkoutRecord, known: &IdentifierSet) -> bool {
        record.workout_id().map_or(true, |id| !known.contains(id))
    }

    pub fn partition(&self, records: Vec<WorkoutRecord>, known: &IdentifierSet) -> DedupPartition {
        let (new, duplicates): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| Self::is_new(record, known));

        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        let mut repeated_ids = Vec::new();
        for id in new.iter().filter_map(WorkoutRecord::workout_id) {
            let count = seen.entry(id).or_default();
            *count += 1;
            if *count == 2 {
                repeated_ids.push(id.to_string());
            }
        }

        DedupPartition {
            duplicate_count: duplicates.len(),
            new,
            repeated_ids,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub new_records: Vec<WorkoutRecord>,
    pub duplicate_count: usize,
    pub cleaning_report: CleaningReport,
    pub link_warnings: Vec<LinkWarning>,
    pub repeated_ids: Vec<String>,
}

impl IngestOutcome {
    /// Distinct identifiers of the new records in first-seen order. Null ids are skipped.
    pub fn new_identifiers(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.new_records
            .iter()
            .filter_map(WorkoutRecord::workout_id)
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect()
    }

    pub fn has_new_records(&self) -> bool {
        !self.new_records.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOrchestrator {
    validator: SchemaValidator,
    cleaner: RowCleaner,
    dedup: DedupEngine,
}

impl IngestionOrchestrator {
    pub fn new(config: CleaningConfig) -> Result<Self, IngestError> {
        config.check()?;
        Ok(Self {
            validator: SchemaValidator::for_config(&config),
            cleaner: RowCleaner::new(config),
            dedup: DedupEngine::new(),
        })
    }

    pub fn config(&self) -> &CleaningConfig {
        self.cleaner.config()
    }

    pub fn ingest(&self, batch: &RawBatch, known: &IdentifierSet) -> Result<IngestOutcome, IngestError> {
        let validation = self.validator.validate(batch)?;
        let (rows, cleaning_report) = self.cleaner.clean(&batch.rows);

        let link_column = &self.config().link_column;
        let records = rows
            .into_iter()
            .map(|row| {
                let workout_id = extract_workout_id(row.get(link_column));
                WorkoutRecord::new(row, workout_id)
            })
            .collect();

        let partition = self.dedup.partition(records, known);

        Ok(IngestOutcome {
            new_records: partition.new,
            duplicate_count: partition.duplicate_count,
            cleaning_report,
            link_warnings: validation.link_warnings,
            repeated_ids: partition.repeated_ids,
        })
    }
}

impl Default for IngestionOrchestrator {
    fn default() -> Self {
        Self {
            validator: SchemaValidator::default(),
            cleaner: RowCleaner::default(),
            dedup: DedupEngine::new(),
        }
    }
}

pub fn ingest(batch: &RawBatch, known: &IdentifierSet) -> Result<IngestOutcome, IngestError> {
    IngestionOrchestrator::default().ingest(batch, known)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn workout_row(date: &str, seconds: f64, link: Option<&str>) -> RawRow {
        RawRow::new()
            .with(DATE_SUBMITTED, "2024-08-02")
            .with(WORKOUT_DATE, date)
            .with(ACTIVITY_TYPE, "Run")
            .with(CALORIES_BURNED, 400.0)
            .with(DISTANCE_MI, 3.1)
            .with(WORKOUT_TIME_SECONDS, seconds)
            .with(AVG_PACE, 9.5)
            .with(MAX_PACE, 7.25)
            .with(STEPS, 5200.0)
            .with(LINK, link)
    }

    fn batch(rows: Vec<RawRow>) -> RawBatch {
        RawBatch::new(
            workout_core::EXPORT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
        )
    }

    #[test]
    fn each_supported_format_parses() {
        let dates = DateNormalizer::default();
        assert_eq!(dates.normalize("Aug. 1, 2024"), Some(ymd(2024, 8, 1)));
        assert_eq!(dates.normalize("31-Jul-24"), Some(ymd(2024, 7, 31)));
        assert_eq!(dates.normalize("31-Jul-2024"), Some(ymd(2024, 7, 31)));
        assert_eq!(dates.normalize("July 31, 2024"), Some(ymd(2024, 7, 31)));
        assert_eq!(dates.normalize("20-06-23"), Some(ymd(2023, 6, 20)));
        assert_eq!(dates.normalize("2024-08-01"), Some(ymd(2024, 8, 1)));
    }

    #[test]
    fn ambiguous_numeric_dates_take_the_first_full_match() {
        let dates = DateNormalizer::default();
        let (date, fmt) = dates.normalize_with_format("01-02-03").unwrap();
        assert_eq!(fmt, "%d-%m-%y");
        assert_eq!(date, ymd(2003, 2, 1));
    }

    #[test]
    fn partial_or_unknown_dates_are_unparseable() {
        let dates = DateNormalizer::default();
        for raw in ["13/45/2024", "", "nan", "2024-08-01 07:00", " 2024-08-01", "Sept. 1, 2024", "32-Jul-24"] {
            assert_eq!(dates.normalize(raw), None, "{raw:?} should not parse");
        }
        assert_eq!(dates.normalize_scalar(&Scalar::Absent), None);
        assert_eq!(dates.normalize_scalar(&Scalar::Date(ymd(2024, 1, 2))), Some(ymd(2024, 1, 2)));
    }

    #[test]
    fn near_miss_dates_are_unparseable() {
        let dates = DateNormalizer::default();
        for raw in [
            "Jul 31, 2024",
            "Aug.1,2024",
            "Aug.  1,   2024",
            "Aug. 1, 24",
            "1-2-3",
            "24-8-1",
            "+2024-08-01",
            "July. 31, 2024",
            "31-July-2024",
            "2024-8-1 ",
            "31-Jul-024",
        ] {
            assert_eq!(dates.normalize_with_format(raw), None, "{raw:?} should not parse");
        }
    }

    #[test]
    fn single_digit_days_and_months_still_parse() {
        let dates = DateNormalizer::default();
        assert_eq!(dates.normalize("Aug. 1, 2024"), Some(ymd(2024, 8, 1)));
        assert_eq!(dates.normalize("May 1, 2024"), Some(ymd(2024, 5, 1)));
        assert_eq!(dates.normalize("1-2-03"), Some(ymd(2003, 2, 1)));
        assert_eq!(dates.normalize("2024-8-1"), Some(ymd(2024, 8, 1)));
    }

    #[test]
    fn format_shapes_are_anchored_and_fixed_width() {
        let shape = format_shape("%d-%b-%y").unwrap();
        assert!(shape.is_match("31-Jul-24"));
        assert!(shape.is_match("31-jul-24"));
        assert!(!shape.is_match("31-Jul-2024"));
        assert!(!shape.is_match("x31-Jul-24"));
        assert!(format_shape("%Y-%j").is_none());
        assert_eq!(DateNormalizer::default().formats().count(), DATE_FORMATS.len());
    }

    #[test]
    fn date_shape_masks_digit_runs() {
        assert_eq!(date_shape("Aug. 1, 2024"), "Aug. %, %");
        assert_eq!(date_shape("2024-08-01"), "%-%-%");
    }

    #[test]
    fn zero_duration_rows_are_dropped_and_counted() {
        let rows = vec![
            workout_row("2024-08-01", 0.0, Some("/workout/1")),
            workout_row("2024-08-02", 1800.0, Some("/workout/2")),
            workout_row("2024-08-03", -0.0, Some("/workout/3")),
            workout_row("2024-08-04", 60.0, Some("/workout/4")).with(WORKOUT_TIME_SECONDS, "0"),
        ];
        let (clean, report) = RowCleaner::default().clean(&rows);
        assert_eq!(report.zero_duration_dropped, 3);
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].workout_date(), ymd(2024, 8, 2));
    }

    #[test]
    fn absent_duration_survives() {
        let rows = vec![workout_row("2024-08-01", 0.0, None).with(WORKOUT_TIME_SECONDS, Scalar::Absent)];
        let (clean, report) = RowCleaner::default().clean(&rows);
        assert_eq!(report.zero_duration_dropped, 0);
        assert_eq!(clean.len(), 1);
    }

    #[test]
    fn invalid_and_absent_dates_are_excluded_and_enumerated() {
        let rows = vec![
            workout_row("13/45/2024", 60.0, None),
            workout_row("Aug. 1, 2024", 60.0, None),
            workout_row("x", 60.0, None).with(WORKOUT_DATE, Scalar::Absent),
        ];
        let (clean, report) = RowCleaner::default().clean(&rows);
        assert_eq!(clean.len(), 1);
        assert_eq!(report.invalid_date_dropped, 2);
        assert_eq!(
            report.invalid_dates,
            vec![
                InvalidDate { position: 0, value: "13/45/2024".into() },
                InvalidDate { position: 2, value: "None".into() },
            ]
        );
        assert_eq!(report.date_shapes.get("Aug. %, %"), Some(&1));
    }

    #[test]
    fn column_normalization_and_non_finite_sweep() {
        let rows = vec![workout_row("2024-08-01", 1800.0, Some(""))
            .with(CALORIES_BURNED, f64::NAN)
            .with(DISTANCE_MI, " 2.5 ")
            .with(STEPS, "many")
            .with(MAX_PACE, f64::INFINITY)
            .with(ACTIVITY_TYPE, "")
            .with("Notes", f64::NEG_INFINITY)];
        let (clean, _) = RowCleaner::default().clean(&rows);
        let row = &clean[0];
        assert!(row.get(CALORIES_BURNED).is_absent());
        assert_eq!(row.get(DISTANCE_MI), &Scalar::Number(2.5));
        assert!(row.get(STEPS).is_absent());
        assert!(row.get(MAX_PACE).is_absent());
        assert!(row.get(ACTIVITY_TYPE).is_absent());
        assert!(row.get(LINK).is_absent());
        assert!(row.get("Notes").is_absent());
        assert_eq!(row.get(WORKOUT_DATE), &Scalar::Date(ymd(2024, 8, 1)));
        assert_eq!(row.get(DATE_SUBMITTED).as_text(), Some("2024-08-02"));
    }

    #[test]
    fn rows_with_only_required_values_survive() {
        let rows = vec![RawRow::new()
            .with(WORKOUT_DATE, "2024-08-01")
            .with(WORKOUT_TIME_SECONDS, 30.0)
            .with(CALORIES_BURNED, Scalar::Absent)
            .with(ACTIVITY_TYPE, "")
            .with(LINK, Scalar::Absent)];
        let (clean, report) = RowCleaner::default().clean(&rows);
        assert_eq!(clean.len(), 1);
        assert!(!report.has_drops());
    }

    #[test]
    fn surviving_rows_get_dense_positions_in_input_order() {
        let rows = vec![
            workout_row("2024-08-01", 0.0, None),
            workout_row("2024-08-02", 1.0, Some("/workout/2")),
            workout_row("bad", 1.0, None),
            workout_row("2024-08-04", 1.0, Some("/workout/4")),
        ];
        let (clean, report) = RowCleaner::default().clean(&rows);
        let positions: Vec<_> = clean.iter().map(CleanRow::position).collect();
        let dates: Vec<_> = clean.iter().map(CleanRow::workout_date).collect();
        assert_eq!(positions, vec![0, 1]);
        assert_eq!(dates, vec![ymd(2024, 8, 2), ymd(2024, 8, 4)]);
        assert_eq!(report.input_rows, 4);
        assert_eq!(report.output_rows, 2);
    }

    #[test]
    fn workout_id_extraction() {
        assert_eq!(
            extract_workout_id(&Scalar::text("http://www.mapmyfitness.com/workout/7434147697")),
            Some("7434147697".to_string())
        );
        assert_eq!(extract_workout_id_str("/workout/12/workout/34"), Some("12".to_string()));
        assert_eq!(extract_workout_id_str("https://example.test/workouts/12"), None);
        assert_eq!(extract_workout_id_str("/workout/abc"), None);
        assert_eq!(extract_workout_id(&Scalar::Absent), None);
        assert_eq!(extract_workout_id(&Scalar::Number(111.0)), None);
    }

    #[test]
    fn validation_reports_missing_columns_before_empty_input() {
        let empty_without_link = RawBatch::new(vec![WORKOUT_DATE.to_string()], vec![]);
        match SchemaValidator::default().validate(&empty_without_link) {
            Err(IngestError::MissingColumns(missing)) => {
                assert!(missing.contains(LINK));
                assert!(!missing.contains(WORKOUT_DATE));
                assert_eq!(missing.len(), 6);
            }
            other => panic!("expected missing columns, got {other:?}"),
        }

        assert_eq!(SchemaValidator::default().validate(&batch(vec![])), Err(IngestError::EmptyInput));
    }

    #[test]
    fn malformed_links_only_warn() {
        let outcome = SchemaValidator::default()
            .validate(&batch(vec![
                workout_row("2024-08-01", 1.0, Some("/workout/1")),
                workout_row("2024-08-01", 1.0, Some("https://example.test/route/9")),
                workout_row("2024-08-01", 1.0, None),
            ]))
            .unwrap();
        assert_eq!(outcome.rows, 3);
        assert_eq!(
            outcome.link_warnings,
            vec![
                LinkWarning { position: 1, link: Some("https://example.test/route/9".into()) },
                LinkWarning { position: 2, link: None },
            ]
        );
    }

    #[test]
    fn partition_keeps_unknown_and_null_ids_in_order() {
        let (clean, _) = RowCleaner::default().clean(&[
            workout_row("2024-08-01", 1.0, Some("/workout/1")),
            workout_row("2024-08-02", 1.0, None),
            workout_row("2024-08-03", 1.0, Some("/workout/3")),
            workout_row("2024-08-04", 1.0, Some("/workout/3")),
        ]);
        let records: Vec<_> = clean
            .into_iter()
            .map(|row| {
                let id = extract_workout_id(row.get(LINK));
                WorkoutRecord::new(row, id)
            })
            .collect();
        let known: IdentifierSet = ["1"].into_iter().collect();

        let partition = DedupEngine::new().partition(records, &known);
        let ids: Vec<_> = partition.new.iter().map(WorkoutRecord::workout_id).collect();
        assert_eq!(ids, vec![None, Some("3"), Some("3")]);
        assert_eq!(partition.duplicate_count, 1);
        assert_eq!(partition.repeated_ids, vec!["3".to_string()]);
        assert_eq!(known.len(), 1);
    }

    #[test]
    fn scenario_new_workout_is_emitted_with_its_id() {
        let outcome = ingest(
            &batch(vec![workout_row("Aug. 1, 2024", 1800.0, Some("https://www.mapmyfitness.com/workout/111"))]),
            &IdentifierSet::new(),
        )
        .unwrap();
        assert_eq!(outcome.new_records.len(), 1);
        assert_eq!(outcome.new_records[0].workout_id(), Some("111"));
        assert_eq!(outcome.new_records[0].row().workout_date(), ymd(2024, 8, 1));
        assert_eq!(outcome.new_identifiers(), vec!["111".to_string()]);
    }

    #[test]
    fn scenario_zero_duration_is_excluded() {
        let outcome = ingest(
            &batch(vec![workout_row("Aug. 1, 2024", 0.0, Some("/workout/111"))]),
            &IdentifierSet::new(),
        )
        .unwrap();
        assert!(outcome.new_records.is_empty());
        assert_eq!(outcome.cleaning_report.zero_duration_dropped, 1);
    }

    #[test]
    fn scenario_unparseable_date_is_excluded() {
        let outcome = ingest(
            &batch(vec![workout_row("13/45/2024", 1800.0, Some("/workout/111"))]),
            &IdentifierSet::new(),
        )
        .unwrap();
        assert!(outcome.new_records.is_empty());
        assert_eq!(outcome.cleaning_report.invalid_date_dropped, 1);
    }

    #[test]
    fn scenario_missing_link_is_still_new() {
        let outcome = ingest(
            &batch(vec![workout_row("2024-08-01", 1800.0, None)]),
            &["111"].into_iter().collect(),
        )
        .unwrap();
        assert_eq!(outcome.new_records.len(), 1);
        assert_eq!(outcome.new_records[0].workout_id(), None);
        assert_eq!(outcome.link_warnings.len(), 1);
        assert!(outcome.new_identifiers().is_empty());
    }

    #[test]
    fn scenario_known_workout_is_a_duplicate() {
        let outcome = ingest(
            &batch(vec![workout_row("Aug. 1, 2024", 1800.0, Some("/workout/111"))]),
            &["111"].into_iter().collect(),
        )
        .unwrap();
        assert!(outcome.new_records.is_empty());
        assert_eq!(outcome.duplicate_count, 1);
    }

    #[test]
    fn scenario_missing_link_column_is_structural() {
        let rows = vec![RawRow::new()
            .with(DATE_SUBMITTED, "2024-08-02")
            .with(WORKOUT_DATE, "2024-08-01")
            .with(ACTIVITY_TYPE, "Run")
            .with(CALORIES_BURNED, 1.0)
            .with(DISTANCE_MI, 1.0)
            .with(WORKOUT_TIME_SECONDS, 1.0)];
        let err = ingest(&RawBatch::from_rows(rows), &IdentifierSet::new()).unwrap_err();
        assert_eq!(err, IngestError::MissingColumns([LINK.to_string()].into_iter().collect()));
        assert!(err.is_structural());
        assert_eq!(err.to_string(), "missing required columns: Link");
    }

    #[test]
    fn blank_config_column_is_a_processing_error() {
        let config = CleaningConfig {
            duration_column: " ".into(),
            ..CleaningConfig::default()
        };
        let err = IngestionOrchestrator::new(config).unwrap_err();
        assert!(matches!(err, IngestError::Processing(_)));
        assert!(!err.is_structural());
    }

    #[test]
    fn cleaning_config_loads_partial_yaml_over_defaults() {
        let config: CleaningConfig = serde_yaml::from_str("string_columns: [\"Activity Type\"]\n").unwrap();
        assert_eq!(config.string_columns, vec![ACTIVITY_TYPE.to_string()]);
        assert_eq!(config.date_column, WORKOUT_DATE);
        assert_eq!(config.numeric_columns.len(), 6);
    }
}
