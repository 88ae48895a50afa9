//! Price history loading and date-window alignment.

use crate::error::{OptimizerError, Result};
use crate::types::{Bar, PriceHistorySet};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Raw CSV row. Only the date and close columns are required; missing
/// open/high/low fall back to the close.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(
        alias = "Date",
        alias = "DATE",
        alias = "Timestamp",
        alias = "timestamp",
        alias = "Time",
        alias = "time",
        alias = "datetime",
        alias = "Datetime"
    )]
    date: String,
    #[serde(alias = "Open", alias = "o", default)]
    open: Option<f64>,
    #[serde(alias = "High", alias = "h", default)]
    high: Option<f64>,
    #[serde(alias = "Low", alias = "l", default)]
    low: Option<f64>,
    #[serde(alias = "Close", alias = "c", alias = "Adj Close", alias = "price")]
    close: f64,
    #[serde(alias = "Volume", alias = "v", alias = "vol", default)]
    volume: f64,
}

/// CSV loading options.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Date format string for parsing (e.g., "%Y-%m-%d").
    pub date_format: Option<String>,
    /// CSV delimiter character.
    pub delimiter: u8,
    /// Skip invalid rows instead of failing.
    pub skip_invalid: bool,
    /// In `load_dir`, skip files that fail to load instead of failing.
    pub skip_failed_files: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            delimiter: b',',
            skip_invalid: true,
            skip_failed_files: false,
        }
    }
}

/// Parse a date string, trying an explicit format first and then common ones.
pub fn parse_datetime(s: &str, format: Option<&str>) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN)));
        }
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y/%m/%d %H:%M:%S",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%m/%d/%Y", "%b %d, %Y"];
    for fmt in &date_formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN)));
        }
    }

    if let Ok(ts) = s.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp(ts, 0) {
            return Ok(dt);
        }
    }

    Err(OptimizerError::Data(format!("Could not parse date: '{}'", s)))
}

/// Load a price history from a CSV file.
pub fn load_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    info!("Loading prices from: {}", path.display());

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(config.delimiter)
        .flexible(true)
        .from_path(path)?;

    let mut bars = Vec::new();
    let mut skipped = 0;

    for (row_num, result) in reader.deserialize().enumerate() {
        let row: CsvRow = match result {
            Ok(r) => r,
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {}: {}", row_num + 1, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let timestamp = match parse_datetime(&row.date, config.date_format.as_deref()) {
            Ok(ts) => ts,
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {} due to date parse error: {}", row_num + 1, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let bar = Bar::new(
            timestamp,
            row.open.unwrap_or(row.close),
            row.high.unwrap_or(row.close),
            row.low.unwrap_or(row.close),
            row.close,
            row.volume,
        );

        if !bar.validate() {
            if config.skip_invalid {
                debug!("Skipping row {} due to invalid bar: {:?}", row_num + 1, bar);
                skipped += 1;
                continue;
            }
            return Err(OptimizerError::Data(format!(
                "Invalid bar data at row {}: {:?}",
                row_num + 1,
                bar
            )));
        }

        bars.push(bar);
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows in {}", skipped, path.display());
    }

    bars.sort_by_key(|b| b.timestamp);
    let original_len = bars.len();
    bars.dedup_by_key(|b| b.timestamp);
    if bars.len() < original_len {
        warn!("Removed {} duplicate timestamps", original_len - bars.len());
    }

    if bars.is_empty() {
        return Err(OptimizerError::NoData);
    }

    debug!(
        "Loaded {} bars from {} to {}",
        bars.len(),
        bars[0].timestamp,
        bars[bars.len() - 1].timestamp
    );

    Ok(bars)
}

/// Load every file in `dir` matching `pattern` into one price-history set.
///
/// The ticker is the file stem. A file that fails to load fails the whole
/// set, since a missing ticker changes the asset universe. With
/// `skip_failed_files` it is skipped with a warning instead, and an error is
/// returned only when nothing could be loaded.
pub fn load_dir(
    dir: impl AsRef<Path>,
    pattern: &str,
    config: &DataConfig,
) -> Result<PriceHistorySet> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(OptimizerError::Data(format!(
            "Not a directory: {}",
            dir.display()
        )));
    }

    let glob_pattern = dir.join(pattern);
    let glob_pattern_str = glob_pattern.to_string_lossy();
    info!("Loading files matching: {}", glob_pattern_str);

    let paths = glob::glob(&glob_pattern_str).map_err(|e| {
        OptimizerError::Data(format!("Invalid glob pattern '{}': {}", pattern, e))
    })?;

    let mut set = PriceHistorySet::new();
    let mut errors = 0;

    for entry in paths {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                warn!("Glob error: {}", e);
                errors += 1;
                continue;
            }
        };

        let symbol = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                OptimizerError::Data(format!(
                    "Could not extract symbol from path: {}",
                    path.display()
                ))
            })?;

        match load_csv(&path, config) {
            Ok(bars) => set.insert(symbol, bars),
            Err(e) if !config.skip_failed_files => {
                return Err(OptimizerError::Data(format!(
                    "Failed to load {}: {}",
                    path.display(),
                    e
                )));
            }
            Err(e) => {
                warn!("Failed to load {}: {}", path.display(), e);
                errors += 1;
            }
        }
    }

    if set.is_empty() {
        return Err(OptimizerError::Data(format!(
            "No files loaded from {} ({} errors)",
            dir.display(),
            errors
        )));
    }

    info!(
        "Loaded {} symbols from {} ({} errors)",
        set.len(),
        dir.display(),
        errors
    );
    Ok(set)
}

/// Common overlapping window across every asset of every set.
pub fn common_window(sets: &[PriceHistorySet]) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    if sets.is_empty() {
        return Err(OptimizerError::InputShape(
            "no price-history sets supplied".to_string(),
        ));
    }

    let mut start: Option<DateTime<Utc>> = None;
    let mut end: Option<DateTime<Utc>> = None;

    for (i, set) in sets.iter().enumerate() {
        if set.is_empty() {
            return Err(OptimizerError::InputShape(format!(
                "price-history set {} has no assets",
                i
            )));
        }
        let (s, e) = set.overlap().ok_or_else(|| {
            OptimizerError::InputShape(format!("price-history set {} has an empty history", i))
        })?;
        start = Some(start.map_or(s, |cur| cur.max(s)));
        end = Some(end.map_or(e, |cur| cur.min(e)));
    }

    match (start, end) {
        (Some(s), Some(e)) if s <= e => Ok((s, e)),
        (Some(s), Some(e)) => Err(OptimizerError::InputShape(format!(
            "price histories do not overlap (latest start {} is after earliest end {})",
            s, e
        ))),
        _ => Err(OptimizerError::NoData),
    }
}

/// Truncate every history of every set to the common window.
pub fn truncate_to_common_window(sets: &[PriceHistorySet]) -> Result<Vec<PriceHistorySet>> {
    let (start, end) = common_window(sets)?;
    debug!("Truncating {} price sets to {} .. {}", sets.len(), start, end);
    Ok(sets.iter().map(|set| set.truncated(start, end)).collect())
}
