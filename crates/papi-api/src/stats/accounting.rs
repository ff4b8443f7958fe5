//! Historical usage summaries
//!
//! An external accounting process writes daily per-namespace CSV summaries
//! (`;`-separated) under `$ACCOUNTING_PTH/summaries/`. PAPI only reads
//! them: the VO aggregate, a timeseries window of the last 90 days, and
//! the per-user aggregate rows.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;

use papi_common::{Error, Result};

/// Window of the timeseries served to users
const TIMESERIES_DAYS: i64 = 90;

/// Parsed summaries of one namespace
#[derive(Debug, Clone, Default, Serialize)]
pub struct NamespaceStats {
    /// Namespace-wide aggregate (column -> value)
    #[serde(rename = "full-agg")]
    pub full_agg: BTreeMap<String, Value>,
    /// Daily timeseries, column -> values, last 90 days
    pub timeseries: BTreeMap<String, Vec<Value>>,
    /// Per-user aggregate rows
    #[serde(skip)]
    pub users_agg: Vec<BTreeMap<String, Value>>,
}

/// The stats answer for one user in one VO
#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    /// Namespace-wide aggregate
    #[serde(rename = "full-agg")]
    pub full_agg: BTreeMap<String, Value>,
    /// Namespace timeseries (last 90 days)
    pub timeseries: BTreeMap<String, Vec<Value>>,
    /// The caller's aggregate row, absent while the user has no recorded
    /// usage yet
    #[serde(rename = "users-agg")]
    pub users_agg: Option<BTreeMap<String, Value>>,
}

/// Columns kept as strings; everything else becomes a number
fn parse_cell(column: &str, raw: &str) -> Value {
    if column == "date" || column == "owner" {
        return Value::String(raw.to_string());
    }
    raw.parse::<i64>()
        .map(Value::from)
        .or_else(|_| raw.parse::<f64>().map(Value::from))
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn read_rows(path: &Path) -> Result<Vec<BTreeMap<String, Value>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .from_path(path)
        .map_err(|_| {
            Error::internal(
                "accounting",
                "deployments stats information not available (missing file)",
            )
        })?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| Error::internal("accounting", e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::internal("accounting", e.to_string()))?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(column, raw)| (column.clone(), parse_cell(column, raw)))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Reshape row-major records into column vectors
fn columns_of(rows: &[BTreeMap<String, Value>]) -> BTreeMap<String, Vec<Value>> {
    let mut columns: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in rows {
        for (column, value) in row {
            columns.entry(column.clone()).or_default().push(value.clone());
        }
    }
    columns
}

/// Load the three summary files of a namespace
pub fn load_namespace_stats(accounting_path: &Path, namespace: &str) -> Result<NamespaceStats> {
    let summaries = accounting_path.join("summaries");

    let full_rows = read_rows(&summaries.join(format!("{namespace}-full-agg.csv")))?;
    let timeseries_rows = read_rows(&summaries.join(format!("{namespace}-timeseries.csv")))?;
    let users_agg = read_rows(&summaries.join(format!("{namespace}-users-agg.csv")))?;

    // The namespace aggregate is a single row
    let full_agg = full_rows.into_iter().next().unwrap_or_default();

    // Keep only the last 90 days; with no recent data, keep the last 90 rows
    let threshold = (Utc::now() - ChronoDuration::days(TIMESERIES_DAYS))
        .date_naive()
        .to_string();
    let start = timeseries_rows
        .iter()
        .position(|row| {
            row.get("date")
                .and_then(|v| v.as_str())
                .map(|date| date > threshold.as_str())
                .unwrap_or(false)
        })
        .unwrap_or_else(|| timeseries_rows.len().saturating_sub(TIMESERIES_DAYS as usize));
    let timeseries = columns_of(&timeseries_rows[start..]);

    Ok(NamespaceStats {
        full_agg,
        timeseries,
        users_agg,
    })
}

/// Narrow namespace stats down to one user
pub fn user_stats(stats: &NamespaceStats, subject: &str) -> UserStats {
    let users_agg = stats
        .users_agg
        .iter()
        .find(|row| {
            row.get("owner")
                .and_then(|v| v.as_str())
                .map(|owner| owner == subject)
                .unwrap_or(false)
        })
        .cloned();

    UserStats {
        full_agg: stats.full_agg.clone(),
        timeseries: stats.timeseries.clone(),
        users_agg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_summaries(dir: &Path, namespace: &str) {
        let summaries = dir.join("summaries");
        std::fs::create_dir_all(&summaries).unwrap();

        let mut f =
            std::fs::File::create(summaries.join(format!("{namespace}-full-agg.csv"))).unwrap();
        writeln!(f, "cpu_hours;gpu_hours;deployments").unwrap();
        writeln!(f, "1200;340;56").unwrap();

        let mut f =
            std::fs::File::create(summaries.join(format!("{namespace}-timeseries.csv"))).unwrap();
        writeln!(f, "date;cpu_hours;gpu_hours").unwrap();
        // Old row outside the 90-day window
        writeln!(f, "2019-01-01;5;0").unwrap();
        let today = Utc::now().date_naive();
        writeln!(f, "{today};40;10").unwrap();

        let mut f =
            std::fs::File::create(summaries.join(format!("{namespace}-users-agg.csv"))).unwrap();
        writeln!(f, "owner;cpu_hours;gpu_hours").unwrap();
        writeln!(f, "alice@x;100;25").unwrap();
        writeln!(f, "bob@y;50;0").unwrap();
    }

    #[test]
    fn test_load_and_narrow() {
        let dir = tempfile::tempdir().unwrap();
        write_summaries(dir.path(), "ai4eosc");

        let stats = load_namespace_stats(dir.path(), "ai4eosc").unwrap();
        assert_eq!(stats.full_agg["cpu_hours"], 1200);
        assert_eq!(stats.full_agg["deployments"], 56);

        // The 2019 row is outside the window
        assert_eq!(stats.timeseries["cpu_hours"], vec![40]);

        let alice = user_stats(&stats, "alice@x");
        assert_eq!(alice.users_agg.as_ref().unwrap()["gpu_hours"], 25);

        // A user with no recorded usage gets a null aggregate
        let carol = user_stats(&stats, "carol@z");
        assert!(carol.users_agg.is_none());
    }

    #[test]
    fn test_missing_file_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_namespace_stats(dir.path(), "nowhere").unwrap_err();
        assert!(err.to_string().contains("missing file"));
    }

    #[test]
    fn test_cell_parsing() {
        assert_eq!(parse_cell("cpu_hours", "12"), Value::from(12));
        assert_eq!(parse_cell("ratio", "0.5"), Value::from(0.5));
        assert_eq!(parse_cell("date", "2024-01-01"), Value::from("2024-01-01"));
        assert_eq!(parse_cell("owner", "alice@x"), Value::from("alice@x"));
    }
}
