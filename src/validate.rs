use std::fmt::Write as _;

use camino::Utf8Path;
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ValidationSettings;
use crate::domain::{DatasetId, Finding, GateOutcome, Severity, lat_in_range, lon_in_range};
use crate::dwca;
use crate::error::PipelineError;
use crate::occurrence::{CONTRACT_COLUMNS, parse_event_date};
use crate::store::{Store, write_bytes_atomic};

/// Persisted gate artifact. The spatial join refuses to run unless this
/// exists and records a pass for the dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationGate {
    pub dataset: String,
    pub outcome: GateOutcome,
    pub total_rows: u64,
    pub invalid_rows: u64,
    pub invalid_ratio: f64,
    pub max_invalid_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub dataset: String,
    pub outcome: GateOutcome,
    pub total_rows: u64,
    pub invalid_rows: u64,
    pub invalid_ratio: f64,
    pub findings: Vec<Finding>,
}

/// Run the spatial validation stage over the filtered table.
///
/// Structural defects (missing contract columns) are fatal. Row-level
/// defects are warnings; the stage counts them and the gate fails when the
/// invalid ratio exceeds the configured threshold. A failed gate is not an
/// error here; it becomes one when the join consults it.
pub fn run(
    store: &Store,
    settings: &ValidationSettings,
    dataset: &DatasetId,
    input: &Utf8Path,
) -> Result<ValidationSummary, PipelineError> {
    info!(%dataset, %input, "spatial validation started");

    check_structure(dataset, input)?;

    let mut findings: Vec<Finding> = Vec::new();
    let mut total_rows = 0u64;
    let mut invalid_rows = 0u64;
    let current_year = chrono::Utc::now().year();

    dwca::for_each_row(input, |row| {
        total_rows += 1;
        let line = total_rows;
        let mut invalid = false;

        match row.decimal_latitude {
            Some(lat) if lat_in_range(lat) => {}
            Some(lat) => {
                invalid = true;
                findings.push(Finding::row_level(
                    line,
                    format!("decimalLatitude {lat} outside [-90, 90]"),
                ));
            }
            None => {
                invalid = true;
                findings.push(Finding::row_level(line, "decimalLatitude missing or unparsable"));
            }
        }
        match row.decimal_longitude {
            Some(lon) if lon_in_range(lon) => {}
            Some(lon) => {
                invalid = true;
                findings.push(Finding::row_level(
                    line,
                    format!("decimalLongitude {lon} outside [-180, 180]"),
                ));
            }
            None => {
                invalid = true;
                findings.push(Finding::row_level(line, "decimalLongitude missing or unparsable"));
            }
        }

        // Temporal plausibility findings do not invalidate the row; the
        // coordinates are what the join depends on.
        if let Some(year) = row.year {
            if !(1600..=current_year).contains(&year) {
                findings.push(Finding::row_level(line, format!("implausible year {year}")));
            }
        }
        if let Some(raw) = row.event_date.as_deref() {
            if parse_event_date(raw).is_none() {
                findings.push(Finding::row_level(
                    line,
                    format!("eventDate '{raw}' is not a calendar date"),
                ));
            }
        }

        if invalid {
            invalid_rows += 1;
        }
        Ok(())
    })?;

    let invalid_ratio = if total_rows > 0 {
        invalid_rows as f64 / total_rows as f64
    } else {
        0.0
    };
    let outcome = if invalid_ratio <= settings.max_invalid_ratio {
        GateOutcome::Pass
    } else {
        GateOutcome::Fail
    };

    let gate = ValidationGate {
        dataset: dataset.to_string(),
        outcome,
        total_rows,
        invalid_rows,
        invalid_ratio,
        max_invalid_ratio: settings.max_invalid_ratio,
    };
    write_gate(store, dataset, &gate)?;

    let report_path = store.report_path(dataset, "validation");
    store.write_report(&report_path, &render_report(input, &gate, &findings))?;

    match outcome {
        GateOutcome::Pass => info!(%dataset, total_rows, invalid_rows, "validation gate passed"),
        GateOutcome::Fail => warn!(%dataset, total_rows, invalid_rows, "validation gate failed"),
    }

    Ok(ValidationSummary {
        dataset: dataset.to_string(),
        outcome,
        total_rows,
        invalid_rows,
        invalid_ratio,
        findings,
    })
}

/// Every contract column must be present in the header; a violation means
/// an upstream stage produced a malformed table and the run stops.
fn check_structure(dataset: &DatasetId, input: &Utf8Path) -> Result<(), PipelineError> {
    let headers = dwca::read_headers(input)?;
    let missing: Vec<&str> = CONTRACT_COLUMNS
        .iter()
        .copied()
        .filter(|col| !headers.iter().any(|h| h == col))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingColumns {
            dataset: dataset.to_string(),
            columns: missing.join(", "),
        });
    }
    Ok(())
}

fn write_gate(
    store: &Store,
    dataset: &DatasetId,
    gate: &ValidationGate,
) -> Result<(), PipelineError> {
    let path = store.validation_gate(dataset);
    let json = serde_json::to_vec_pretty(gate)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    write_bytes_atomic(&path, &json)
}

/// Gate artifact for a dataset, as the join stage reads it.
pub fn read_gate(store: &Store, dataset: &DatasetId) -> Result<ValidationGate, PipelineError> {
    let path = store.validation_gate(dataset);
    let content = std::fs::read_to_string(path.as_std_path())
        .map_err(|_| PipelineError::ValidationGateMissing(dataset.to_string()))?;
    serde_json::from_str(&content)
        .map_err(|_| PipelineError::ValidationGateMissing(dataset.to_string()))
}

fn render_report(input: &Utf8Path, gate: &ValidationGate, findings: &[Finding]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "SPATIAL VALIDATION REPORT");
    let _ = writeln!(out);
    let _ = writeln!(out, "Dataset: {}", gate.dataset);
    let _ = writeln!(out, "Input:   {input}");
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out);
    let _ = writeln!(out, "Total rows checked: {}", gate.total_rows);
    let _ = writeln!(out, "Rows with invalid coordinates: {}", gate.invalid_rows);
    let _ = writeln!(
        out,
        "Invalid ratio: {:.4} (threshold {:.4})",
        gate.invalid_ratio, gate.max_invalid_ratio
    );
    let _ = writeln!(out, "Gate outcome: {}", gate.outcome);
    let _ = writeln!(out);

    let warnings = findings
        .iter()
        .filter(|f| f.severity == Severity::Warning)
        .count();
    let _ = writeln!(out, "Findings ({warnings} warnings):");
    // Reports stay readable for large inputs; the full count is above.
    for finding in findings.iter().take(200) {
        match finding.row {
            Some(row) => {
                let _ = writeln!(out, "  row {row}: {}", finding.message);
            }
            None => {
                let _ = writeln!(out, "  file: {}", finding.message);
            }
        }
    }
    if findings.len() > 200 {
        let _ = writeln!(out, "  ... {} more findings omitted", findings.len() - 200);
    }
    out
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("data")).unwrap();
        (dir, Store::new(root))
    }

    const HEADER: &str = "taxonKey,scientificName,decimalLatitude,decimalLongitude,countryCode,basisOfRecord,coordinateUncertaintyInMeters,year,eventDate";

    fn write_csv(dir: &tempfile::TempDir, rows: &[&str]) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("filtered.csv")).unwrap();
        let mut content = String::from(HEADER);
        content.push('\n');
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        std::fs::write(path.as_std_path(), content).unwrap();
        path
    }

    #[test]
    fn out_of_range_latitude_is_flagged_not_fatal() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_csv(
            &dir,
            &[
                "1,Bubo bubo,95.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-06-01",
                "2,Lynx lynx,45.0,10.0,ES,HUMAN_OBSERVATION,10,2020,2020-06-02",
            ],
        );

        let summary = run(&store, &ValidationSettings::default(), &dataset, &input).unwrap();
        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.invalid_rows, 1);
        assert!(summary
            .findings
            .iter()
            .any(|f| f.row == Some(1) && f.message.contains("decimalLatitude")));
    }

    #[test]
    fn missing_contract_column_is_fatal() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("filtered.csv")).unwrap();
        std::fs::write(
            path.as_std_path(),
            "taxonKey,scientificName,decimalLatitude\n1,Bubo bubo,45.0\n",
        )
        .unwrap();

        let err = run(&store, &ValidationSettings::default(), &dataset, &path).unwrap_err();
        assert_matches!(err, PipelineError::MissingColumns { .. });
    }

    #[test]
    fn gate_fails_above_invalid_ratio() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_csv(
            &dir,
            &[
                "1,Bubo bubo,95.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-06-01",
                "2,Lynx lynx,45.0,10.0,ES,HUMAN_OBSERVATION,10,2020,2020-06-02",
            ],
        );

        let summary = run(&store, &ValidationSettings::default(), &dataset, &input).unwrap();
        // 50% invalid against a 5% threshold.
        assert_eq!(summary.outcome, GateOutcome::Fail);

        let gate = read_gate(&store, &dataset).unwrap();
        assert_eq!(gate.outcome, GateOutcome::Fail);
    }

    #[test]
    fn clean_input_passes_and_persists_gate() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_csv(
            &dir,
            &["1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-06-01"],
        );

        let summary = run(&store, &ValidationSettings::default(), &dataset, &input).unwrap();
        assert_eq!(summary.outcome, GateOutcome::Pass);
        assert_eq!(read_gate(&store, &dataset).unwrap().outcome, GateOutcome::Pass);
    }

    #[test]
    fn missing_gate_is_reported() {
        let (_dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let err = read_gate(&store, &dataset).unwrap_err();
        assert_matches!(err, PipelineError::ValidationGateMissing(_));
    }
}
