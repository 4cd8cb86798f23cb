use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Free-form identifier threading through all stages (e.g. `BIRDS`,
/// `HABITATS`, `IAS`). Restricted to a path-safe charset because it is
/// embedded in every artifact and report path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(PipelineError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Severity of a single validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Fatal for the whole file (e.g. a missing contract column).
    Error,
    /// Row-level defect; recorded and excluded, never aborts the run.
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    /// 1-based data row the finding refers to, or `None` for file-level
    /// findings.
    pub row: Option<u64>,
    pub message: String,
}

impl Finding {
    pub fn file_level(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            row: None,
            message: message.into(),
        }
    }

    pub fn row_level(row: u64, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            row: Some(row),
            message: message.into(),
        }
    }
}

/// Outcome of the spatial validation stage, persisted as the gate artifact
/// that the spatial join consults before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateOutcome {
    Pass,
    Fail,
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateOutcome::Pass => write!(f, "pass"),
            GateOutcome::Fail => write!(f, "fail"),
        }
    }
}

pub fn lat_in_range(lat: f64) -> bool {
    lat.is_finite() && (-90.0..=90.0).contains(&lat)
}

pub fn lon_in_range(lon: f64) -> bool {
    lon.is_finite() && (-180.0..=180.0).contains(&lon)
}
