use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// EU / EEA member and associated states used in the GBIF download
/// predicate (ISO 3166-1 alpha-2).
pub const EU_COUNTRIES: [&str; 32] = [
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE", "IS", "NO", "CH",
    "LI", "GB",
];

pub const DEFAULT_ALLOWED_BASIS: [&str; 3] = [
    "HUMAN_OBSERVATION",
    "MACHINE_OBSERVATION",
    "PRESERVED_SPECIMEN",
];

const DEFAULT_CONFIG_FILE: &str = "gbif-natura.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Dataset identifier used when the CLI does not pass one explicitly.
    #[serde(default)]
    pub dataset: Option<String>,
    /// Species list CSV with `usageKey` / `acceptedUsageKey` columns.
    #[serde(default)]
    pub species_file: Option<Utf8PathBuf>,
    /// Raw Natura 2000 polygon dataset (GeoJSON).
    #[serde(default)]
    pub sites_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub poll: PollPolicy,
    #[serde(default)]
    pub filters: FilterSettings,
    #[serde(default)]
    pub validation: ValidationSettings,
    #[serde(default)]
    pub gaps: GapSettings,
    /// Country filter for the download predicate.
    #[serde(default = "default_countries")]
    pub countries: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: None,
            species_file: None,
            sites_file: None,
            poll: PollPolicy::default(),
            filters: FilterSettings::default(),
            validation: ValidationSettings::default(),
            gaps: GapSettings::default(),
            countries: default_countries(),
        }
    }
}

impl PipelineConfig {
    /// Resolve the pipeline config. An explicit path must exist; without
    /// one, `gbif-natura.json` in the working directory is used when
    /// present, else defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<Self, PipelineError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| PipelineError::ConfigParse(err.to_string()))
    }
}

/// Bounded polling policy for the GBIF download job wait loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollPolicy {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_max_attempts")]
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            max_attempts: default_poll_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default = "default_allowed_basis")]
    pub allowed_basis: Vec<String>,
    /// Records with a larger coordinate uncertainty (meters) are removed;
    /// a missing uncertainty is treated as 0.
    #[serde(default = "default_max_uncertainty_m")]
    pub max_uncertainty_m: f64,
    /// Optional bounding box restriction, `[lat_min, lat_max, lon_min, lon_max]`.
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub year_min: Option<i32>,
    #[serde(default)]
    pub year_max: Option<i32>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            allowed_basis: default_allowed_basis(),
            max_uncertainty_m: default_max_uncertainty_m(),
            bounding_box: None,
            year_min: None,
            year_max: None,
        }
    }
}

impl FilterSettings {
    pub fn year_filter_active(&self) -> bool {
        self.year_min.is_some() || self.year_max.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_min && lat <= self.lat_max && lon >= self.lon_min && lon <= self.lon_max
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// The gate passes only when invalid rows / total rows stay at or
    /// below this ratio.
    #[serde(default = "default_max_invalid_ratio")]
    pub max_invalid_ratio: f64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_invalid_ratio: default_max_invalid_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GapSettings {
    /// Interval between consecutive observation dates at a site that
    /// counts as a monitoring coverage gap.
    #[serde(default = "default_gap_threshold_days")]
    pub threshold_days: i64,
}

impl Default for GapSettings {
    fn default() -> Self {
        Self {
            threshold_days: default_gap_threshold_days(),
        }
    }
}

/// GBIF account credentials, read from the environment so they never end
/// up in a versioned config file.
#[derive(Debug, Clone)]
pub struct GbifCredentials {
    pub user: String,
    pub password: String,
    pub email: String,
}

impl GbifCredentials {
    pub fn from_env() -> Result<Self, PipelineError> {
        Ok(Self {
            user: require_env("GBIF_USER")?,
            password: require_env("GBIF_PASSWORD")?,
            email: require_env("GBIF_EMAIL")?,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, PipelineError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(PipelineError::MissingCredentials(name)),
    }
}

/// Load the taxon key set from a species list CSV. `acceptedUsageKey` is
/// preferred over `usageKey` for taxonomic consistency; rows with neither
/// are skipped. Order is first-seen, duplicates removed.
pub fn load_taxon_keys(path: &Utf8Path) -> Result<Vec<u64>, PipelineError> {
    if !path.as_std_path().exists() {
        return Err(PipelineError::ArtifactNotFound(path.to_owned()));
    }
    let mut reader = csv::Reader::from_path(path.as_std_path())
        .map_err(|err| PipelineError::SpeciesList(err.to_string()))?;

    let headers = reader
        .headers()
        .map_err(|err| PipelineError::SpeciesList(err.to_string()))?
        .clone();
    let usage_idx = headers.iter().position(|h| h == "usageKey");
    let accepted_idx = headers.iter().position(|h| h == "acceptedUsageKey");
    if usage_idx.is_none() && accepted_idx.is_none() {
        return Err(PipelineError::SpeciesList(format!(
            "{path}: expected a usageKey or acceptedUsageKey column"
        )));
    }

    let mut keys = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for record in reader.records() {
        let record = record.map_err(|err| PipelineError::SpeciesList(err.to_string()))?;
        let parse = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                // Keys exported from spreadsheets often read "2480946.0".
                .and_then(|v| {
                    v.parse::<u64>().ok().or_else(|| {
                        v.parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                            .map(|f| f as u64)
                    })
                })
        };
        let key = parse(accepted_idx).or_else(|| parse(usage_idx));
        if let Some(key) = key {
            if seen.insert(key) {
                keys.push(key);
            }
        }
    }

    if keys.is_empty() {
        return Err(PipelineError::EmptyTaxonKeys(path.to_owned()));
    }
    Ok(keys)
}

fn default_countries() -> Vec<String> {
    EU_COUNTRIES.iter().map(|c| c.to_string()).collect()
}

fn default_allowed_basis() -> Vec<String> {
    DEFAULT_ALLOWED_BASIS.iter().map(|b| b.to_string()).collect()
}

fn default_poll_interval_secs() -> u64 {
    20
}

fn default_poll_max_attempts() -> u32 {
    90
}

fn default_max_uncertainty_m() -> f64 {
    1000.0
}

fn default_max_invalid_ratio() -> f64 {
    0.05
}

fn default_gap_threshold_days() -> i64 {
    365
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_when_config_absent() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.poll.interval_secs, 20);
        assert_eq!(config.poll.max_attempts, 90);
        assert_eq!(config.filters.max_uncertainty_m, 1000.0);
        assert_eq!(config.validation.max_invalid_ratio, 0.05);
        assert_eq!(config.gaps.threshold_days, 365);
        assert_eq!(config.countries.len(), EU_COUNTRIES.len());
    }

    #[test]
    fn partial_config_overrides() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"dataset": "IAS", "poll": {"interval_secs": 5, "max_attempts": 3}, "gaps": {"threshold_days": 90}}"#,
        )
        .unwrap();
        assert_eq!(config.dataset.as_deref(), Some("IAS"));
        assert_eq!(config.poll.interval_secs, 5);
        assert_eq!(config.gaps.threshold_days, 90);
        // untouched sections keep defaults
        assert_eq!(config.filters.allowed_basis.len(), 3);
    }

    #[test]
    fn species_list_prefers_accepted_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("species.csv");
        std::fs::write(
            &path,
            "usageKey,acceptedUsageKey\n100,200\n300,\n,400\nnope,\n300,\n",
        )
        .unwrap();
        let utf8 = Utf8Path::from_path(&path).unwrap();
        let keys = load_taxon_keys(utf8).unwrap();
        assert_eq!(keys, vec![200, 300, 400]);
    }

    #[test]
    fn species_list_skips_non_integral_and_negative_floats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("species.csv");
        // Only the clean float-formatted key survives; a negative or
        // fractional value never becomes a key via the cast.
        std::fs::write(
            &path,
            "usageKey\n2480946.0\n-3.0\n12.5\nNaN\n",
        )
        .unwrap();
        let utf8 = Utf8Path::from_path(&path).unwrap();
        let keys = load_taxon_keys(utf8).unwrap();
        assert_eq!(keys, vec![2480946]);
    }

    #[test]
    fn species_list_without_key_columns_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("species.csv");
        std::fs::write(&path, "species\nBubo bubo\n").unwrap();
        let utf8 = Utf8Path::from_path(&path).unwrap();
        let err = load_taxon_keys(utf8).unwrap_err();
        assert_matches!(err, PipelineError::SpeciesList(_));
    }

    #[test]
    fn species_list_with_no_usable_keys_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("species.csv");
        std::fs::write(&path, "usageKey,acceptedUsageKey\n,\nabc,\n").unwrap();
        let utf8 = Utf8Path::from_path(&path).unwrap();
        let err = load_taxon_keys(utf8).unwrap_err();
        assert_matches!(err, PipelineError::EmptyTaxonKeys(_));
    }
}
