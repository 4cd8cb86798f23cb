use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::config::FilterSettings;
use crate::domain::{DatasetId, lat_in_range, lon_in_range};
use crate::dwca;
use crate::error::PipelineError;
use crate::occurrence::OccurrenceRow;
use crate::store::{Store, named_temp_for, persist_temp};

/// Fixed predicate chain, in application order. The order decides which
/// predicate claims a removed row, so it is part of the report contract
/// and must never be reshuffled.
pub const PREDICATE_ORDER: [&str; 7] = [
    "required-fields",
    "coordinate-range",
    "basis-of-record",
    "coordinate-uncertainty",
    "bounding-box",
    "year-range",
    "duplicate-records",
];

#[derive(Debug, Clone, Serialize)]
pub struct RemovalCount {
    pub predicate: String,
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterSummary {
    pub dataset: String,
    pub input: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub report: Utf8PathBuf,
    pub total_rows: u64,
    /// Rows removed per predicate, in chain order.
    pub removed: Vec<RemovalCount>,
    pub kept_rows: u64,
    pub retention_ratio: f64,
}

/// Run the filtering stage: read the raw table, apply the predicate chain
/// and write the cleaned CSV plus a summary report. The input is never
/// mutated; re-running on identical input reproduces identical removal
/// counts, and filtering an already-filtered table removes nothing.
pub fn run(
    store: &Store,
    settings: &FilterSettings,
    dataset: &DatasetId,
    input: &Utf8Path,
) -> Result<FilterSummary, PipelineError> {
    info!(%dataset, %input, "filtering stage started");

    let output = store.filtered_csv(dataset);
    let temp = named_temp_for(&output)?;

    let mut chain = PredicateChain::new(settings);
    let mut tally = SummaryTally::default();
    let mut total_rows = 0u64;
    let mut kept_rows = 0u64;

    {
        let mut writer = csv::Writer::from_writer(&temp);
        dwca::for_each_row(input, |row| {
            total_rows += 1;
            if chain.retain(&row) {
                kept_rows += 1;
                tally.observe(&row);
                writer
                    .serialize(&row)
                    .map_err(|err| PipelineError::Csv(err.to_string()))?;
            }
            Ok(())
        })?;
        writer
            .flush()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    persist_temp(temp, &output)?;

    let removed = chain.removal_counts();
    let retention_ratio = if total_rows > 0 {
        kept_rows as f64 / total_rows as f64
    } else {
        0.0
    };

    let report_path = store.report_path(dataset, "filtering");
    let report = render_report(
        dataset,
        input,
        settings,
        total_rows,
        &removed,
        kept_rows,
        retention_ratio,
        &tally,
    );
    store.write_report(&report_path, &report)?;

    info!(%dataset, total_rows, kept_rows, "filtering stage completed");
    Ok(FilterSummary {
        dataset: dataset.to_string(),
        input: input.to_owned(),
        output,
        report: report_path,
        total_rows,
        removed,
        kept_rows,
        retention_ratio,
    })
}

/// The predicate chain. Predicates 1-6 are pure functions over a row;
/// duplicate removal keeps a seen-key set and must therefore run last.
struct PredicateChain<'a> {
    settings: &'a FilterSettings,
    removed: BTreeMap<&'static str, u64>,
    seen: HashSet<(Option<u64>, Option<String>, Option<String>, Option<String>)>,
}

impl<'a> PredicateChain<'a> {
    fn new(settings: &'a FilterSettings) -> Self {
        let removed = PREDICATE_ORDER.iter().map(|name| (*name, 0u64)).collect();
        Self {
            settings,
            removed,
            seen: HashSet::new(),
        }
    }

    fn retain(&mut self, row: &OccurrenceRow) -> bool {
        for name in PREDICATE_ORDER {
            let keep = match name {
                "required-fields" => has_required_fields(row),
                "coordinate-range" => coordinates_in_range(row),
                "basis-of-record" => basis_allowed(row, &self.settings.allowed_basis),
                "coordinate-uncertainty" => {
                    uncertainty_below(row, self.settings.max_uncertainty_m)
                }
                "bounding-box" => inside_bounding_box(row, self.settings),
                "year-range" => year_in_range(row, self.settings),
                // Must stay last in PREDICATE_ORDER.
                _ => self.seen.insert(row.dedup_key()),
            };
            if !keep {
                *self.removed.entry(name).or_default() += 1;
                return false;
            }
        }
        true
    }

    fn removal_counts(&self) -> Vec<RemovalCount> {
        PREDICATE_ORDER
            .iter()
            .map(|name| RemovalCount {
                predicate: name.to_string(),
                removed: self.removed[name],
            })
            .collect()
    }
}

fn has_required_fields(row: &OccurrenceRow) -> bool {
    row.scientific_name.is_some()
        && row.taxon_key.is_some()
        && row.decimal_latitude.is_some()
        && row.decimal_longitude.is_some()
}

fn coordinates_in_range(row: &OccurrenceRow) -> bool {
    match (row.decimal_latitude, row.decimal_longitude) {
        (Some(lat), Some(lon)) => lat_in_range(lat) && lon_in_range(lon),
        _ => false,
    }
}

fn basis_allowed(row: &OccurrenceRow, allowed: &[String]) -> bool {
    row.basis_of_record
        .as_deref()
        .map(|basis| allowed.iter().any(|a| a == basis))
        .unwrap_or(false)
}

fn uncertainty_below(row: &OccurrenceRow, max_m: f64) -> bool {
    // Missing uncertainty counts as 0, matching the download predicate.
    row.coordinate_uncertainty_m.unwrap_or(0.0) < max_m
}

fn inside_bounding_box(row: &OccurrenceRow, settings: &FilterSettings) -> bool {
    let Some(bbox) = &settings.bounding_box else {
        return true;
    };
    match (row.decimal_latitude, row.decimal_longitude) {
        (Some(lat), Some(lon)) => bbox.contains(lat, lon),
        _ => false,
    }
}

fn year_in_range(row: &OccurrenceRow, settings: &FilterSettings) -> bool {
    if !settings.year_filter_active() {
        return true;
    }
    // With an active year filter, rows without a valid year are removed.
    let Some(year) = row.year else {
        return false;
    };
    settings.year_min.is_none_or(|min| year >= min)
        && settings.year_max.is_none_or(|max| year <= max)
}

/// Counters over the retained rows, feeding the summary report.
#[derive(Default)]
struct SummaryTally {
    species: BTreeMap<String, u64>,
    taxa: HashSet<u64>,
    countries: BTreeMap<String, u64>,
    basis: BTreeMap<String, u64>,
    years: BTreeMap<i32, u64>,
    lat_min: Option<f64>,
    lat_max: Option<f64>,
    lon_min: Option<f64>,
    lon_max: Option<f64>,
}

impl SummaryTally {
    fn observe(&mut self, row: &OccurrenceRow) {
        if let Some(name) = &row.scientific_name {
            *self.species.entry(name.clone()).or_default() += 1;
        }
        if let Some(key) = row.taxon_key {
            self.taxa.insert(key);
        }
        if let Some(country) = &row.country_code {
            *self.countries.entry(country.clone()).or_default() += 1;
        }
        if let Some(basis) = &row.basis_of_record {
            *self.basis.entry(basis.clone()).or_default() += 1;
        }
        if let Some(year) = row.year {
            *self.years.entry(year).or_default() += 1;
        }
        if let Some(lat) = row.decimal_latitude {
            self.lat_min = Some(self.lat_min.map_or(lat, |v| v.min(lat)));
            self.lat_max = Some(self.lat_max.map_or(lat, |v| v.max(lat)));
        }
        if let Some(lon) = row.decimal_longitude {
            self.lon_min = Some(self.lon_min.map_or(lon, |v| v.min(lon)));
            self.lon_max = Some(self.lon_max.map_or(lon, |v| v.max(lon)));
        }
    }

    fn top_species(&self, n: usize) -> Vec<(&String, u64)> {
        let mut entries: Vec<_> = self.species.iter().map(|(k, v)| (k, *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries.truncate(n);
        entries
    }
}

#[allow(clippy::too_many_arguments)]
fn render_report(
    dataset: &DatasetId,
    input: &Utf8Path,
    settings: &FilterSettings,
    total_rows: u64,
    removed: &[RemovalCount],
    kept_rows: u64,
    retention_ratio: f64,
    tally: &SummaryTally,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "GBIF FILTERING SUMMARY REPORT");
    let _ = writeln!(out);
    let _ = writeln!(out, "Dataset: {dataset}");
    let _ = writeln!(out, "Input:   {input}");
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out);

    let _ = writeln!(out, "Filter configuration");
    let _ = writeln!(out, "--------------------");
    let _ = writeln!(
        out,
        "Required non-null fields: scientificName, taxonKey, decimalLatitude, decimalLongitude"
    );
    let _ = writeln!(
        out,
        "basisOfRecord filter: {}",
        settings.allowed_basis.join(", ")
    );
    let _ = writeln!(
        out,
        "coordinateUncertaintyInMeters filter: < {} m (missing treated as 0)",
        settings.max_uncertainty_m
    );
    match &settings.bounding_box {
        Some(bbox) => {
            let _ = writeln!(
                out,
                "Spatial filter (bounding box): lat [{}, {}], lon [{}, {}]",
                bbox.lat_min, bbox.lat_max, bbox.lon_min, bbox.lon_max
            );
        }
        None => {
            let _ = writeln!(out, "Spatial filter (bounding box): none");
        }
    }
    if settings.year_filter_active() {
        let _ = writeln!(
            out,
            "Temporal filter (year): min {:?}, max {:?}",
            settings.year_min, settings.year_max
        );
    } else {
        let _ = writeln!(out, "Temporal filter (year): none");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Rows removed per predicate (in chain order)");
    let _ = writeln!(out, "-------------------------------------------");
    for count in removed {
        let _ = writeln!(out, "  {}: {}", count.predicate, count.removed);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Total records (raw): {total_rows}");
    let _ = writeln!(out, "Records after filtering: {kept_rows}");
    let _ = writeln!(out, "Unique species: {}", tally.species.len());
    let _ = writeln!(out, "Unique taxonKeys: {}", tally.taxa.len());
    let _ = writeln!(
        out,
        "Retention ratio after filtering: {:.2}%",
        retention_ratio * 100.0
    );
    let _ = writeln!(out);

    if let (Some(min), Some(max)) = (tally.years.keys().next(), tally.years.keys().last()) {
        let _ = writeln!(out, "Year range: {min} to {max}");
    }
    let _ = writeln!(
        out,
        "Geographic coverage: {} unique countries",
        tally.countries.len()
    );
    if let (Some(lat_min), Some(lat_max), Some(lon_min), Some(lon_max)) =
        (tally.lat_min, tally.lat_max, tally.lon_min, tally.lon_max)
    {
        let _ = writeln!(out, "Latitude range: {lat_min:.4} to {lat_max:.4}");
        let _ = writeln!(out, "Longitude range: {lon_min:.4} to {lon_max:.4}");
    }
    let _ = writeln!(out);

    let total_basis: u64 = tally.basis.values().sum();
    let _ = writeln!(out, "Basis of Record distribution:");
    for (basis, count) in &tally.basis {
        let percent = if total_basis > 0 {
            *count as f64 / total_basis as f64 * 100.0
        } else {
            0.0
        };
        let _ = writeln!(out, "  {basis}: {count} ({percent:.2}%)");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Top 10 species by number of occurrences:");
    for (name, count) in tally.top_species(10) {
        let _ = writeln!(out, "  {name}: {count}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Occurrences per country:");
    for (country, count) in &tally.countries {
        let _ = writeln!(out, "  {country}: {count}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Occurrences by year:");
    for (year, count) in &tally.years {
        let _ = writeln!(out, "  {year}: {count}");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        taxon: Option<u64>,
        name: Option<&str>,
        lat: Option<f64>,
        lon: Option<f64>,
        basis: Option<&str>,
        uncertainty: Option<f64>,
    ) -> OccurrenceRow {
        OccurrenceRow {
            taxon_key: taxon,
            scientific_name: name.map(str::to_string),
            decimal_latitude: lat,
            decimal_longitude: lon,
            basis_of_record: basis.map(str::to_string),
            coordinate_uncertainty_m: uncertainty,
            ..OccurrenceRow::default()
        }
    }

    #[test]
    fn first_failing_predicate_claims_the_row() {
        let settings = FilterSettings::default();
        let mut chain = PredicateChain::new(&settings);

        // Missing coordinates and a bad basis: claimed by required-fields.
        assert!(!chain.retain(&row(Some(1), Some("Bubo bubo"), None, None, Some("FOSSIL"), None)));
        assert_eq!(chain.removed["required-fields"], 1);
        assert_eq!(chain.removed["basis-of-record"], 0);
    }

    #[test]
    fn out_of_range_coordinates_are_removed() {
        let settings = FilterSettings::default();
        let mut chain = PredicateChain::new(&settings);
        assert!(!chain.retain(&row(
            Some(1),
            Some("Bubo bubo"),
            Some(95.0),
            Some(10.0),
            Some("HUMAN_OBSERVATION"),
            None,
        )));
        assert_eq!(chain.removed["coordinate-range"], 1);
    }

    #[test]
    fn uncertainty_missing_counts_as_zero() {
        let settings = FilterSettings::default();
        let mut chain = PredicateChain::new(&settings);
        assert!(chain.retain(&row(
            Some(1),
            Some("Bubo bubo"),
            Some(45.0),
            Some(10.0),
            Some("HUMAN_OBSERVATION"),
            None,
        )));
        assert!(!chain.retain(&row(
            Some(2),
            Some("Lynx lynx"),
            Some(45.0),
            Some(10.0),
            Some("HUMAN_OBSERVATION"),
            Some(2500.0),
        )));
        assert_eq!(chain.removed["coordinate-uncertainty"], 1);
    }

    #[test]
    fn duplicates_removed_by_key() {
        let settings = FilterSettings::default();
        let mut chain = PredicateChain::new(&settings);
        let sample = row(
            Some(1),
            Some("Bubo bubo"),
            Some(45.0),
            Some(10.0),
            Some("HUMAN_OBSERVATION"),
            None,
        );
        assert!(chain.retain(&sample));
        assert!(!chain.retain(&sample));
        assert_eq!(chain.removed["duplicate-records"], 1);
    }

    #[test]
    fn year_filter_inactive_keeps_undated_rows() {
        let settings = FilterSettings::default();
        let mut chain = PredicateChain::new(&settings);
        assert!(chain.retain(&row(
            Some(1),
            Some("Bubo bubo"),
            Some(45.0),
            Some(10.0),
            Some("HUMAN_OBSERVATION"),
            None,
        )));

        let restricted = FilterSettings {
            year_min: Some(2000),
            ..FilterSettings::default()
        };
        let mut chain = PredicateChain::new(&restricted);
        // Same row, no year: removed once the year filter is active.
        assert!(!chain.retain(&row(
            Some(1),
            Some("Bubo bubo"),
            Some(45.0),
            Some(10.0),
            Some("HUMAN_OBSERVATION"),
            None,
        )));
        assert_eq!(chain.removed["year-range"], 1);
    }
}
