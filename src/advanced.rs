use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::config::GapSettings;
use crate::domain::DatasetId;
use crate::error::PipelineError;
use crate::metrics::{read_joined, write_csv};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct SpeciesMetricsRow {
    pub site_code: String,
    pub member_state: Option<String>,
    pub taxon_key: u64,
    pub scientific_name: Option<String>,
    pub n_occurrences: u64,
    pub first_observation: Option<NaiveDate>,
    pub last_observation: Option<NaiveDate>,
    /// Days between first and last dated observation.
    pub temporal_span_days: Option<i64>,
    pub years_observed: u64,
    /// Observed years over the spanned years, in (0, 1].
    pub temporal_completeness: Option<f64>,
}

/// Network-wide spread of one taxon: how many sites and member states it
/// was observed in, and which years its records cover.
#[derive(Debug, Clone, Serialize)]
pub struct TaxonSpreadRow {
    pub taxon_key: u64,
    pub scientific_name: Option<String>,
    pub n_occurrences: u64,
    pub n_sites: u64,
    pub n_member_states: u64,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub n_years: u64,
    /// Observed years over the spanned years, in (0, 1].
    pub temporal_completeness: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteTypeMetricsRow {
    pub site_type: String,
    pub n_sites: u64,
    pub n_occurrences: u64,
    pub n_species: u64,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub n_years: u64,
}

/// Monitoring-coverage status of one site in the gap table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Gap,
    NoGap,
    InsufficientData,
}

#[derive(Debug, Clone, Serialize)]
pub struct GapRow {
    pub site_code: String,
    pub status: GapStatus,
    pub gap_start: Option<NaiveDate>,
    pub gap_end: Option<NaiveDate>,
    pub gap_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvancedSummary {
    pub dataset: String,
    pub species_output: Utf8PathBuf,
    pub spread_output: Utf8PathBuf,
    pub site_types_output: Utf8PathBuf,
    pub gaps_output: Utf8PathBuf,
    pub species_pairs: usize,
    pub taxa: usize,
    pub sites_with_gaps: usize,
    pub sites_insufficient: usize,
}

#[derive(Debug, Default)]
struct SpeciesAccumulator {
    scientific_name: Option<String>,
    member_state: Option<String>,
    occurrences: u64,
    first_date: Option<NaiveDate>,
    last_date: Option<NaiveDate>,
    years: BTreeSet<i32>,
}

#[derive(Debug, Default)]
struct TaxonAccumulator {
    scientific_name: Option<String>,
    occurrences: u64,
    sites: HashSet<String>,
    member_states: HashSet<String>,
    years: BTreeSet<i32>,
}

#[derive(Debug, Default)]
struct SiteTypeAccumulator {
    sites: HashSet<String>,
    occurrences: u64,
    taxa: HashSet<u64>,
    years: BTreeSet<i32>,
}

/// Advanced metrics over the joined table: per (site, species) temporal
/// profiles, per-taxon network spread, per site-type aggregates and
/// monitoring-gap detection. Only in-site records participate; the
/// unassigned remainder is a basic-metrics concern.
pub fn run(
    store: &Store,
    settings: &GapSettings,
    dataset: &DatasetId,
    input: &Utf8Path,
) -> Result<AdvancedSummary, PipelineError> {
    info!(%dataset, %input, "advanced metrics started");

    let mut per_species: BTreeMap<(String, u64), SpeciesAccumulator> = BTreeMap::new();
    let mut per_taxon: BTreeMap<u64, TaxonAccumulator> = BTreeMap::new();
    let mut per_type: BTreeMap<String, SiteTypeAccumulator> = BTreeMap::new();
    let mut site_dates: BTreeMap<String, BTreeSet<NaiveDate>> = BTreeMap::new();

    read_joined(input, |row| {
        let Some(site_code) = row.site_code.clone() else {
            return Ok(());
        };
        let date = row.observation_date();
        let year = row.year.or_else(|| date.map(|d| chrono::Datelike::year(&d)));

        if let Some(taxon_key) = row.taxon_key {
            let acc = per_species
                .entry((site_code.clone(), taxon_key))
                .or_default();
            if acc.scientific_name.is_none() {
                acc.scientific_name = row.scientific_name.clone();
            }
            if acc.member_state.is_none() {
                acc.member_state = row.member_state.clone();
            }
            acc.occurrences += 1;
            if let Some(date) = date {
                acc.first_date = Some(acc.first_date.map_or(date, |d| d.min(date)));
                acc.last_date = Some(acc.last_date.map_or(date, |d| d.max(date)));
            }
            if let Some(year) = year {
                acc.years.insert(year);
            }

            let spread = per_taxon.entry(taxon_key).or_default();
            if spread.scientific_name.is_none() {
                spread.scientific_name = row.scientific_name.clone();
            }
            spread.occurrences += 1;
            spread.sites.insert(site_code.clone());
            if let Some(ms) = row.member_state.clone() {
                spread.member_states.insert(ms);
            }
            if let Some(year) = year {
                spread.years.insert(year);
            }
        }

        let type_key = row.site_type.clone().unwrap_or_else(|| "unknown".to_string());
        let type_acc = per_type.entry(type_key).or_default();
        type_acc.sites.insert(site_code.clone());
        type_acc.occurrences += 1;
        if let Some(taxon_key) = row.taxon_key {
            type_acc.taxa.insert(taxon_key);
        }
        if let Some(year) = year {
            type_acc.years.insert(year);
        }

        let dates = site_dates.entry(site_code).or_default();
        if let Some(date) = date {
            dates.insert(date);
        }
        Ok(())
    })?;

    let species_output = store.species_metrics_csv(dataset);
    write_csv(
        &species_output,
        per_species.iter().map(|((site, taxon), acc)| {
            let completeness = year_completeness(&acc.years);
            SpeciesMetricsRow {
                site_code: site.clone(),
                member_state: acc.member_state.clone(),
                taxon_key: *taxon,
                scientific_name: acc.scientific_name.clone(),
                n_occurrences: acc.occurrences,
                first_observation: acc.first_date,
                last_observation: acc.last_date,
                temporal_span_days: match (acc.first_date, acc.last_date) {
                    (Some(first), Some(last)) => Some((last - first).num_days()),
                    _ => None,
                },
                years_observed: acc.years.len() as u64,
                temporal_completeness: completeness,
            }
        }),
    )?;

    let spread_output = store.species_spread_csv(dataset);
    write_csv(
        &spread_output,
        per_taxon.iter().map(|(taxon_key, acc)| TaxonSpreadRow {
            taxon_key: *taxon_key,
            scientific_name: acc.scientific_name.clone(),
            n_occurrences: acc.occurrences,
            n_sites: acc.sites.len() as u64,
            n_member_states: acc.member_states.len() as u64,
            year_min: acc.years.first().copied(),
            year_max: acc.years.last().copied(),
            n_years: acc.years.len() as u64,
            temporal_completeness: year_completeness(&acc.years),
        }),
    )?;

    let site_types_output = store.sitetype_metrics_csv(dataset);
    write_csv(
        &site_types_output,
        per_type.iter().map(|(site_type, acc)| SiteTypeMetricsRow {
            site_type: site_type.clone(),
            n_sites: acc.sites.len() as u64,
            n_occurrences: acc.occurrences,
            n_species: acc.taxa.len() as u64,
            year_min: acc.years.first().copied(),
            year_max: acc.years.last().copied(),
            n_years: acc.years.len() as u64,
        }),
    )?;

    let gap_rows = detect_gaps(&site_dates, settings.threshold_days);
    let sites_with_gaps = gap_rows
        .iter()
        .filter(|r| r.status == GapStatus::Gap)
        .map(|r| r.site_code.as_str())
        .collect::<HashSet<_>>()
        .len();
    let sites_insufficient = gap_rows
        .iter()
        .filter(|r| r.status == GapStatus::InsufficientData)
        .count();
    let gaps_output = store.temporal_gaps_csv(dataset);
    write_csv(&gaps_output, gap_rows.iter().cloned())?;

    let summary = AdvancedSummary {
        dataset: dataset.to_string(),
        species_output,
        spread_output,
        site_types_output,
        gaps_output,
        species_pairs: per_species.len(),
        taxa: per_taxon.len(),
        sites_with_gaps,
        sites_insufficient,
    };

    let report_path = store.report_path(dataset, "advanced_metrics");
    store.write_report(
        &report_path,
        &render_report(input, settings, &per_type, &gap_rows, &summary),
    )?;

    info!(
        %dataset,
        species_pairs = summary.species_pairs,
        sites_with_gaps, "advanced metrics completed"
    );
    Ok(summary)
}

/// Observed-years count over the spanned years, `1.0` for a single year.
fn year_completeness(years: &BTreeSet<i32>) -> Option<f64> {
    match (years.first(), years.last()) {
        (Some(first), Some(last)) => Some(years.len() as f64 / f64::from(last - first + 1)),
        _ => None,
    }
}

/// Gap detection per site: sort the distinct observation dates, flag every
/// consecutive interval strictly longer than the threshold. A site needs at
/// least two distinct observation dates for the analysis to mean anything;
/// below that it is reported as insufficient data, never as gap-free.
fn detect_gaps(
    site_dates: &BTreeMap<String, BTreeSet<NaiveDate>>,
    threshold_days: i64,
) -> Vec<GapRow> {
    let mut rows = Vec::new();
    for (site_code, dates) in site_dates {
        if dates.len() < 2 {
            rows.push(GapRow {
                site_code: site_code.clone(),
                status: GapStatus::InsufficientData,
                gap_start: None,
                gap_end: None,
                gap_days: None,
            });
            continue;
        }
        let dates: Vec<NaiveDate> = dates.iter().copied().collect();

        let mut found = false;
        for pair in dates.windows(2) {
            let days = (pair[1] - pair[0]).num_days();
            if days > threshold_days {
                found = true;
                rows.push(GapRow {
                    site_code: site_code.clone(),
                    status: GapStatus::Gap,
                    gap_start: Some(pair[0]),
                    gap_end: Some(pair[1]),
                    gap_days: Some(days),
                });
            }
        }
        if !found {
            rows.push(GapRow {
                site_code: site_code.clone(),
                status: GapStatus::NoGap,
                gap_start: None,
                gap_end: None,
                gap_days: None,
            });
        }
    }
    rows
}

fn render_report(
    input: &Utf8Path,
    settings: &GapSettings,
    per_type: &BTreeMap<String, SiteTypeAccumulator>,
    gap_rows: &[GapRow],
    summary: &AdvancedSummary,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ADVANCED METRICS REPORT");
    let _ = writeln!(out);
    let _ = writeln!(out, "Dataset: {}", summary.dataset);
    let _ = writeln!(out, "Input:   {input}");
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out);
    let _ = writeln!(out, "(site, species) pairs: {}", summary.species_pairs);
    let _ = writeln!(out, "Distinct taxa in sites: {}", summary.taxa);
    let _ = writeln!(out);

    let _ = writeln!(out, "Per site type:");
    for (site_type, acc) in per_type {
        let years = match (acc.years.first(), acc.years.last()) {
            (Some(first), Some(last)) => format!("{first}-{last}"),
            _ => "no dated records".to_string(),
        };
        let _ = writeln!(
            out,
            "  {site_type}: {} sites, {} occurrences, {} species, years {years}",
            acc.sites.len(),
            acc.occurrences,
            acc.taxa.len()
        );
    }
    let _ = writeln!(out);

    let gaps = gap_rows.iter().filter(|r| r.status == GapStatus::Gap).count();
    let _ = writeln!(
        out,
        "Temporal gaps (threshold {} days): {gaps} gaps across {} sites",
        settings.threshold_days, summary.sites_with_gaps
    );
    let _ = writeln!(
        out,
        "Sites with insufficient data for gap analysis: {}",
        summary.sites_insufficient
    );
    out
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("data")).unwrap();
        (dir, Store::new(root))
    }

    const HEADER: &str = "taxonKey,scientificName,decimalLatitude,decimalLongitude,countryCode,basisOfRecord,coordinateUncertaintyInMeters,year,eventDate,siteCode,siteName,memberState,siteType";

    fn write_joined(dir: &tempfile::TempDir, rows: &[&str]) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("joined.csv")).unwrap();
        let mut content = String::from(HEADER);
        content.push('\n');
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        std::fs::write(path.as_std_path(), content).unwrap();
        path
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn gap_longer_than_threshold_is_reported_once() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        // 90-day gap between the second and third date.
        let input = write_joined(
            &dir,
            &[
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-01-01,S1,Site One,PT,A",
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-01-15,S1,Site One,PT,A",
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-04-14,S1,Site One,PT,A",
            ],
        );

        let settings = GapSettings { threshold_days: 60 };
        run(&store, &settings, &dataset, &input).unwrap();

        let content =
            std::fs::read_to_string(store.temporal_gaps_csv(&dataset).as_std_path()).unwrap();
        let mut reader = csv::Reader::from_reader(content.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "gap");
        assert_eq!(&rows[0][2], "2020-01-15");
        assert_eq!(&rows[0][3], "2020-04-14");
        assert_eq!(&rows[0][4], "90");
    }

    #[test]
    fn single_dated_observation_is_insufficient_data() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_joined(
            &dir,
            &["2,Lynx lynx,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-01-01,S2,Site Two,PT,B"],
        );

        run(&store, &GapSettings::default(), &dataset, &input).unwrap();

        let content =
            std::fs::read_to_string(store.temporal_gaps_csv(&dataset).as_std_path()).unwrap();
        assert!(content.contains("S2,insufficient_data,,,"));
    }

    #[test]
    fn dense_observations_report_no_gap() {
        let gaps = detect_gaps(
            &BTreeMap::from([(
                "S1".to_string(),
                BTreeSet::from([date("2020-01-01"), date("2020-01-10"), date("2020-01-20")]),
            )]),
            365,
        );
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].status, GapStatus::NoGap);
    }

    #[test]
    fn repeated_observations_on_one_date_are_insufficient() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        // Three observations, one distinct calendar date: no interval to
        // measure, so the site must not be reported as gap-free.
        let input = write_joined(
            &dir,
            &[
                "2,Lynx lynx,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-05-05,S3,Site Three,PT,B",
                "2,Lynx lynx,45.1,10.1,PT,HUMAN_OBSERVATION,10,2020,2020-05-05,S3,Site Three,PT,B",
                "3,Bubo bubo,45.2,10.2,PT,HUMAN_OBSERVATION,10,2020,2020-05-05,S3,Site Three,PT,B",
            ],
        );

        run(&store, &GapSettings::default(), &dataset, &input).unwrap();

        let content =
            std::fs::read_to_string(store.temporal_gaps_csv(&dataset).as_std_path()).unwrap();
        assert!(content.contains("S3,insufficient_data,,,"));
        assert!(!content.contains("no_gap"));
    }

    #[test]
    fn species_profile_per_site() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_joined(
            &dir,
            &[
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-01-01,S1,Site One,PT,A",
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2021,2021-06-01,S1,Site One,PT,A",
                // Outside every site: excluded from advanced metrics.
                "1,Bubo bubo,55.0,20.0,PL,HUMAN_OBSERVATION,10,2021,2021-06-01,,,,",
            ],
        );

        let summary = run(&store, &GapSettings::default(), &dataset, &input).unwrap();
        assert_eq!(summary.species_pairs, 1);

        let content =
            std::fs::read_to_string(store.species_metrics_csv(&dataset).as_std_path()).unwrap();
        let mut reader = csv::Reader::from_reader(content.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "S1");
        assert_eq!(&rows[0][1], "PT");
        assert_eq!(&rows[0][4], "2"); // occurrences
        assert_eq!(&rows[0][7], "517"); // span in days
        assert_eq!(&rows[0][8], "2"); // years observed
        assert_eq!(&rows[0][9], "1.0"); // both spanned years observed
    }

    #[test]
    fn taxon_spread_counts_distinct_sites_and_member_states() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        // Taxon 1 in two sites across two member states; taxon 2 in one.
        let input = write_joined(
            &dir,
            &[
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-01-01,S1,Site One,PT,A",
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-02-01,S1,Site One,PT,A",
                "1,Bubo bubo,40.0,-3.0,ES,HUMAN_OBSERVATION,10,2022,2022-06-01,S2,Site Two,ES,B",
                "2,Lynx lynx,45.0,10.0,PT,HUMAN_OBSERVATION,10,2021,2021-03-01,S1,Site One,PT,A",
            ],
        );

        let summary = run(&store, &GapSettings::default(), &dataset, &input).unwrap();
        assert_eq!(summary.taxa, 2);

        let content =
            std::fs::read_to_string(store.species_spread_csv(&dataset).as_std_path()).unwrap();
        let mut reader = csv::Reader::from_reader(content.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        // taxon 1: 3 occurrences over 2 sites and 2 member states,
        // observed 2020 and 2022 out of 2020-2022.
        assert_eq!(&rows[0][0], "1");
        assert_eq!(&rows[0][2], "3");
        assert_eq!(&rows[0][3], "2");
        assert_eq!(&rows[0][4], "2");
        assert_eq!(&rows[0][5], "2020");
        assert_eq!(&rows[0][6], "2022");
        assert_eq!(&rows[0][7], "2");
        // taxon 2: single site, single member state, single year.
        assert_eq!(&rows[1][0], "2");
        assert_eq!(&rows[1][3], "1");
        assert_eq!(&rows[1][4], "1");
        assert_eq!(&rows[1][8], "1.0");
    }

    #[test]
    fn site_type_metrics_carry_year_coverage() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_joined(
            &dir,
            &[
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2019,2019-04-01,S1,Site One,PT,A",
                "2,Lynx lynx,45.0,10.0,PT,HUMAN_OBSERVATION,10,2021,2021-09-01,S1,Site One,PT,A",
            ],
        );

        run(&store, &GapSettings::default(), &dataset, &input).unwrap();

        let content =
            std::fs::read_to_string(store.sitetype_metrics_csv(&dataset).as_std_path()).unwrap();
        let mut reader = csv::Reader::from_reader(content.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "A");
        assert_eq!(&rows[0][4], "2019"); // year_min
        assert_eq!(&rows[0][5], "2021"); // year_max
        assert_eq!(&rows[0][6], "2"); // n_years
    }
}
