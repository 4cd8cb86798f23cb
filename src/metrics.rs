use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::domain::DatasetId;
use crate::error::PipelineError;
use crate::occurrence::JoinedRow;
use crate::store::{Store, named_temp_for, persist_temp};

/// Bucket label for records the join left outside every site, and for
/// records without a member state.
pub const UNASSIGNED: &str = "UNASSIGNED";

#[derive(Debug, Default)]
struct Accumulator {
    name: Option<String>,
    member_state: Option<String>,
    occurrences: u64,
    taxa: HashSet<u64>,
    first_date: Option<NaiveDate>,
    last_date: Option<NaiveDate>,
    years: std::collections::BTreeSet<i32>,
}

impl Accumulator {
    fn observe(&mut self, row: &JoinedRow) {
        self.occurrences += 1;
        if let Some(key) = row.taxon_key {
            self.taxa.insert(key);
        }
        let date = row.observation_date();
        if let Some(date) = date {
            self.first_date = Some(self.first_date.map_or(date, |d| d.min(date)));
            self.last_date = Some(self.last_date.map_or(date, |d| d.max(date)));
        }
        if let Some(year) = row.year.or_else(|| date.map(|d| chrono::Datelike::year(&d))) {
            self.years.insert(year);
        }
    }

    fn year_min(&self) -> Option<i32> {
        self.years.first().copied()
    }

    fn year_max(&self) -> Option<i32> {
        self.years.last().copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteMetricsRow {
    pub site_code: String,
    pub site_name: Option<String>,
    pub member_state: Option<String>,
    pub n_occurrences: u64,
    pub n_species: u64,
    pub first_observation: Option<NaiveDate>,
    pub last_observation: Option<NaiveDate>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub n_years: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberStateMetricsRow {
    pub member_state: String,
    pub n_occurrences: u64,
    pub n_species: u64,
    pub n_sites: u64,
    pub first_observation: Option<NaiveDate>,
    pub last_observation: Option<NaiveDate>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub n_years: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub dataset: String,
    pub sites_output: Utf8PathBuf,
    pub member_states_output: Utf8PathBuf,
    pub total_rows: u64,
    pub site_count: usize,
    pub member_state_count: usize,
}

/// Basic metrics over the joined table: per-site and per-member-state
/// occurrence counts, species richness and temporal range. Records outside
/// every site land in an explicit UNASSIGNED bucket rather than being
/// silently dropped. Grouping uses ordered maps so re-runs write identical
/// bytes.
pub fn run(
    store: &Store,
    dataset: &DatasetId,
    input: &Utf8Path,
) -> Result<MetricsSummary, PipelineError> {
    info!(%dataset, %input, "basic metrics started");

    let mut per_site: BTreeMap<String, Accumulator> = BTreeMap::new();
    let mut per_state: BTreeMap<String, Accumulator> = BTreeMap::new();
    let mut sites_per_state: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    let mut total_rows = 0u64;

    read_joined(input, |row| {
        total_rows += 1;

        let site_key = row.site_code.clone().unwrap_or_else(|| UNASSIGNED.to_string());
        let state_key = row
            .member_state
            .clone()
            .unwrap_or_else(|| UNASSIGNED.to_string());

        let site = per_site.entry(site_key.clone()).or_default();
        if site.name.is_none() {
            site.name = row.site_name.clone();
        }
        if site.member_state.is_none() {
            site.member_state = row.member_state.clone();
        }
        site.observe(&row);

        per_state.entry(state_key.clone()).or_default().observe(&row);
        if row.site_code.is_some() {
            sites_per_state.entry(state_key).or_default().insert(site_key);
        }
        Ok(())
    })?;

    let sites_output = store.sites_metrics_csv(dataset);
    write_csv(&sites_output, per_site.iter().map(|(code, acc)| SiteMetricsRow {
        site_code: code.clone(),
        site_name: acc.name.clone(),
        member_state: acc.member_state.clone(),
        n_occurrences: acc.occurrences,
        n_species: acc.taxa.len() as u64,
        first_observation: acc.first_date,
        last_observation: acc.last_date,
        year_min: acc.year_min(),
        year_max: acc.year_max(),
        n_years: acc.years.len() as u64,
    }))?;

    let member_states_output = store.ms_metrics_csv(dataset);
    write_csv(
        &member_states_output,
        per_state.iter().map(|(state, acc)| MemberStateMetricsRow {
            member_state: state.clone(),
            n_occurrences: acc.occurrences,
            n_species: acc.taxa.len() as u64,
            n_sites: sites_per_state.get(state).map_or(0, |s| s.len()) as u64,
            first_observation: acc.first_date,
            last_observation: acc.last_date,
            year_min: acc.year_min(),
            year_max: acc.year_max(),
            n_years: acc.years.len() as u64,
        }),
    )?;

    let summary = MetricsSummary {
        dataset: dataset.to_string(),
        sites_output,
        member_states_output,
        total_rows,
        site_count: per_site.len(),
        member_state_count: per_state.len(),
    };

    let report_path = store.report_path(dataset, "metrics");
    store.write_report(&report_path, &render_report(input, &per_site, &per_state, &summary))?;

    info!(%dataset, total_rows, sites = summary.site_count, "basic metrics completed");
    Ok(summary)
}

/// Stream the joined table row by row.
pub fn read_joined<F>(input: &Utf8Path, mut visit: F) -> Result<(), PipelineError>
where
    F: FnMut(JoinedRow) -> Result<(), PipelineError>,
{
    if !input.as_std_path().exists() {
        return Err(PipelineError::ArtifactNotFound(input.to_owned()));
    }
    let mut reader = csv::Reader::from_path(input.as_std_path())
        .map_err(|err| PipelineError::Csv(err.to_string()))?;
    for row in reader.deserialize() {
        let row: JoinedRow = row.map_err(|err| PipelineError::Csv(err.to_string()))?;
        visit(row)?;
    }
    Ok(())
}

pub(crate) fn write_csv<T, I>(output: &Utf8Path, rows: I) -> Result<(), PipelineError>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let temp = named_temp_for(output)?;
    {
        let mut writer = csv::Writer::from_writer(&temp);
        for row in rows {
            writer
                .serialize(row)
                .map_err(|err| PipelineError::Csv(err.to_string()))?;
        }
        writer
            .flush()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    persist_temp(temp, output)
}

fn render_report(
    input: &Utf8Path,
    per_site: &BTreeMap<String, Accumulator>,
    per_state: &BTreeMap<String, Accumulator>,
    summary: &MetricsSummary,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "BASIC METRICS REPORT");
    let _ = writeln!(out);
    let _ = writeln!(out, "Dataset: {}", summary.dataset);
    let _ = writeln!(out, "Input:   {input}");
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out);
    let _ = writeln!(out, "Joined records: {}", summary.total_rows);
    let _ = writeln!(out, "Sites with occurrences: {}", summary.site_count);
    let _ = writeln!(out, "Member states: {}", summary.member_state_count);
    let _ = writeln!(out);

    let _ = writeln!(out, "Occurrences and species per member state:");
    for (state, acc) in per_state {
        let _ = writeln!(
            out,
            "  {state}: {} occurrences, {} species",
            acc.occurrences,
            acc.taxa.len()
        );
    }
    let _ = writeln!(out);

    let mut top: Vec<(&String, u64)> = per_site
        .iter()
        .filter(|(code, _)| code.as_str() != UNASSIGNED)
        .map(|(code, acc)| (code, acc.occurrences))
        .collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let _ = writeln!(out, "Top 10 sites by occurrences:");
    for (code, count) in top.into_iter().take(10) {
        let _ = writeln!(out, "  {code}: {count}");
    }
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

    #[test]
    fn site_counts_richness_and_range() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_joined(
            &dir,
            &[
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-01-01,S1,Site One,PT,A",
                "1,Bubo bubo,45.1,10.1,PT,HUMAN_OBSERVATION,10,2020,2020-07-15,S1,Site One,PT,A",
                "2,Lynx lynx,45.2,10.2,PT,HUMAN_OBSERVATION,10,2021,2021-01-01,S1,Site One,PT,A",
            ],
        );

        run(&store, &dataset, &input).unwrap();

        let content =
            std::fs::read_to_string(store.sites_metrics_csv(&dataset).as_std_path()).unwrap();
        let mut reader = csv::Reader::from_reader(content.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(&row[0], "S1");
        assert_eq!(&row[3], "3"); // occurrences
        assert_eq!(&row[4], "2"); // species richness
        assert_eq!(&row[5], "2020-01-01");
        assert_eq!(&row[6], "2021-01-01");
    }

    #[test]
    fn unassigned_records_get_their_own_bucket() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_joined(
            &dir,
            &[
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-01-01,S1,Site One,PT,A",
                "2,Lynx lynx,55.0,20.0,PL,HUMAN_OBSERVATION,10,2020,2020-02-01,,,,",
            ],
        );

        run(&store, &dataset, &input).unwrap();

        let sites =
            std::fs::read_to_string(store.sites_metrics_csv(&dataset).as_std_path()).unwrap();
        assert!(sites.contains("S1"));
        assert!(sites.contains(UNASSIGNED));

        let states = std::fs::read_to_string(store.ms_metrics_csv(&dataset).as_std_path()).unwrap();
        assert!(states.contains("PT"));
        assert!(states.contains(UNASSIGNED));
    }

    #[test]
    fn reruns_are_byte_identical() {
        let (dir, store) = temp_store();
        let dataset: DatasetId = "IAS".parse().unwrap();
        let input = write_joined(
            &dir,
            &[
                "2,Lynx lynx,45.2,10.2,PT,HUMAN_OBSERVATION,10,2021,2021-01-01,S2,Site Two,PT,B",
                "1,Bubo bubo,45.0,10.0,PT,HUMAN_OBSERVATION,10,2020,2020-01-01,S1,Site One,PT,A",
            ],
        );

        run(&store, &dataset, &input).unwrap();
        let first = std::fs::read(store.sites_metrics_csv(&dataset).as_std_path()).unwrap();
        run(&store, &dataset, &input).unwrap();
        let second = std::fs::read(store.sites_metrics_csv(&dataset).as_std_path()).unwrap();
        assert_eq!(first, second);
    }
}
