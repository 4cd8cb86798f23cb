use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use geo::{BoundingRect, Contains, Point};
use rstar::{AABB, RTree, RTreeObject};
use serde::Serialize;
use tracing::info;

use crate::domain::{DatasetId, GateOutcome, lat_in_range, lon_in_range};
use crate::dwca;
use crate::error::PipelineError;
use crate::occurrence::JoinedRow;
use crate::sites::Site;
use crate::store::{Store, named_temp_for, persist_temp};
use crate::validate;

/// Bounding-box entry in the spatial index; `site` indexes into the site
/// slice, exact containment is checked against the full polygon.
struct IndexedSite {
    site: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedSite {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Point-in-polygon lookup over the canonical site layer: an R-tree of
/// polygon bounding boxes prunes candidates, `Contains` decides.
pub struct SiteIndex {
    sites: Vec<Site>,
    tree: RTree<IndexedSite>,
}

impl SiteIndex {
    pub fn build(sites: Vec<Site>) -> Self {
        let entries = sites
            .iter()
            .enumerate()
            .filter_map(|(idx, site)| {
                let rect = site.geometry.bounding_rect()?;
                Some(IndexedSite {
                    site: idx,
                    envelope: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();
        Self {
            sites,
            tree: RTree::bulk_load(entries),
        }
    }

    /// Every site whose polygon contains the point, in canonical (site
    /// code) order so the joined output is deterministic.
    pub fn containing(&self, lon: f64, lat: f64) -> Vec<&Site> {
        let point = Point::new(lon, lat);
        let mut matches: Vec<&Site> = self
            .tree
            .locate_in_envelope_intersecting(&AABB::from_point([lon, lat]))
            .map(|entry| &self.sites[entry.site])
            .filter(|site| site.geometry.contains(&point))
            .collect();
        matches.sort_by(|a, b| a.code.cmp(&b.code));
        matches
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinSummary {
    pub dataset: String,
    pub output: Utf8PathBuf,
    pub input_rows: u64,
    pub output_rows: u64,
    /// Records assigned to at least one site.
    pub assigned: u64,
    /// Records inside no site, kept with null site attributes.
    pub unassigned: u64,
    /// Records duplicated because they fall in overlapping sites.
    pub multi_assigned: u64,
    /// Records dropped for missing or out-of-range coordinates; validation
    /// already flagged these.
    pub invalid_coordinates: u64,
}

/// Spatial join: annotate each filtered occurrence with the Natura 2000
/// site(s) containing it. Refuses to run unless the validation gate exists
/// and passed. A point in N overlapping sites yields N output rows; a
/// point in none yields one row with null site attributes, so no input
/// record is ever dropped here.
pub fn run(
    store: &Store,
    dataset: &DatasetId,
    input: &Utf8Path,
) -> Result<JoinSummary, PipelineError> {
    let gate = validate::read_gate(store, dataset)?;
    if gate.outcome == GateOutcome::Fail {
        return Err(PipelineError::ValidationGateFailed(dataset.to_string()));
    }

    let index = SiteIndex::build(crate::sites::load_canonical(store)?);
    info!(%dataset, sites = index.len(), "spatial join started");

    let output = store.joined_csv(dataset);
    let temp = named_temp_for(&output)?;

    let mut input_rows = 0u64;
    let mut output_rows = 0u64;
    let mut assigned = 0u64;
    let mut unassigned = 0u64;
    let mut multi_assigned = 0u64;
    let mut invalid_coordinates = 0u64;

    {
        let mut writer = csv::Writer::from_writer(&temp);
        dwca::for_each_row(input, |row| {
            input_rows += 1;
            let (lon, lat) = match (row.decimal_longitude, row.decimal_latitude) {
                (Some(lon), Some(lat)) if lon_in_range(lon) && lat_in_range(lat) => (lon, lat),
                _ => {
                    invalid_coordinates += 1;
                    return Ok(());
                }
            };
            let matches = index.containing(lon, lat);

            if matches.is_empty() {
                unassigned += 1;
                output_rows += 1;
                writer
                    .serialize(JoinedRow::from_occurrence(&row))
                    .map_err(|err| PipelineError::Csv(err.to_string()))?;
            } else {
                assigned += 1;
                if matches.len() > 1 {
                    multi_assigned += 1;
                }
                for site in matches {
                    let mut joined = JoinedRow::from_occurrence(&row);
                    joined.site_code = Some(site.code.clone());
                    joined.site_name = site.name.clone();
                    joined.member_state = site.member_state.clone();
                    joined.site_type = site.site_type.clone();
                    output_rows += 1;
                    writer
                        .serialize(joined)
                        .map_err(|err| PipelineError::Csv(err.to_string()))?;
                }
            }
            Ok(())
        })?;
        writer
            .flush()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    persist_temp(temp, &output)?;

    let summary = JoinSummary {
        dataset: dataset.to_string(),
        output,
        input_rows,
        output_rows,
        assigned,
        unassigned,
        multi_assigned,
        invalid_coordinates,
    };
    let report_path = store.report_path(dataset, "spatial_join");
    store.write_report(&report_path, &render_report(input, index.len(), &summary))?;

    info!(
        %dataset,
        input_rows, output_rows, assigned, "spatial join completed"
    );
    Ok(summary)
}

fn render_report(input: &Utf8Path, site_count: usize, summary: &JoinSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "SPATIAL JOIN REPORT");
    let _ = writeln!(out);
    let _ = writeln!(out, "Dataset: {}", summary.dataset);
    let _ = writeln!(out, "Input:   {input}");
    let _ = writeln!(out, "Sites in reference layer: {site_count}");
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out);
    let _ = writeln!(out, "Occurrences before join: {}", summary.input_rows);
    let _ = writeln!(out, "Records after join: {}", summary.output_rows);
    let _ = writeln!(out, "Assigned to at least one site: {}", summary.assigned);
    let considered = summary.input_rows - summary.invalid_coordinates;
    let matched_ratio = if considered > 0 {
        summary.assigned as f64 / considered as f64 * 100.0
    } else {
        0.0
    };
    let _ = writeln!(out, "Matched ratio: {matched_ratio:.2}%");
    let _ = writeln!(out, "Outside every site (kept, null attributes): {}", summary.unassigned);
    let _ = writeln!(
        out,
        "In overlapping sites (duplicated per site): {}",
        summary.multi_assigned
    );
    let _ = writeln!(
        out,
        "Dropped for invalid coordinates: {}",
        summary.invalid_coordinates
    );
    out
}

#[cfg(test)]
mod tests {
    use geo::{MultiPolygon, polygon};

    use super::*;

    fn site(code: &str, poly: geo::Polygon<f64>) -> Site {
        Site {
            code: code.to_string(),
            name: Some(format!("Site {code}")),
            member_state: Some("PT".to_string()),
            site_type: Some("B".to_string()),
            geometry: MultiPolygon(vec![poly]),
        }
    }

    fn unit_square(x0: f64, y0: f64, size: f64) -> geo::Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
            (x: x0, y: y0),
        ]
    }

    #[test]
    fn point_in_overlapping_sites_matches_both() {
        let index = SiteIndex::build(vec![
            site("PT002", unit_square(0.5, 0.5, 1.0)),
            site("PT001", unit_square(0.0, 0.0, 1.0)),
        ]);
        let matches = index.containing(0.75, 0.75);
        let codes: Vec<&str> = matches.iter().map(|s| s.code.as_str()).collect();
        assert_eq!(codes, vec!["PT001", "PT002"]);
    }

    #[test]
    fn point_outside_every_site_matches_none() {
        let index = SiteIndex::build(vec![site("PT001", unit_square(0.0, 0.0, 1.0))]);
        assert!(index.containing(5.0, 5.0).is_empty());
    }

    #[test]
    fn bbox_candidate_outside_polygon_is_rejected() {
        // Triangle whose bbox covers the unit square but whose area does
        // not include the square's upper-left corner region.
        let triangle = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ];
        let index = SiteIndex::build(vec![site("PT001", triangle)]);
        assert_eq!(index.containing(0.9, 0.5).len(), 1);
        assert!(index.containing(0.1, 0.9).is_empty());
    }
}
