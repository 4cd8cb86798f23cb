use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;

use camino::Utf8Path;
use geo::{MapCoords, MultiPolygon};
use geojson::{Feature, FeatureCollection, JsonObject, JsonValue};
use serde::Serialize;
use tracing::info;

use crate::crs::{self, SiteCrs};
use crate::error::PipelineError;
use crate::store::{Store, write_bytes_atomic};

/// One Natura 2000 site in the canonical reference layer: WGS84 geometry
/// plus the four attributes the join and metrics stages consume.
#[derive(Debug, Clone)]
pub struct Site {
    pub code: String,
    pub name: Option<String>,
    pub member_state: Option<String>,
    pub site_type: Option<String>,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SitesSummary {
    pub source_crs: String,
    pub site_count: usize,
    pub member_states: usize,
}

/// Reference preparation: read the raw Natura 2000 layer, reproject to
/// EPSG:4326 when needed, keep the four canonical attributes and write the
/// canonical GeoJSON the join stage reads. Duplicate site codes are fatal;
/// the reference layer must key cleanly.
pub fn prepare(store: &Store, raw: &Utf8Path) -> Result<SitesSummary, PipelineError> {
    info!(%raw, "reference preparation started");
    if !raw.as_std_path().exists() {
        return Err(PipelineError::ArtifactNotFound(raw.to_owned()));
    }
    let content = fs::read_to_string(raw.as_std_path())
        .map_err(|err| PipelineError::SiteLayer(format!("read {raw}: {err}")))?;
    let (mut sites, source_crs) = parse_layer(&content)?;

    if source_crs == SiteCrs::EtrsLaea {
        for site in &mut sites {
            site.geometry = site
                .geometry
                .map_coords(|coord| {
                    let (lon, lat) = crs::laea_to_lonlat(coord.x, coord.y);
                    geo::Coord { x: lon, y: lat }
                });
        }
    }

    // Canonical output is sorted by site code, so repeated preparation runs
    // produce identical bytes.
    sites.sort_by(|a, b| a.code.cmp(&b.code));

    let collection = to_feature_collection(&sites);
    let json = serde_json::to_string(&collection)
        .map_err(|err| PipelineError::SiteLayer(err.to_string()))?;
    write_bytes_atomic(&store.canonical_sites(), json.as_bytes())?;

    let member_states: HashSet<&str> = sites
        .iter()
        .filter_map(|s| s.member_state.as_deref())
        .collect();
    let summary = SitesSummary {
        source_crs: match source_crs {
            SiteCrs::Wgs84 => "EPSG:4326".to_string(),
            SiteCrs::EtrsLaea => "EPSG:3035".to_string(),
        },
        site_count: sites.len(),
        member_states: member_states.len(),
    };
    store.write_report(&store.sites_report_path(), &render_report(raw, &sites, &summary))?;

    info!(sites = summary.site_count, "reference preparation completed");
    Ok(summary)
}

/// Canonical site layer, as written by [`prepare`].
pub fn load_canonical(store: &Store) -> Result<Vec<Site>, PipelineError> {
    let path = store.canonical_sites();
    if !path.as_std_path().exists() {
        return Err(PipelineError::ArtifactNotFound(path));
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| PipelineError::SiteLayer(err.to_string()))?;
    let (sites, crs) = parse_layer(&content)?;
    if crs != SiteCrs::Wgs84 {
        return Err(PipelineError::SiteLayer(
            "canonical site layer is not EPSG:4326".to_string(),
        ));
    }
    Ok(sites)
}

fn parse_layer(content: &str) -> Result<(Vec<Site>, SiteCrs), PipelineError> {
    let geojson: geojson::GeoJson = content
        .parse()
        .map_err(|err| PipelineError::SiteLayer(format!("invalid GeoJSON: {err}")))?;
    let collection = FeatureCollection::try_from(geojson)
        .map_err(|err| PipelineError::SiteLayer(format!("not a FeatureCollection: {err}")))?;
    let crs = detect_crs(&collection)?;

    let mut sites = Vec::with_capacity(collection.features.len());
    let mut seen = HashSet::new();
    for feature in &collection.features {
        let site = parse_feature(feature)?;
        if !seen.insert(site.code.clone()) {
            return Err(PipelineError::DuplicateSiteCode(site.code));
        }
        sites.push(site);
    }
    Ok((sites, crs))
}

/// A missing `crs` member means RFC 7946 default WGS84. Legacy exports
/// name their CRS explicitly; anything but 4326 or 3035 is refused.
fn detect_crs(collection: &FeatureCollection) -> Result<SiteCrs, PipelineError> {
    let Some(members) = &collection.foreign_members else {
        return Ok(SiteCrs::Wgs84);
    };
    let Some(name) = members
        .get("crs")
        .and_then(|crs| crs.get("properties"))
        .and_then(|props| props.get("name"))
        .and_then(JsonValue::as_str)
    else {
        return Ok(SiteCrs::Wgs84);
    };
    SiteCrs::parse(name)
}

fn parse_feature(feature: &Feature) -> Result<Site, PipelineError> {
    let props = feature
        .properties
        .as_ref()
        .ok_or_else(|| PipelineError::SiteLayer("site feature without properties".to_string()))?;
    let code = prop_string(props, &["SITECODE", "siteCode"]).ok_or_else(|| {
        PipelineError::SiteLayer("site feature without a SITECODE attribute".to_string())
    })?;

    let geometry = feature
        .geometry
        .as_ref()
        .ok_or_else(|| PipelineError::SiteLayer(format!("site {code} has no geometry")))?;
    let geometry: geo::Geometry<f64> = geometry
        .value
        .clone()
        .try_into()
        .map_err(|err| PipelineError::SiteLayer(format!("site {code}: {err}")))?;
    let geometry = match geometry {
        geo::Geometry::Polygon(polygon) => MultiPolygon(vec![polygon]),
        geo::Geometry::MultiPolygon(multi) => multi,
        _ => {
            return Err(PipelineError::SiteLayer(format!(
                "site {code}: geometry is not polygonal"
            )));
        }
    };

    Ok(Site {
        code,
        name: prop_string(props, &["SITENAME", "siteName"]),
        member_state: prop_string(props, &["MS", "memberState"]),
        site_type: prop_string(props, &["SITETYPE", "siteType"]),
        geometry,
    })
}

fn prop_string(props: &JsonObject, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| props.get(*name))
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn to_feature_collection(sites: &[Site]) -> FeatureCollection {
    let features = sites
        .iter()
        .map(|site| {
            let mut props = JsonObject::new();
            props.insert("siteCode".to_string(), JsonValue::from(site.code.clone()));
            props.insert("siteName".to_string(), json_opt(&site.name));
            props.insert("memberState".to_string(), json_opt(&site.member_state));
            props.insert("siteType".to_string(), json_opt(&site.site_type));
            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&site.geometry))),
                id: None,
                properties: Some(props),
                foreign_members: None,
            }
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn json_opt(value: &Option<String>) -> JsonValue {
    match value {
        Some(v) => JsonValue::from(v.clone()),
        None => JsonValue::Null,
    }
}

fn render_report(raw: &Utf8Path, sites: &[Site], summary: &SitesSummary) -> String {
    let mut by_state: BTreeMap<&str, usize> = BTreeMap::new();
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for site in sites {
        *by_state
            .entry(site.member_state.as_deref().unwrap_or("unknown"))
            .or_default() += 1;
        *by_type
            .entry(site.site_type.as_deref().unwrap_or("unknown"))
            .or_default() += 1;
    }

    let mut out = String::new();
    let _ = writeln!(out, "NATURA 2000 REFERENCE PREPARATION REPORT");
    let _ = writeln!(out);
    let _ = writeln!(out, "Source:     {raw}");
    let _ = writeln!(out, "Source CRS: {}", summary.source_crs);
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out);
    let _ = writeln!(out, "Sites: {}", summary.site_count);
    let _ = writeln!(out, "Member states: {}", summary.member_states);
    let _ = writeln!(out);
    let _ = writeln!(out, "Sites per member state:");
    for (state, count) in &by_state {
        let _ = writeln!(out, "  {state}: {count}");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Sites per site type:");
    for (site_type, count) in &by_type {
        let _ = writeln!(out, "  {site_type}: {count}");
    }
    out
}
