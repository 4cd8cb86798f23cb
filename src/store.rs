use std::fs;
use std::io::Write;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::DatasetId;
use crate::error::PipelineError;

/// Artifact layout rooted at a data directory. Every stage owns exactly
/// its numbered output below this root; nothing is ever rewritten in
/// place — writes go through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn from_cwd() -> Result<Self, PipelineError> {
        let cwd = std::env::current_dir().map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join("data"))
            .map_err(|_| PipelineError::Filesystem("non-utf8 working directory".to_string()))?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    // -- acquisition ------------------------------------------------------

    pub fn raw_dir(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.root.join("raw").join(dataset.as_str())
    }

    pub fn raw_archive(&self, dataset: &DatasetId, job_key: &str, date: &str) -> Utf8PathBuf {
        self.raw_dir(dataset)
            .join(format!("GBIF_{}_{date}_{job_key}.zip", dataset.as_str()))
    }

    /// Most recent raw archive for a dataset. Archive names embed the
    /// download date, so lexicographic order matches recency.
    pub fn latest_raw_archive(&self, dataset: &DatasetId) -> Result<Utf8PathBuf, PipelineError> {
        let dir = self.raw_dir(dataset);
        if !dir.as_std_path().exists() {
            return Err(PipelineError::ArtifactNotFound(dir));
        }
        let mut archives: Vec<Utf8PathBuf> = Vec::new();
        for entry in fs::read_dir(dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?
        {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|_| PipelineError::Filesystem("non-utf8 archive path".to_string()))?;
            if path.extension() == Some("zip") {
                archives.push(path);
            }
        }
        archives.sort();
        archives.pop().ok_or(PipelineError::ArtifactNotFound(dir))
    }

    // -- filtering --------------------------------------------------------

    pub fn filtered_csv(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.root
            .join("filtered")
            .join(dataset.as_str())
            .join(format!("GBIF_{}_filtered_occurrences.csv", dataset.as_str()))
    }

    // -- validation -------------------------------------------------------

    pub fn validation_gate(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.root
            .join("validated")
            .join(dataset.as_str())
            .join("validation_gate.json")
    }

    // -- reference preparation ---------------------------------------------

    pub fn canonical_sites(&self) -> Utf8PathBuf {
        self.root
            .join("reference")
            .join("natura_sites_epsg4326.geojson")
    }

    // -- spatial join -------------------------------------------------------

    pub fn joined_csv(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.root
            .join("processed")
            .join(dataset.as_str())
            .join(format!("GBIF_{}_with_natura_sites.csv", dataset.as_str()))
    }

    // -- metrics ------------------------------------------------------------

    pub fn results_dir(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.root.join("results").join(dataset.as_str())
    }

    pub fn sites_metrics_csv(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.results_dir(dataset).join("sites_metrics.csv")
    }

    pub fn ms_metrics_csv(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.results_dir(dataset).join("ms_metrics.csv")
    }

    pub fn species_metrics_csv(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.results_dir(dataset).join("species_metrics.csv")
    }

    pub fn species_spread_csv(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.results_dir(dataset).join("species_spread_metrics.csv")
    }

    pub fn sitetype_metrics_csv(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.results_dir(dataset).join("sitetype_metrics.csv")
    }

    pub fn temporal_gaps_csv(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.results_dir(dataset).join("sites_temporal_gaps.csv")
    }

    // -- reports -------------------------------------------------------------

    /// Per-stage, per-dataset report location, so independent dataset
    /// identifiers never collide.
    pub fn report_path(&self, dataset: &DatasetId, stage: &str) -> Utf8PathBuf {
        self.root
            .join("reports")
            .join(dataset.as_str())
            .join(format!("{stage}.txt"))
    }

    pub fn sites_report_path(&self) -> Utf8PathBuf {
        self.root.join("reports").join("prepare_sites.txt")
    }

    pub fn write_report(&self, path: &Utf8Path, text: &str) -> Result<(), PipelineError> {
        write_bytes_atomic(path, text.as_bytes())
    }
}

/// Atomically replace `path` with `content`: write a sibling temp file,
/// then rename over the destination. An interrupted run leaves either the
/// old artifact or none, never a partial one.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError> {
    let parent = ensure_parent(path)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".gbif-natura")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    persist_temp(temp, path)
}

/// Atomically move a fully written temp file into place.
pub fn persist_file_atomic(source: &Path, dest: &Utf8Path) -> Result<(), PipelineError> {
    ensure_parent(dest)?;
    if dest.as_std_path().exists() {
        fs::remove_file(dest.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    fs::rename(source, dest.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Open a named temp file next to `dest` for streaming writes; callers
/// finish with [`persist_temp`].
pub fn named_temp_for(dest: &Utf8Path) -> Result<tempfile::NamedTempFile, PipelineError> {
    let parent = ensure_parent(dest)?;
    tempfile::Builder::new()
        .prefix(".gbif-natura")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))
}

pub fn persist_temp(temp: tempfile::NamedTempFile, dest: &Utf8Path) -> Result<(), PipelineError> {
    if dest.as_std_path().exists() {
        fs::remove_file(dest.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    temp.persist(dest.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(())
}

fn ensure_parent(path: &Utf8Path) -> Result<Utf8PathBuf, PipelineError> {
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::Filesystem(format!("no parent directory for {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(parent.to_owned())
}
