use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::advanced::{self, AdvancedSummary};
use crate::config::{GbifCredentials, PipelineConfig, load_taxon_keys};
use crate::domain::DatasetId;
use crate::error::PipelineError;
use crate::filter::{self, FilterSummary};
use crate::gbif::{DownloadRequest, GbifClient, wait_for_completion};
use crate::join::{self, JoinSummary};
use crate::metrics::{self, MetricsSummary};
use crate::sites::{self, SitesSummary};
use crate::store::{Store, named_temp_for, persist_temp};
use crate::validate::{self, ValidationSummary};

#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub dataset: String,
    pub job_key: String,
    pub taxon_keys: usize,
    pub archive: Utf8PathBuf,
}

/// Everything the full pipeline run produced, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub download: DownloadSummary,
    pub filter: FilterSummary,
    pub validation: ValidationSummary,
    pub sites: SitesSummary,
    pub join: JoinSummary,
    pub metrics: MetricsSummary,
    pub advanced: AdvancedSummary,
}

/// Orchestrates the seven stages against one artifact store. Each stage
/// reads the previous stage's artifact from the store, so stages can also
/// run individually between process restarts.
pub struct Pipeline<G> {
    store: Store,
    config: PipelineConfig,
    client: G,
}

impl<G: GbifClient> Pipeline<G> {
    pub fn new(store: Store, config: PipelineConfig, client: G) -> Self {
        Self {
            store,
            config,
            client,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Acquisition: submit a bulk download request, poll until terminal,
    /// fetch the archive into the raw store.
    pub fn download(&self, dataset: &DatasetId) -> Result<DownloadSummary, PipelineError> {
        let creds = GbifCredentials::from_env()?;
        let species_file = self.config.species_file.as_deref().ok_or_else(|| {
            PipelineError::SpeciesList("no species_file configured for this run".to_string())
        })?;
        let taxon_keys = load_taxon_keys(species_file)?;

        let request = DownloadRequest {
            taxon_keys,
            countries: self.config.countries.clone(),
            allowed_basis: self.config.filters.allowed_basis.clone(),
            max_uncertainty_m: self.config.filters.max_uncertainty_m,
        };
        info!(%dataset, taxa = request.taxon_keys.len(), "submitting download request");
        let job_key = self.client.submit(&request, &creds)?;
        info!(%dataset, job_key, "download request accepted");

        wait_for_completion(&self.client, &job_key, self.config.poll)?;

        let date = chrono::Utc::now().format("%Y%m%d").to_string();
        let archive = self.store.raw_archive(dataset, &job_key, &date);
        let temp = named_temp_for(&archive)?;
        self.client.fetch_archive(&job_key, temp.path())?;
        persist_temp(temp, &archive)?;

        let summary = DownloadSummary {
            dataset: dataset.to_string(),
            job_key,
            taxon_keys: request.taxon_keys.len(),
            archive,
        };
        let report_path = self.store.report_path(dataset, "acquisition");
        self.store
            .write_report(&report_path, &render_download_report(&request, &summary))?;
        info!(%dataset, archive = %summary.archive, "archive stored");
        Ok(summary)
    }

    /// Filtering. Without an explicit input, the most recent raw archive
    /// for the dataset is used.
    pub fn filter(
        &self,
        dataset: &DatasetId,
        input: Option<&Utf8Path>,
    ) -> Result<FilterSummary, PipelineError> {
        let input = match input {
            Some(path) => path.to_owned(),
            None => self.store.latest_raw_archive(dataset)?,
        };
        filter::run(&self.store, &self.config.filters, dataset, &input)
    }

    /// Spatial validation over the filtered table.
    pub fn validate(&self, dataset: &DatasetId) -> Result<ValidationSummary, PipelineError> {
        let input = self.store.filtered_csv(dataset);
        validate::run(&self.store, &self.config.validation, dataset, &input)
    }

    /// Reference preparation for the configured Natura 2000 layer.
    pub fn prepare_sites(&self) -> Result<SitesSummary, PipelineError> {
        let raw = self.config.sites_file.as_deref().ok_or_else(|| {
            PipelineError::SiteLayer("no sites_file configured for this run".to_string())
        })?;
        sites::prepare(&self.store, raw)
    }

    pub fn join(&self, dataset: &DatasetId) -> Result<JoinSummary, PipelineError> {
        let input = self.store.filtered_csv(dataset);
        join::run(&self.store, dataset, &input)
    }

    pub fn metrics(&self, dataset: &DatasetId) -> Result<MetricsSummary, PipelineError> {
        let input = self.store.joined_csv(dataset);
        metrics::run(&self.store, dataset, &input)
    }

    pub fn advanced_metrics(&self, dataset: &DatasetId) -> Result<AdvancedSummary, PipelineError> {
        let input = self.store.joined_csv(dataset);
        advanced::run(&self.store, &self.config.gaps, dataset, &input)
    }

    /// The whole pipeline, acquisition through advanced metrics. Stages run
    /// strictly in order and the first failure aborts the run; a later
    /// invocation of the failed stage picks up from the stored artifacts.
    pub fn run(&self, dataset: &DatasetId) -> Result<RunSummary, PipelineError> {
        let download = self.download(dataset)?;
        let filter = self.filter(dataset, Some(download.archive.as_path()))?;
        let validation = self.validate(dataset)?;
        let sites = self.prepare_sites()?;
        let join = self.join(dataset)?;
        let metrics = self.metrics(dataset)?;
        let advanced = self.advanced_metrics(dataset)?;
        Ok(RunSummary {
            download,
            filter,
            validation,
            sites,
            join,
            metrics,
            advanced,
        })
    }
}

fn render_download_report(request: &DownloadRequest, summary: &DownloadSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "GBIF ACQUISITION REPORT");
    let _ = writeln!(out);
    let _ = writeln!(out, "Dataset: {}", summary.dataset);
    let _ = writeln!(out, "Job key: {}", summary.job_key);
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out);
    let _ = writeln!(out, "Taxon keys requested: {}", request.taxon_keys.len());
    let _ = writeln!(out, "Countries: {}", request.countries.join(", "));
    let _ = writeln!(out, "Basis of record: {}", request.allowed_basis.join(", "));
    let _ = writeln!(
        out,
        "Coordinate uncertainty ceiling: {} m",
        request.max_uncertainty_m
    );
    let _ = writeln!(out, "Archive: {}", summary.archive);
    out
}
