use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid dataset identifier: {0}")]
    InvalidDatasetId(String),

    #[error("GBIF credentials not set: define {0} in the environment")]
    MissingCredentials(&'static str),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("species list error: {0}")]
    SpeciesList(String),

    #[error("no valid taxon keys found in species list {0}")]
    EmptyTaxonKeys(Utf8PathBuf),

    #[error("GBIF request failed: {0}")]
    GbifHttp(String),

    #[error("GBIF returned status {status}: {message}")]
    GbifStatus { status: u16, message: String },

    #[error("too many active GBIF downloads for this account; wait for running jobs to finish")]
    TooManyDownloads,

    #[error("GBIF download job {key} ended with status {status}")]
    DownloadJobFailed { key: String, status: String },

    #[error("GBIF download job {key} still not terminal after {attempts} polls")]
    PollTimeout { key: String, attempts: u32 },

    #[error("input artifact not found: {0}")]
    ArtifactNotFound(Utf8PathBuf),

    #[error("dataset {dataset} is missing required columns: {columns}")]
    MissingColumns { dataset: String, columns: String },

    #[error("no validation gate found for dataset {0}; run the validate stage first")]
    ValidationGateMissing(String),

    #[error("dataset {0} failed spatial validation; refusing to run the spatial join")]
    ValidationGateFailed(String),

    #[error("duplicate site code in polygon input: {0}")]
    DuplicateSiteCode(String),

    #[error("unsupported coordinate reference system: {0}")]
    UnsupportedCrs(String),

    #[error("polygon layer error: {0}")]
    SiteLayer(String),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
