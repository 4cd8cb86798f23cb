use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use gbif_natura::config::PipelineConfig;
use gbif_natura::domain::DatasetId;
use gbif_natura::error::PipelineError;
use gbif_natura::gbif::GbifHttpClient;
use gbif_natura::pipeline::Pipeline;
use gbif_natura::store::Store;

#[derive(Parser)]
#[command(name = "gbif-natura")]
#[command(about = "GBIF occurrence pipeline for Natura 2000 reporting")]
#[command(version, author)]
struct Cli {
    /// Pipeline config file (JSON); defaults to ./gbif-natura.json
    #[arg(long, global = true)]
    config: Option<String>,

    /// Artifact store root; defaults to ./data
    #[arg(long, global = true)]
    data_root: Option<Utf8PathBuf>,

    /// Dataset identifier; falls back to the config file
    #[arg(long, global = true)]
    dataset: Option<String>,

    /// Print machine-readable JSON summaries instead of plain text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Submit a GBIF bulk download and store the archive")]
    Download,
    #[command(about = "Filter the raw occurrence table")]
    Filter(FilterArgs),
    #[command(about = "Validate the filtered table and write the gate")]
    Validate,
    #[command(about = "Prepare the canonical Natura 2000 reference layer")]
    PrepareSites(PrepareSitesArgs),
    #[command(about = "Join occurrences with Natura 2000 sites")]
    Join,
    #[command(about = "Compute per-site and per-member-state metrics")]
    Metrics,
    #[command(about = "Compute species, site-type and temporal gap metrics")]
    Advanced,
    #[command(about = "Run all stages in order")]
    Run,
}

#[derive(Args)]
struct FilterArgs {
    /// Raw archive or CSV to filter; defaults to the latest raw archive
    #[arg(long)]
    input: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct PrepareSitesArgs {
    /// Raw site layer (GeoJSON); defaults to the config's sites_file
    #[arg(long)]
    input: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::InvalidDatasetId(_)
        | PipelineError::MissingCredentials(_)
        | PipelineError::ConfigRead(_)
        | PipelineError::ConfigParse(_)
        | PipelineError::SpeciesList(_)
        | PipelineError::EmptyTaxonKeys(_)
        | PipelineError::ArtifactNotFound(_)
        | PipelineError::ValidationGateMissing(_) => 2,
        PipelineError::GbifHttp(_)
        | PipelineError::GbifStatus { .. }
        | PipelineError::TooManyDownloads
        | PipelineError::DownloadJobFailed { .. }
        | PipelineError::PollTimeout { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::resolve(cli.config.as_deref()).into_diagnostic()?;
    let store = match &cli.data_root {
        Some(root) => Store::new(root.clone()),
        None => Store::from_cwd().into_diagnostic()?,
    };

    if let Commands::PrepareSites(args) = &cli.command {
        if let Some(input) = &args.input {
            config.sites_file = Some(input.clone());
        }
    }

    let client = GbifHttpClient::new().into_diagnostic()?;
    let pipeline = Pipeline::new(store, config.clone(), client);

    if let Commands::PrepareSites(_) = &cli.command {
        let summary = pipeline.prepare_sites().into_diagnostic()?;
        return emit(cli.json, &summary, |s| {
            format!(
                "prepared {} sites from {} ({} member states)",
                s.site_count, s.source_crs, s.member_states
            )
        });
    }

    let dataset = resolve_dataset(&cli, &config)?;
    run_stage(&cli.command, &pipeline, &dataset, cli.json)
}

fn resolve_dataset(cli: &Cli, config: &PipelineConfig) -> miette::Result<DatasetId> {
    let raw = cli
        .dataset
        .as_deref()
        .or(config.dataset.as_deref())
        .ok_or_else(|| {
            miette::Report::msg("no dataset given (pass --dataset or set it in the config)")
        })?;
    raw.parse::<DatasetId>().into_diagnostic()
}

fn run_stage(
    command: &Commands,
    pipeline: &Pipeline<GbifHttpClient>,
    dataset: &DatasetId,
    json: bool,
) -> miette::Result<()> {
    match command {
        Commands::Download => {
            let summary = pipeline.download(dataset).into_diagnostic()?;
            emit(json, &summary, |s| {
                format!("download {} stored at {}", s.job_key, s.archive)
            })
        }
        Commands::Filter(args) => {
            let summary = pipeline
                .filter(dataset, args.input.as_deref())
                .into_diagnostic()?;
            emit(json, &summary, |s| {
                format!(
                    "kept {} of {} rows ({:.2}%), output at {}",
                    s.kept_rows,
                    s.total_rows,
                    s.retention_ratio * 100.0,
                    s.output
                )
            })
        }
        Commands::Validate => {
            let summary = pipeline.validate(dataset).into_diagnostic()?;
            emit(json, &summary, |s| {
                format!(
                    "gate {}: {} invalid of {} rows",
                    s.outcome, s.invalid_rows, s.total_rows
                )
            })
        }
        Commands::Join => {
            let summary = pipeline.join(dataset).into_diagnostic()?;
            emit(json, &summary, |s| {
                format!(
                    "{} records joined ({} assigned, {} unassigned), output at {}",
                    s.output_rows, s.assigned, s.unassigned, s.output
                )
            })
        }
        Commands::Metrics => {
            let summary = pipeline.metrics(dataset).into_diagnostic()?;
            emit(json, &summary, |s| {
                format!(
                    "metrics for {} sites and {} member states written under {}",
                    s.site_count,
                    s.member_state_count,
                    s.sites_output.parent().unwrap_or(&s.sites_output)
                )
            })
        }
        Commands::Advanced => {
            let summary = pipeline.advanced_metrics(dataset).into_diagnostic()?;
            emit(json, &summary, |s| {
                format!(
                    "{} (site, species) pairs, {} sites with gaps, {} insufficient",
                    s.species_pairs, s.sites_with_gaps, s.sites_insufficient
                )
            })
        }
        Commands::Run => {
            let summary = pipeline.run(dataset).into_diagnostic()?;
            emit(json, &summary, |s| {
                format!(
                    "pipeline complete: {} joined records, results under {}",
                    s.join.output_rows,
                    s.metrics.sites_output.parent().unwrap_or(&s.metrics.sites_output)
                )
            })
        }
        // Handled before stage dispatch; it needs no dataset.
        Commands::PrepareSites(_) => Ok(()),
    }
}

fn emit<T: Serialize>(json: bool, summary: &T, plain: impl Fn(&T) -> String) -> miette::Result<()> {
    if json {
        let rendered = serde_json::to_string_pretty(summary).into_diagnostic()?;
        println!("{rendered}");
    } else {
        println!("{}", plain(summary));
    }
    Ok(())
}
