use std::fs::File;
use std::io::Read;

use camino::Utf8Path;
use zip::ZipArchive;

use crate::error::PipelineError;
use crate::occurrence::OccurrenceRow;

/// Name of the occurrence table inside a Darwin Core Archive.
const OCCURRENCE_ENTRY: &str = "occurrence.txt";

/// Visit every occurrence row in a stage input. A `.zip` input is read as
/// a DwC-A (tab-separated `occurrence.txt` inside the archive); anything
/// else is read as a plain comma-separated table, which lets downstream
/// stages and tests re-feed a filtered CSV through the same reader.
pub fn for_each_row<F>(path: &Utf8Path, visit: F) -> Result<(), PipelineError>
where
    F: FnMut(OccurrenceRow) -> Result<(), PipelineError>,
{
    if !path.as_std_path().exists() {
        return Err(PipelineError::ArtifactNotFound(path.to_owned()));
    }
    if path.extension() == Some("zip") {
        let file = File::open(path.as_std_path())
            .map_err(|err| PipelineError::Archive(format!("open {path}: {err}")))?;
        let mut archive =
            ZipArchive::new(file).map_err(|err| PipelineError::Archive(err.to_string()))?;
        let entry = archive.by_name(OCCURRENCE_ENTRY).map_err(|_| {
            PipelineError::Archive(format!("{OCCURRENCE_ENTRY} not found in {path}"))
        })?;
        // GBIF DwC-A occurrence tables are tab-separated and unquoted.
        let reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .from_reader(entry);
        visit_rows(reader, visit)
    } else {
        let reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path.as_std_path())
            .map_err(|err| PipelineError::Csv(err.to_string()))?;
        visit_rows(reader, visit)
    }
}

/// Header row of a stage input, for structural (column-presence) checks.
pub fn read_headers(path: &Utf8Path) -> Result<Vec<String>, PipelineError> {
    if !path.as_std_path().exists() {
        return Err(PipelineError::ArtifactNotFound(path.to_owned()));
    }
    let mut reader = csv::Reader::from_path(path.as_std_path())
        .map_err(|err| PipelineError::Csv(err.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|err| PipelineError::Csv(err.to_string()))?;
    Ok(headers.iter().map(str::to_string).collect())
}

fn visit_rows<R, F>(mut reader: csv::Reader<R>, mut visit: F) -> Result<(), PipelineError>
where
    R: Read,
    F: FnMut(OccurrenceRow) -> Result<(), PipelineError>,
{
    for row in reader.deserialize() {
        let row: OccurrenceRow = row.map_err(|err| PipelineError::Csv(err.to_string()))?;
        visit(row)?;
    }
    Ok(())
}
