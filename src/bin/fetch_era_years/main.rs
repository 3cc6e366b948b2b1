use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error_stack::{Report, ResultExt};
use mars2cf::batch::{self, BatchJob};
use mars2cf::catalog::{Catalog, TimeKind};
use mars2cf::logging::init_logging;
use mars2cf::retrieval::CommandClient;
use mars2cf::writer::OutputMetadata;

fn main() -> ExitCode {
    let clargs = Cli::parse();

    init_logging(
        clargs.verbosity.log_level_filter(),
        clargs.log_file.as_deref(),
    );

    match driver(clargs) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fetch_era_years did not complete successfully:\n{e:?}");
            ExitCode::FAILURE
        }
    }
}

fn driver(clargs: Cli) -> error_stack::Result<(), CliError> {
    let catalog = match clargs.catalog {
        Some(p) => Catalog::from_toml_file(&p).change_context(CliError::ReadingCatalog)?,
        None => Catalog::builtin().change_context(CliError::ReadingCatalog)?,
    };
    let time_kind = clargs
        .time_kind
        .as_deref()
        .map(|s| {
            TimeKind::from_str(s)
                .map_err(|_| Report::new(CliError::BadTimeKind(s.to_string())))
        })
        .transpose()?;

    if !clargs.output_dir.is_dir() {
        return Err(Report::new(CliError::BadOutputDir(clargs.output_dir)));
    }

    let mut metadata = OutputMetadata::default();
    if let Some(title) = clargs.title {
        metadata.title = title;
    }
    if let Some(source) = clargs.source {
        metadata.source = source;
    }

    let job = BatchJob {
        variable: clargs.variable,
        time_kind,
        dataset: clargs.dataset,
        output_dir: clargs.output_dir,
        first_year: clargs.first_year,
        last_year: clargs.last_year,
        delete_intermediate: !clargs.keep_intermediate,
        metadata,
    };

    let client = CommandClient::new(clargs.fetch_command);
    let written = batch::download_and_convert_by_year(&client, &catalog, &job)
        .change_context(CliError::Running)?;
    log::info!("Finished: {} file(s) written", written.len());
    Ok(())
}

/// Retrieve and convert a range of years of one reanalysis variable.
///
/// Each year is fetched with the given command, converted to a
/// CF-compliant netCDF file in the output directory, and (unless told
/// otherwise) the raw retrieved file is deleted.
#[derive(Debug, clap::Parser)]
struct Cli {
    /// Output variable name, e.g. "pr"; must be in the catalog.
    variable: String,

    /// Directory the converted files (and intermediates) go in.
    output_dir: PathBuf,

    /// First year to retrieve, inclusive.
    first_year: i32,

    /// Last year to retrieve, inclusive.
    last_year: i32,

    /// Program to run for each retrieval. It receives the target path as
    /// its argument and the MARS request text on stdin.
    #[clap(long)]
    fetch_command: PathBuf,

    /// MARS dataset id; also appears in the output file names.
    #[clap(long, default_value = "era-interim")]
    dataset: String,

    /// "forecast" or "analysis". Only needed when the variable exists for
    /// both.
    #[clap(long)]
    time_kind: Option<String>,

    /// A TOML catalog file to use instead of the built-in table.
    #[clap(long)]
    catalog: Option<PathBuf>,

    /// Keep the raw retrieved files next to the converted ones.
    #[clap(long)]
    keep_intermediate: bool,

    /// Also append the log to this file; long batch runs outlive terminal
    /// scrollback.
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Override the output title global attribute.
    #[clap(long)]
    title: Option<String>,

    /// Override the output source global attribute.
    #[clap(long)]
    source: Option<String>,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("An error occurred while loading the variable catalog")]
    ReadingCatalog,
    #[error("'{0}' is not a time kind; expected 'forecast' or 'analysis'")]
    BadTimeKind(String),
    #[error("{} is not a directory", .0.display())]
    BadOutputDir(PathBuf),
    #[error("An error occurred while retrieving and converting")]
    Running,
}
