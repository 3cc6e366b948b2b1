use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error_stack::{Report, ResultExt};
use mars2cf::catalog::{Catalog, TimeKind};
use mars2cf::logging::init_logging;
use mars2cf::writer::{self, OutputMetadata};

fn main() -> ExitCode {
    let clargs = Cli::parse();

    init_logging(clargs.verbosity.log_level_filter(), None);

    match driver(clargs) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("convert_era_netcdf did not complete successfully:\n{e:?}");
            ExitCode::FAILURE
        }
    }
}

fn driver(clargs: Cli) -> error_stack::Result<(), CliError> {
    let catalog = load_catalog(clargs.catalog)?;
    let time_kind = clargs
        .time_kind
        .as_deref()
        .map(|s| {
            TimeKind::from_str(s)
                .map_err(|_| Report::new(CliError::BadTimeKind(s.to_string())))
        })
        .transpose()?;

    let spec = catalog
        .lookup(&clargs.variable, time_kind)
        .change_context(CliError::SelectingVariable)?;

    let mut metadata = OutputMetadata::default();
    if let Some(title) = clargs.title {
        metadata.title = title;
    }
    if let Some(source) = clargs.source {
        metadata.source = source;
    }

    writer::convert_file(
        &clargs.input,
        &clargs.output,
        spec,
        &metadata,
        clargs.field_name.as_deref(),
    )
    .change_context(CliError::Converting)?;

    log::info!("Wrote {}", clargs.output.display());
    Ok(())
}

/// Convert one MARS netCDF extract into a CF-compliant netCDF file.
#[derive(Debug, clap::Parser)]
struct Cli {
    /// The file produced by a "Retrieve NetCDF" MARS request.
    input: PathBuf,

    /// Path of the CF-compliant file to write.
    output: PathBuf,

    /// Output variable name, e.g. "pr" or "sftlf"; must be in the catalog.
    variable: String,

    /// "forecast" or "analysis". Only needed when the variable exists for
    /// both.
    #[clap(long)]
    time_kind: Option<String>,

    /// Name of the data field inside the input file, when it differs from
    /// the catalog's source name.
    #[clap(long)]
    field_name: Option<String>,

    /// A TOML catalog file to use instead of the built-in table.
    #[clap(long)]
    catalog: Option<PathBuf>,

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
    #[error("An error occurred while selecting the variable to convert")]
    SelectingVariable,
    #[error("'{0}' is not a time kind; expected 'forecast' or 'analysis'")]
    BadTimeKind(String),
    #[error("An error occurred while converting the file")]
    Converting,
}

fn load_catalog(custom_file: Option<PathBuf>) -> error_stack::Result<Catalog, CliError> {
    match custom_file {
        Some(p) => Catalog::from_toml_file(&p).change_context(CliError::ReadingCatalog),
        None => Catalog::builtin().change_context(CliError::ReadingCatalog),
    }
}
