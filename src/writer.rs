//! Assembles CF-compliant output files from MARS extracts.
//!
//! Two output shapes exist. Invariant fields (orography, land mask) become
//! lat/lon-only files with the legacy CF-1.6 global attributes the
//! downstream archive expects. Time-varying fields get a converted time
//! coordinate (with bounds for window-averaged data), an optional scalar
//! height coordinate, and CF-1.7 globals including the experiment name and
//! redistribution notice.

use std::path::Path;

use chrono::Utc;
use error_stack::{Report, ResultExt};
use ndarray::{ArrayD, Axis};
use netcdf::Extents;

use crate::catalog::{LevelType, VariableSpec};
use crate::error::ConvertError;
use crate::source::{get_string_attr, SourceDataset};
use crate::time_axis::{build_time_axis, TimeAxis, TARGET_CALENDAR, TARGET_TIME_UNITS};
use crate::transform::transform_field;

/// Default float fill value of the netCDF C library.
pub const FILL_VALUE: f32 = 9.969_209_968_386_869e36;

/// Placeholder chunk shape for (time, lat, lon) data variables, clamped to
/// the actual dimension lengths so small grids still write. A shape-aware
/// choice would compress better but is not a correctness requirement.
const CHUNK_SHAPE: [usize; 3] = [1, 16, 16];

const REDISTRIBUTION_NOTICE: &str = "This file contains modified ECMWF reanalysis data. \
     Redistribution is subject to the ECMWF data licence; the original \
     fields are available from the MARS archive.";

/// Global attributes identifying the dataset in every output file.
#[derive(Debug, Clone)]
pub struct OutputMetadata {
    pub title: String,
    pub source: String,
    pub references: String,
}

impl Default for OutputMetadata {
    fn default() -> Self {
        Self {
            title: "ERA-Interim".to_string(),
            source: "Reanalysis".to_string(),
            references: "https://www.ecmwf.int/en/research/climate-reanalysis/era-interim"
                .to_string(),
        }
    }
}

/// Convert one retrieved file into one CF-compliant file.
///
/// Opens the input read-only, dispatches on the spec's invariant flag, and
/// closes both handles before returning on every path. A partially written
/// output file is left in place for the caller to inspect.
pub fn convert_file(
    input: &Path,
    output: &Path,
    spec: &VariableSpec,
    metadata: &OutputMetadata,
    field_name: Option<&str>,
) -> error_stack::Result<(), ConvertError> {
    let source = SourceDataset::open(input).map_err(Report::new)?;
    if spec.invariant {
        write_invariant(&source, output, spec, metadata, field_name)
    } else {
        write_time_series(&source, output, spec, metadata, field_name)
    }
}

/// Write a time-independent field: dimensions {lat, lon}, one 2-D data
/// variable, CF-1.6 global attributes.
pub fn write_invariant(
    source: &SourceDataset,
    output: &Path,
    spec: &VariableSpec,
    metadata: &OutputMetadata,
    field_name: Option<&str>,
) -> error_stack::Result<(), ConvertError> {
    let var_ref = source
        .main_variable(Some(field_name.unwrap_or(&spec.source_name)))
        .map_err(Report::new)?;

    let raw = var_ref
        .get::<f64, _>(Extents::All)
        .change_context_lazy(|| {
            ConvertError::ReadingSource(format!("could not read '{}'", var_ref.name()))
        })?;
    // Invariant extracts usually still carry a length-1 time dimension.
    let field = match raw.ndim() {
        2 => raw,
        3 => raw.index_axis(Axis(0), 0).to_owned().into_dyn(),
        other => {
            return Err(Report::new(ConvertError::ReadingSource(format!(
                "expected a [lat, lon] or [time, lat, lon] field, got rank {other}"
            ))))
        }
    };
    let data = prepare_data(field, spec).map_err(Report::new)?;

    let units = output_units(spec, &var_ref, true).map_err(Report::new)?;
    let long_name = long_name(spec, &var_ref).map_err(Report::new)?;
    let lat = source.latitudes().map_err(Report::new)?;
    let lon = source.longitudes().map_err(Report::new)?;
    let history = append_history(
        source.history().map_err(Report::new)?.as_deref(),
        &format!("Extract invariant field '{}'.", spec.name),
    );

    let mut nc = create_output(output)?;
    let write_err =
        |what: &str| ConvertError::WritingOutput(format!("could not write {what}"));

    nc.add_attribute("Conventions", "CF-1.6")
        .change_context_lazy(|| write_err("global attributes"))?;
    add_common_globals(&mut nc, metadata, &history)?;

    write_lat_lon(&mut nc, &lat.to_vec(), &lon.to_vec())?;

    let mut var1 = nc
        .add_variable::<f32>(&spec.name, &["lat", "lon"])
        .change_context_lazy(|| write_err("the data variable"))?;
    var1.set_compression(9, true)
        .change_context_lazy(|| write_err("the data variable"))?;
    var1.set_fill_value(FILL_VALUE)
        .change_context_lazy(|| write_err("the data variable"))?;
    var1.put_attribute("units", units)
        .change_context_lazy(|| write_err("the data variable attributes"))?;
    var1.put_attribute("long_name", long_name)
        .change_context_lazy(|| write_err("the data variable attributes"))?;
    var1.put_attribute("standard_name", spec.standard_name.as_str())
        .change_context_lazy(|| write_err("the data variable attributes"))?;
    let data32 = data.mapv(|v| v as f32);
    var1.put(data32.view(), Extents::All)
        .change_context_lazy(|| write_err("the data values"))?;

    log::info!("Wrote invariant field '{}' to {}", spec.name, output.display());
    Ok(())
}

/// Write a time-varying field: dimensions {time, lat, lon}, a converted
/// time coordinate with optional bounds, an optional scalar height
/// coordinate, CF-1.7 global attributes.
pub fn write_time_series(
    source: &SourceDataset,
    output: &Path,
    spec: &VariableSpec,
    metadata: &OutputMetadata,
    field_name: Option<&str>,
) -> error_stack::Result<(), ConvertError> {
    if spec.level_type == LevelType::PressureLevels {
        return Err(Report::new(ConvertError::UnsupportedLevelType(
            spec.level_type,
        )));
    }

    let var_ref = source
        .main_variable(Some(field_name.unwrap_or(&spec.source_name)))
        .map_err(Report::new)?;
    let raw = var_ref
        .get::<f64, _>(Extents::All)
        .change_context_lazy(|| {
            ConvertError::ReadingSource(format!("could not read '{}'", var_ref.name()))
        })?;
    match raw.ndim() {
        3 => (),
        // A fourth dimension means a true vertical axis the writer cannot
        // describe yet.
        4 => {
            return Err(Report::new(ConvertError::UnsupportedLevelType(
                LevelType::PressureLevels,
            )))
        }
        other => {
            return Err(Report::new(ConvertError::ReadingSource(format!(
                "expected a [time, lat, lon] field, got rank {other}"
            ))))
        }
    }

    let time = source.time_coordinate().map_err(Report::new)?;
    let axis = build_time_axis(
        &time.values,
        &time.units,
        &time.calendar,
        spec.cell_methods.as_deref(),
    )
    .map_err(Report::new)?;
    if axis.len() != raw.len_of(Axis(0)) {
        return Err(Report::new(ConvertError::Configuration(format!(
            "time coordinate has {} values but '{}' has {} time steps",
            axis.len(),
            var_ref.name(),
            raw.len_of(Axis(0))
        ))));
    }

    let data = prepare_data(raw, spec).map_err(Report::new)?;

    let units = output_units(spec, &var_ref, false).map_err(Report::new)?;
    let long_name = long_name(spec, &var_ref).map_err(Report::new)?;
    let lat = source.latitudes().map_err(Report::new)?;
    let lon = source.longitudes().map_err(Report::new)?;
    let history = append_history(
        source.history().map_err(Report::new)?.as_deref(),
        &format!("Convert variable '{}' to CF.", spec.name),
    );

    let mut nc = create_output(output)?;
    let write_err =
        |what: &str| ConvertError::WritingOutput(format!("could not write {what}"));

    nc.add_attribute("Conventions", "CF-1.7")
        .change_context_lazy(|| write_err("global attributes"))?;
    add_common_globals(&mut nc, metadata, &history)?;
    nc.add_attribute("experiment", spec.time_kind.to_string())
        .change_context_lazy(|| write_err("global attributes"))?;
    nc.add_attribute("redistribution", REDISTRIBUTION_NOTICE)
        .change_context_lazy(|| write_err("global attributes"))?;

    nc.add_dimension("time", axis.len())
        .change_context_lazy(|| write_err("the time dimension"))?;
    write_time_axis(&mut nc, &axis)?;
    write_lat_lon(&mut nc, &lat.to_vec(), &lon.to_vec())?;

    if let Some(height) = spec.height {
        write_scalar_height(&mut nc, height)?;
    }

    let (nt, nlat, nlon) = (
        data.len_of(Axis(0)),
        data.len_of(Axis(1)),
        data.len_of(Axis(2)),
    );
    let mut var1 = nc
        .add_variable::<f32>(&spec.name, &["time", "lat", "lon"])
        .change_context_lazy(|| write_err("the data variable"))?;
    var1.set_compression(9, true)
        .change_context_lazy(|| write_err("the data variable"))?;
    var1.set_chunking(&[
        CHUNK_SHAPE[0].min(nt),
        CHUNK_SHAPE[1].min(nlat),
        CHUNK_SHAPE[2].min(nlon),
    ])
    .change_context_lazy(|| write_err("the data variable"))?;
    var1.set_fill_value(FILL_VALUE)
        .change_context_lazy(|| write_err("the data variable"))?;
    var1.put_attribute("units", units)
        .change_context_lazy(|| write_err("the data variable attributes"))?;
    var1.put_attribute("long_name", long_name)
        .change_context_lazy(|| write_err("the data variable attributes"))?;
    var1.put_attribute("standard_name", spec.standard_name.as_str())
        .change_context_lazy(|| write_err("the data variable attributes"))?;
    if let Some(cell_methods) = spec.cell_methods.as_deref().filter(|s| !s.is_empty()) {
        var1.put_attribute("cell_methods", cell_methods)
            .change_context_lazy(|| write_err("the data variable attributes"))?;
    }
    if spec.height.is_some() {
        var1.put_attribute("coordinates", "height")
            .change_context_lazy(|| write_err("the data variable attributes"))?;
    }
    let data32 = data.mapv(|v| v as f32);
    var1.put(data32.view(), Extents::All)
        .change_context_lazy(|| write_err("the data values"))?;

    log::info!("Wrote '{}' to {}", spec.name, output.display());
    Ok(())
}

/// Transform the raw field and apply the optional precision quantization.
fn prepare_data(raw: ArrayD<f64>, spec: &VariableSpec) -> Result<ArrayD<f64>, ConvertError> {
    let mut data = transform_field(raw, spec)?;
    if let Some(digits) = spec.least_significant_digit {
        quantize(&mut data, digits);
    }
    Ok(data)
}

/// Round to `digits` decimal places so the deflate stage has long runs of
/// zero mantissa bits to work with. Lossy; only ever applied when the
/// catalog asks for it.
fn quantize(data: &mut ArrayD<f64>, digits: u8) {
    let factor = 10f64.powi(digits as i32);
    data.mapv_inplace(|v| (v * factor).round() / factor);
}

/// The output unit string: the catalog override verbatim when set,
/// otherwise the source units with the `*` characters upstream uses for
/// exponents stripped. The source string "(0 - 1)" becomes "1", but only
/// on the invariant path where the legacy files expect it.
fn output_units(
    spec: &VariableSpec,
    var_ref: &netcdf::Variable,
    invariant: bool,
) -> Result<String, ConvertError> {
    if let Some(units) = &spec.units {
        return Ok(units.clone());
    }
    let raw = get_string_attr(var_ref, "units")?.ok_or_else(|| {
        ConvertError::MissingSourceField(format!(
            "a 'units' attribute on '{}' (and the catalog sets no override)",
            var_ref.name()
        ))
    })?;
    Ok(normalize_units(&raw, invariant))
}

fn normalize_units(raw: &str, invariant: bool) -> String {
    if invariant && raw == "(0 - 1)" {
        return "1".to_string();
    }
    raw.replace('*', "")
}

fn long_name(spec: &VariableSpec, var_ref: &netcdf::Variable) -> Result<String, ConvertError> {
    Ok(get_string_attr(var_ref, "long_name")?
        .unwrap_or_else(|| spec.standard_name.replace('_', " ")))
}

/// Prepend a timestamped provenance line to the source file's history.
fn append_history(existing: Option<&str>, action: &str) -> String {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%S");
    match existing {
        Some(prev) if !prev.is_empty() => format!("{now}: {action}\n{prev}"),
        _ => format!("{now}: {action}"),
    }
}

fn create_output(output: &Path) -> error_stack::Result<netcdf::FileMut, ConvertError> {
    netcdf::create_with(output, netcdf::Options::NETCDF4 | netcdf::Options::CLASSIC)
        .change_context_lazy(|| {
            ConvertError::WritingOutput(format!("could not create {}", output.display()))
        })
}

fn add_common_globals(
    nc: &mut netcdf::FileMut,
    metadata: &OutputMetadata,
    history: &str,
) -> error_stack::Result<(), ConvertError> {
    let write_err =
        || ConvertError::WritingOutput("could not write global attributes".to_string());
    nc.add_attribute("title", metadata.title.as_str())
        .change_context_lazy(write_err)?;
    nc.add_attribute("history", history)
        .change_context_lazy(write_err)?;
    nc.add_attribute("institution", "ECMWF")
        .change_context_lazy(write_err)?;
    nc.add_attribute("source", metadata.source.as_str())
        .change_context_lazy(write_err)?;
    nc.add_attribute("references", metadata.references.as_str())
        .change_context_lazy(write_err)?;
    Ok(())
}

/// Coordinate variables whose names equal their dimension names, per
/// COARDS, so downstream tools recognize the grid axes.
fn write_lat_lon(
    nc: &mut netcdf::FileMut,
    lat: &[f32],
    lon: &[f32],
) -> error_stack::Result<(), ConvertError> {
    let write_err = |what: &str| ConvertError::WritingOutput(format!("could not write {what}"));

    nc.add_dimension("lat", lat.len())
        .change_context_lazy(|| write_err("the lat dimension"))?;
    nc.add_dimension("lon", lon.len())
        .change_context_lazy(|| write_err("the lon dimension"))?;

    let mut lat_var = nc
        .add_variable::<f32>("lat", &["lat"])
        .change_context_lazy(|| write_err("the lat coordinate"))?;
    lat_var
        .put_values(lat, Extents::All)
        .change_context_lazy(|| write_err("the lat coordinate"))?;
    lat_var
        .put_attribute("axis", "Y")
        .change_context_lazy(|| write_err("the lat coordinate"))?;
    lat_var
        .put_attribute("units", "degrees_north")
        .change_context_lazy(|| write_err("the lat coordinate"))?;
    lat_var
        .put_attribute("long_name", "latitude")
        .change_context_lazy(|| write_err("the lat coordinate"))?;
    lat_var
        .put_attribute("standard_name", "latitude")
        .change_context_lazy(|| write_err("the lat coordinate"))?;

    let mut lon_var = nc
        .add_variable::<f32>("lon", &["lon"])
        .change_context_lazy(|| write_err("the lon coordinate"))?;
    lon_var
        .put_values(lon, Extents::All)
        .change_context_lazy(|| write_err("the lon coordinate"))?;
    lon_var
        .put_attribute("axis", "X")
        .change_context_lazy(|| write_err("the lon coordinate"))?;
    lon_var
        .put_attribute("units", "degrees_east")
        .change_context_lazy(|| write_err("the lon coordinate"))?;
    lon_var
        .put_attribute("long_name", "longitude")
        .change_context_lazy(|| write_err("the lon coordinate"))?;
    lon_var
        .put_attribute("standard_name", "longitude")
        .change_context_lazy(|| write_err("the lon coordinate"))?;

    Ok(())
}

/// The time coordinate, typed per the axis variant: instantaneous axes are
/// whole hours stored as integers, window axes need floating midpoints and
/// a bounds variable.
fn write_time_axis(
    nc: &mut netcdf::FileMut,
    axis: &TimeAxis,
) -> error_stack::Result<(), ConvertError> {
    let write_err = |what: &str| ConvertError::WritingOutput(format!("could not write {what}"));

    match axis {
        TimeAxis::Instant(hours) => {
            let mut time_var = nc
                .add_variable::<i32>("time", &["time"])
                .change_context_lazy(|| write_err("the time coordinate"))?;
            time_var
                .put_values(&hours.to_vec(), Extents::All)
                .change_context_lazy(|| write_err("the time coordinate"))?;
            put_time_attributes(&mut time_var)?;
        }
        TimeAxis::Interval { midpoints, bounds } => {
            nc.add_dimension("bnds", 2)
                .change_context_lazy(|| write_err("the bounds dimension"))?;
            let mut time_var = nc
                .add_variable::<f64>("time", &["time"])
                .change_context_lazy(|| write_err("the time coordinate"))?;
            time_var
                .put_values(&midpoints.to_vec(), Extents::All)
                .change_context_lazy(|| write_err("the time coordinate"))?;
            put_time_attributes(&mut time_var)?;
            time_var
                .put_attribute("bounds", "time_bnds")
                .change_context_lazy(|| write_err("the time coordinate"))?;

            let mut bnds_var = nc
                .add_variable::<f64>("time_bnds", &["time", "bnds"])
                .change_context_lazy(|| write_err("the time bounds"))?;
            bnds_var
                .put(bounds.view().into_dyn(), Extents::All)
                .change_context_lazy(|| write_err("the time bounds"))?;
        }
    }
    Ok(())
}

fn put_time_attributes(
    time_var: &mut netcdf::VariableMut,
) -> error_stack::Result<(), ConvertError> {
    let write_err =
        || ConvertError::WritingOutput("could not write the time attributes".to_string());
    time_var
        .put_attribute("axis", "T")
        .change_context_lazy(write_err)?;
    time_var
        .put_attribute("units", TARGET_TIME_UNITS)
        .change_context_lazy(write_err)?;
    time_var
        .put_attribute("calendar", TARGET_CALENDAR)
        .change_context_lazy(write_err)?;
    time_var
        .put_attribute("long_name", "time")
        .change_context_lazy(write_err)?;
    time_var
        .put_attribute("standard_name", "time")
        .change_context_lazy(write_err)?;
    Ok(())
}

/// A dimensionless coordinate for fields valid at a fixed height above the
/// surface (2 m temperature, 10 m winds).
fn write_scalar_height(
    nc: &mut netcdf::FileMut,
    height: f64,
) -> error_stack::Result<(), ConvertError> {
    let write_err =
        || ConvertError::WritingOutput("could not write the height coordinate".to_string());
    let mut var = nc
        .add_variable::<f64>("height", &[])
        .change_context_lazy(write_err)?;
    var.put_values(&[height], Extents::All)
        .change_context_lazy(write_err)?;
    var.put_attribute("axis", "Z").change_context_lazy(write_err)?;
    var.put_attribute("units", "m").change_context_lazy(write_err)?;
    var.put_attribute("positive", "up")
        .change_context_lazy(write_err)?;
    var.put_attribute("long_name", "height")
        .change_context_lazy(write_err)?;
    var.put_attribute("standard_name", "height")
        .change_context_lazy(write_err)?;
    Ok(())
}
