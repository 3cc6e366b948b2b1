//! Read-only access to a MARS-retrieved netCDF extract.
//!
//! These files are what "Retrieve NetCDF" MARS requests produce: latitude,
//! longitude, and time coordinates plus one data field, occasionally with
//! stray service variables alongside it.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Ix1};
use netcdf::Extents;

use crate::error::ConvertError;

/// Source time coordinate values with the metadata needed to convert them.
#[derive(Debug, Clone)]
pub struct TimeCoordinate {
    pub values: Vec<f64>,
    pub units: String,
    /// Defaults to "gregorian" when the source does not say.
    pub calendar: String,
}

/// An input file, opened for the duration of one conversion call.
pub struct SourceDataset {
    file: netcdf::File,
    path: PathBuf,
}

impl SourceDataset {
    pub fn open(path: &Path) -> Result<Self, ConvertError> {
        let file = netcdf::open(path).map_err(|e| {
            ConvertError::ReadingSource(format!("could not open {}: {e}", path.display()))
        })?;
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Locate the main data field.
    ///
    /// When `explicit` is given (normally the catalog's source field name),
    /// that variable is required. If it is absent, or no name was given,
    /// fall back to the variable with the highest rank; ties go to the
    /// first-declared variable. The fallback exists because grib-to-netCDF
    /// conversions occasionally rename fields, but shape alone is fragile,
    /// so prefer supplying the name.
    pub fn main_variable(&self, explicit: Option<&str>) -> Result<netcdf::Variable, ConvertError> {
        if let Some(name) = explicit {
            if let Some(var) = self.file.variable(name) {
                return Ok(var);
            }
            log::warn!(
                "{} has no variable '{name}'; falling back to the highest-rank variable",
                self.path.display()
            );
        }

        let mut best: Option<netcdf::Variable> = None;
        for var in self.file.variables() {
            let rank = var.dimensions().len();
            let best_rank = best.as_ref().map(|v| v.dimensions().len());
            if best_rank.map_or(true, |r| rank > r) {
                best = Some(var);
            }
        }
        best.ok_or_else(|| ConvertError::MissingSourceField("any data variable".to_string()))
    }

    pub fn require_variable(&self, name: &str) -> Result<netcdf::Variable, ConvertError> {
        self.file
            .variable(name)
            .ok_or_else(|| ConvertError::MissingSourceField(format!("variable '{name}'")))
    }

    /// MARS extracts name their coordinates "latitude"/"longitude"; accept
    /// the short forms too.
    pub fn latitudes(&self) -> Result<Array1<f32>, ConvertError> {
        self.coordinate_values(&["latitude", "lat"])
    }

    pub fn longitudes(&self) -> Result<Array1<f32>, ConvertError> {
        self.coordinate_values(&["longitude", "lon"])
    }

    fn coordinate_values(&self, names: &[&str]) -> Result<Array1<f32>, ConvertError> {
        let var = names
            .iter()
            .find_map(|name| self.file.variable(name))
            .ok_or_else(|| {
                ConvertError::MissingSourceField(format!("a coordinate variable named {names:?}"))
            })?;
        let values = var
            .get::<f32, _>(Extents::All)
            .map_err(|e| {
                ConvertError::ReadingSource(format!("could not read '{}': {e}", var.name()))
            })?
            .into_dimensionality::<Ix1>()
            .map_err(|e| {
                ConvertError::ReadingSource(format!("'{}' is not one-dimensional: {e}", var.name()))
            })?;
        Ok(values)
    }

    pub fn time_coordinate(&self) -> Result<TimeCoordinate, ConvertError> {
        let var = self.require_variable("time")?;
        let values = var
            .get::<f64, _>(Extents::All)
            .map_err(|e| ConvertError::ReadingSource(format!("could not read 'time': {e}")))?
            .into_dimensionality::<Ix1>()
            .map_err(|e| ConvertError::ReadingSource(format!("'time' is not one-dimensional: {e}")))?
            .to_vec();
        let units = get_string_attr(&var, "units")?.ok_or_else(|| {
            ConvertError::MissingSourceField("a 'units' attribute on the time variable".to_string())
        })?;
        let calendar =
            get_string_attr(&var, "calendar")?.unwrap_or_else(|| "gregorian".to_string());
        Ok(TimeCoordinate {
            values,
            units,
            calendar,
        })
    }

    /// The source file's global history attribute, if any.
    pub fn history(&self) -> Result<Option<String>, ConvertError> {
        match self.file.attribute("history") {
            None => Ok(None),
            Some(att) => match att.value().map_err(|e| {
                ConvertError::ReadingSource(format!("could not read global 'history': {e}"))
            })? {
                netcdf::AttributeValue::Str(s) => Ok(Some(s)),
                _ => Ok(None),
            },
        }
    }
}

/// Read a string-valued attribute from a variable, `None` if absent.
pub(crate) fn get_string_attr(
    var: &netcdf::Variable,
    name: &str,
) -> Result<Option<String>, ConvertError> {
    match var.attribute(name) {
        None => Ok(None),
        Some(att) => match att.value().map_err(|e| {
            ConvertError::ReadingSource(format!(
                "could not read attribute '{name}' on '{}': {e}",
                var.name()
            ))
        })? {
            netcdf::AttributeValue::Str(s) => Ok(Some(s)),
            other => Err(ConvertError::ReadingSource(format!(
                "attribute '{name}' on '{}' is not a string (got {other:?})",
                var.name()
            ))),
        },
    }
}
