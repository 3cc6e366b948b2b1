//! The variable catalog maps the short names used for output files (e.g.
//! "pr", "tas") onto everything needed to request the matching ECMWF field
//! from MARS and rewrite it as a CF-compliant variable.
//!
//! The catalog is loaded once, either from the table embedded in this crate
//! ([`Catalog::builtin`]) or from a user-supplied TOML file, and is never
//! mutated afterwards. Catalog files are arrays of `[[variable]]` tables:
//!
//! ```toml
//! [[variable]]
//! name = "pr"
//! source_name = "tp"
//! param = "228.128"
//! standard_name = "precipitation_flux"
//! time_kind = "forecast"
//! cell_methods = "time: mean"
//! accumulation = "mean"
//! scale_factor = 0.09259259259259259
//! units = "kg m-2 s-1"
//! force_positive = true
//! ```

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::ConvertError;

/// Whether a field comes from the analysis or from short forecast runs.
///
/// This distinguishes catalog entries (a few fields exist in both streams)
/// and drives the MARS request layout and the output file naming.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimeKind {
    Forecast,
    Analysis,
}

impl TimeKind {
    /// The `type` value used in MARS requests.
    pub fn mars_type(&self) -> &'static str {
        match self {
            TimeKind::Forecast => "fc",
            TimeKind::Analysis => "an",
        }
    }

    /// The output frequency tag: ERA-Interim forecasts are archived on
    /// 3-hourly steps, analyses on the 6-hourly synoptic times.
    pub fn frequency(&self) -> &'static str {
        match self {
            TimeKind::Forecast => "3hr",
            TimeKind::Analysis => "6hr",
        }
    }
}

/// How an accumulated forecast field must be unwound into per-interval
/// values. `Min` and `Max` are declared so that the catalog can describe
/// those fields, but converting them fails with
/// [`ConvertError::UnsupportedAccumulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccumulationMethod {
    Mean,
    Min,
    Max,
}

/// The vertical level type of the MARS request. Pressure-level fields are a
/// declared-but-unimplemented path; asking the writer for one fails with
/// [`ConvertError::UnsupportedLevelType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LevelType {
    #[default]
    Surface,
    PressureLevels,
}

impl LevelType {
    /// The `levtype` value used in MARS requests.
    pub fn mars_levtype(&self) -> &'static str {
        match self {
            LevelType::Surface => "sfc",
            LevelType::PressureLevels => "pl",
        }
    }
}

/// Everything the converter needs to know about one output variable.
///
/// A de-accumulation method is present iff the source field is archived as
/// a running total since forecast start; this cannot be mis-stated in a
/// catalog file because there is no separate boolean to contradict it.
#[derive(Debug, Clone, Deserialize)]
pub struct VariableSpec {
    /// Output variable name, also the catalog key.
    pub name: String,
    /// Name of the field inside the retrieved netCDF file.
    pub source_name: String,
    /// MARS parameter code, e.g. "228.128".
    pub param: String,
    /// CF standard name for the output variable.
    pub standard_name: String,
    pub time_kind: TimeKind,
    #[serde(default)]
    pub level_type: LevelType,
    /// Time-independent fields (orography, land mask) take the invariant
    /// writer path: no time dimension, CF-1.6 global attributes.
    #[serde(default)]
    pub invariant: bool,
    /// CF cell_methods for the output variable. Empty or "time: point"
    /// means instantaneous samples.
    pub cell_methods: Option<String>,
    pub accumulation: Option<AccumulationMethod>,
    /// Multiplied into every element, e.g. to turn accumulated metres of
    /// water over 3 h into kg m-2 s-1.
    pub scale_factor: Option<f64>,
    /// Added to every element, strictly after scaling.
    pub add_offset: Option<f64>,
    /// Clamp negative values (de-accumulation noise) to exactly 0.0.
    #[serde(default)]
    pub force_positive: bool,
    /// Output units. When absent, the source units are carried over with
    /// `*` characters stripped.
    pub units: Option<String>,
    /// Fixed height in metres of a scalar vertical coordinate, e.g. 2.0
    /// for 2 m temperature.
    pub height: Option<f64>,
    /// Round data to this many decimal digits before writing, trading
    /// precision for compression. Never applied unless set.
    pub least_significant_digit: Option<u8>,
}

impl VariableSpec {
    /// Instantaneous samples need no time bounds and keep a whole-hour
    /// time coordinate.
    pub fn is_instantaneous(&self) -> bool {
        match self.cell_methods.as_deref() {
            None | Some("") | Some("time: point") => true,
            Some(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "variable")]
    variables: Vec<VariableSpec>,
}

/// Immutable lookup table from (variable name, time kind) to [`VariableSpec`].
#[derive(Debug, Default)]
pub struct Catalog {
    variables: IndexMap<(String, TimeKind), VariableSpec>,
}

impl Catalog {
    /// The catalog embedded in this crate, covering the ERA-Interim
    /// sub-daily surface set.
    pub fn builtin() -> Result<Self, ConvertError> {
        Self::from_toml_str(DEFAULT_CATALOG_TOML)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConvertError> {
        let parsed: CatalogFile = toml::from_str(s)
            .map_err(|e| ConvertError::Configuration(format!("invalid catalog TOML: {e}")))?;
        let mut variables = IndexMap::new();
        for spec in parsed.variables {
            let key = (spec.name.clone(), spec.time_kind);
            if variables.contains_key(&key) {
                return Err(ConvertError::Configuration(format!(
                    "catalog defines variable '{}' with time kind '{}' more than once",
                    key.0, key.1
                )));
            }
            variables.insert(key, spec);
        }
        Ok(Self { variables })
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConvertError> {
        let buf = std::fs::read_to_string(path).map_err(|e| {
            ConvertError::Configuration(format!(
                "could not read catalog file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&buf)
    }

    /// Find the spec for `name`.
    ///
    /// With a time kind given, only that entry matches. Without one, the
    /// name must identify a unique entry: a name registered under both the
    /// forecast and analysis tables is a configuration error, never a
    /// silent default.
    pub fn lookup(
        &self,
        name: &str,
        time_kind: Option<TimeKind>,
    ) -> Result<&VariableSpec, ConvertError> {
        if let Some(kind) = time_kind {
            return self
                .variables
                .get(&(name.to_owned(), kind))
                .ok_or_else(|| ConvertError::UnknownVariable(name.to_owned()));
        }

        let mut matches = self
            .variables
            .values()
            .filter(|spec| spec.name == name);
        match (matches.next(), matches.next()) {
            (None, _) => Err(ConvertError::UnknownVariable(name.to_owned())),
            (Some(spec), None) => Ok(spec),
            (Some(_), Some(_)) => Err(ConvertError::Configuration(format!(
                "variable '{name}' exists for more than one time kind; pass the time kind explicitly"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableSpec> {
        self.variables.values()
    }
}

/// ERA-Interim sub-daily surface variables. Parameter codes and source
/// field names follow the MARS archive; scale factors convert the archived
/// accumulations (metres of water, J m-2) over 3 h steps into flux units.
const DEFAULT_CATALOG_TOML: &str = r#"
# Invariant fields, extracted once.
[[variable]]
name = "phis"
source_name = "z"
param = "129.128"
standard_name = "surface_geopotential"
time_kind = "analysis"
invariant = true

[[variable]]
name = "sftlf"
source_name = "lsm"
param = "172.128"
standard_name = "land_area_fraction"
time_kind = "analysis"
invariant = true
units = "1"

# Instantaneous analysis fields.
[[variable]]
name = "tas"
source_name = "t2m"
param = "167.128"
standard_name = "air_temperature"
time_kind = "analysis"
cell_methods = "time: point"
height = 2.0

[[variable]]
name = "uas"
source_name = "u10"
param = "165.128"
standard_name = "eastward_wind"
time_kind = "analysis"
cell_methods = "time: point"
height = 10.0

[[variable]]
name = "vas"
source_name = "v10"
param = "166.128"
standard_name = "northward_wind"
time_kind = "analysis"
cell_methods = "time: point"
height = 10.0

[[variable]]
name = "ps"
source_name = "sp"
param = "134.128"
standard_name = "surface_air_pressure"
time_kind = "analysis"
cell_methods = "time: point"

[[variable]]
name = "psl"
source_name = "msl"
param = "151.128"
standard_name = "air_pressure_at_sea_level"
time_kind = "analysis"
cell_methods = "time: point"

# Accumulated forecast fields. tp and sf are metres of water accumulated
# over the forecast step; 1000 / (3 * 3600) converts to kg m-2 s-1.
[[variable]]
name = "pr"
source_name = "tp"
param = "228.128"
standard_name = "precipitation_flux"
time_kind = "forecast"
cell_methods = "time: mean"
accumulation = "mean"
scale_factor = 0.09259259259259259
units = "kg m-2 s-1"
force_positive = true

[[variable]]
name = "prsn"
source_name = "sf"
param = "144.128"
standard_name = "snowfall_flux"
time_kind = "forecast"
cell_methods = "time: mean"
accumulation = "mean"
scale_factor = 0.09259259259259259
units = "kg m-2 s-1"
force_positive = true

# Radiation is archived as J m-2 over the step; 1 / (3 * 3600) gives W m-2.
[[variable]]
name = "rsds"
source_name = "ssrd"
param = "169.128"
standard_name = "surface_downwelling_shortwave_flux_in_air"
time_kind = "forecast"
cell_methods = "time: mean"
accumulation = "mean"
scale_factor = 9.259259259259259e-5
units = "W m-2"
force_positive = true

[[variable]]
name = "rlds"
source_name = "strd"
param = "175.128"
standard_name = "surface_downwelling_longwave_flux_in_air"
time_kind = "forecast"
cell_methods = "time: mean"
accumulation = "mean"
scale_factor = 9.259259259259259e-5
units = "W m-2"
force_positive = true

# Temperature extremes over the forecast step. Declared so requests can be
# built, but min/max de-accumulation is not implemented yet.
[[variable]]
name = "tasmax"
source_name = "mx2t"
param = "201.128"
standard_name = "air_temperature"
time_kind = "forecast"
cell_methods = "time: maximum"
accumulation = "max"
height = 2.0

[[variable]]
name = "tasmin"
source_name = "mn2t"
param = "202.128"
standard_name = "air_temperature"
time_kind = "forecast"
cell_methods = "time: minimum"
accumulation = "min"
height = 2.0
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_parses() {
        let catalog = Catalog::builtin().expect("embedded catalog should parse");
        assert!(!catalog.is_empty());

        let sftlf = catalog
            .lookup("sftlf", None)
            .expect("sftlf should be registered");
        assert!(sftlf.invariant);
        assert_eq!(sftlf.standard_name, "land_area_fraction");
        assert_eq!(sftlf.units.as_deref(), Some("1"));

        let pr = catalog
            .lookup("pr", Some(TimeKind::Forecast))
            .expect("pr should be registered");
        assert_eq!(pr.accumulation, Some(AccumulationMethod::Mean));
        assert!(pr.force_positive);
        assert!(!pr.is_instantaneous());
    }

    #[test]
    fn test_unknown_variable_is_an_error() {
        let catalog = Catalog::builtin().unwrap();
        let err = catalog.lookup("clt", None).unwrap_err();
        assert!(matches!(err, ConvertError::UnknownVariable(name) if name == "clt"));

        let err = catalog.lookup("pr", Some(TimeKind::Analysis)).unwrap_err();
        assert!(matches!(err, ConvertError::UnknownVariable(_)));
    }

    #[test]
    fn test_ambiguous_lookup_requires_time_kind() {
        let toml_str = r#"
        [[variable]]
        name = "tas"
        source_name = "t2m"
        param = "167.128"
        standard_name = "air_temperature"
        time_kind = "analysis"

        [[variable]]
        name = "tas"
        source_name = "t2m"
        param = "167.128"
        standard_name = "air_temperature"
        time_kind = "forecast"
        "#;
        let catalog = Catalog::from_toml_str(toml_str).unwrap();

        let err = catalog.lookup("tas", None).unwrap_err();
        assert!(matches!(err, ConvertError::Configuration(_)));

        // Explicit time kinds still resolve.
        assert!(catalog.lookup("tas", Some(TimeKind::Forecast)).is_ok());
        assert!(catalog.lookup("tas", Some(TimeKind::Analysis)).is_ok());
    }

    #[test]
    fn test_duplicate_entry_rejected_at_load() {
        let toml_str = r#"
        [[variable]]
        name = "ps"
        source_name = "sp"
        param = "134.128"
        standard_name = "surface_air_pressure"
        time_kind = "analysis"

        [[variable]]
        name = "ps"
        source_name = "sp"
        param = "134.128"
        standard_name = "surface_air_pressure"
        time_kind = "analysis"
        "#;
        let err = Catalog::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConvertError::Configuration(_)));
    }

    #[test]
    fn test_minmax_fields_declared() {
        let catalog = Catalog::builtin().unwrap();
        let tasmax = catalog.lookup("tasmax", None).unwrap();
        assert_eq!(tasmax.accumulation, Some(AccumulationMethod::Max));
        let tasmin = catalog.lookup("tasmin", None).unwrap();
        assert_eq!(tasmin.accumulation, Some(AccumulationMethod::Min));
    }

    #[test]
    fn test_instantaneous_detection() {
        let catalog = Catalog::builtin().unwrap();
        assert!(catalog.lookup("tas", None).unwrap().is_instantaneous());
        assert!(catalog.lookup("phis", None).unwrap().is_instantaneous());
        assert!(!catalog.lookup("rsds", None).unwrap().is_instantaneous());
    }
}
