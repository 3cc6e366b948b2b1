//! MARS request descriptions and the seam to the retrieval network client.
//!
//! The actual MARS client lives outside this crate. [`MarsClient`] is the
//! contract: given one request, produce exactly the file the request's
//! `target` names. [`CommandClient`] adapts any external fetch program to
//! that contract by passing the rendered request on stdin.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::catalog::VariableSpec;
use crate::error::ConvertError;

/// One "Retrieve NetCDF" MARS request.
#[derive(Debug, Clone)]
pub struct MarsRequest {
    pub dataset: String,
    /// MARS archive class; "ei" for ERA-Interim.
    pub class: String,
    /// "an" or "fc", from the variable's time kind.
    pub mars_type: String,
    /// Parameter code, e.g. "228.128".
    pub param: String,
    pub levtype: String,
    /// Date range, e.g. "1990-01-01/to/1990-12-31".
    pub date: String,
    /// Synoptic or run-start times, slash-separated.
    pub time: String,
    /// Forecast lead steps, slash-separated; "0" for analyses.
    pub step: String,
    pub format: String,
    pub target: PathBuf,
}

impl MarsRequest {
    /// The request for one full year of a variable.
    ///
    /// Forecast fields come from the 00 and 12 UTC runs at steps
    /// +3/+6/+9/+12 h; analysis fields from the four synoptic times.
    pub fn for_year(spec: &VariableSpec, dataset: &str, year: i32, target: PathBuf) -> Self {
        let (time, step) = match spec.time_kind {
            crate::catalog::TimeKind::Forecast => ("00:00:00/12:00:00", "3/6/9/12"),
            crate::catalog::TimeKind::Analysis => {
                ("00:00:00/06:00:00/12:00:00/18:00:00", "0")
            }
        };
        Self {
            dataset: dataset.to_owned(),
            class: "ei".to_owned(),
            mars_type: spec.time_kind.mars_type().to_owned(),
            param: spec.param.clone(),
            levtype: spec.level_type.mars_levtype().to_owned(),
            date: format!("{year}-01-01/to/{year}-12-31"),
            time: time.to_owned(),
            step: step.to_owned(),
            format: "netcdf".to_owned(),
            target,
        }
    }

    /// Render in the MARS request language.
    pub fn render(&self) -> String {
        format!(
            "retrieve,\n  class={},\n  dataset={},\n  type={},\n  param={},\n  levtype={},\n  date={},\n  time={},\n  step={},\n  format={},\n  target=\"{}\"\n",
            self.class,
            self.dataset,
            self.mars_type,
            self.param,
            self.levtype,
            self.date,
            self.time,
            self.step,
            self.format,
            self.target.display(),
        )
    }
}

/// The retrieval network client, supplied by the caller.
pub trait MarsClient {
    /// Execute the request. On success the file named by `request.target`
    /// exists, and its path is returned.
    fn retrieve(&self, request: &MarsRequest) -> Result<PathBuf, ConvertError>;
}

/// Runs an external fetch program once per request, with the target path
/// as its only argument and the rendered request on stdin.
pub struct CommandClient {
    program: PathBuf,
}

impl CommandClient {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl MarsClient for CommandClient {
    fn retrieve(&self, request: &MarsRequest) -> Result<PathBuf, ConvertError> {
        log::info!(
            "Running {} for param {} ({})",
            self.program.display(),
            request.param,
            request.date
        );
        let mut child = Command::new(&self.program)
            .arg(&request.target)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ConvertError::Retrieval(format!(
                    "could not start '{}': {e}",
                    self.program.display()
                ))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            ConvertError::Retrieval("could not open the fetch program's stdin".to_string())
        })?;
        stdin
            .write_all(request.render().as_bytes())
            .map_err(|e| ConvertError::Retrieval(format!("could not send the request: {e}")))?;
        drop(stdin);

        let status = child.wait().map_err(|e| {
            ConvertError::Retrieval(format!("could not wait for the fetch program: {e}"))
        })?;
        if !status.success() {
            return Err(ConvertError::Retrieval(format!(
                "'{}' exited with {status}",
                self.program.display()
            )));
        }
        if !request.target.exists() {
            return Err(ConvertError::Retrieval(format!(
                "the fetch program succeeded but did not produce {}",
                request.target.display()
            )));
        }
        Ok(request.target.clone())
    }
}

/// Convenience for callers that already have the file on disk.
pub struct LocalFileClient;

impl MarsClient for LocalFileClient {
    fn retrieve(&self, request: &MarsRequest) -> Result<PathBuf, ConvertError> {
        if request.target.exists() {
            Ok(request.target.clone())
        } else {
            Err(ConvertError::Retrieval(format!(
                "{} does not exist",
                request.target.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::{Catalog, TimeKind};

    use super::*;

    #[test]
    fn test_forecast_request_layout() {
        let catalog = Catalog::builtin().unwrap();
        let spec = catalog.lookup("pr", None).unwrap();
        let req = MarsRequest::for_year(spec, "era-interim", 1990, Path::new("pr_raw.nc").into());

        assert_eq!(req.mars_type, "fc");
        assert_eq!(req.param, "228.128");
        assert_eq!(req.levtype, "sfc");
        assert_eq!(req.date, "1990-01-01/to/1990-12-31");
        assert_eq!(req.time, "00:00:00/12:00:00");
        assert_eq!(req.step, "3/6/9/12");
    }

    #[test]
    fn test_analysis_request_layout() {
        let catalog = Catalog::builtin().unwrap();
        let spec = catalog.lookup("tas", Some(TimeKind::Analysis)).unwrap();
        let req = MarsRequest::for_year(spec, "era-interim", 2001, Path::new("tas_raw.nc").into());

        assert_eq!(req.mars_type, "an");
        assert_eq!(req.time, "00:00:00/06:00:00/12:00:00/18:00:00");
        assert_eq!(req.step, "0");
    }

    #[test]
    fn test_render_includes_every_field() {
        let catalog = Catalog::builtin().unwrap();
        let spec = catalog.lookup("pr", None).unwrap();
        let req = MarsRequest::for_year(spec, "era-interim", 1990, Path::new("pr_raw.nc").into());
        let text = req.render();

        assert!(text.starts_with("retrieve,"));
        for line in [
            "class=ei",
            "dataset=era-interim",
            "type=fc",
            "param=228.128",
            "levtype=sfc",
            "date=1990-01-01/to/1990-12-31",
            "step=3/6/9/12",
            "format=netcdf",
            "target=\"pr_raw.nc\"",
        ] {
            assert!(text.contains(line), "missing '{line}' in:\n{text}");
        }
    }
}
