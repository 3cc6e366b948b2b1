//! Sequential multi-year retrieve-and-convert driver.
//!
//! One fetch, one conversion, one optional cleanup deletion per year, in
//! increasing year order. There is no parallelism, no retry, and no
//! skip-and-continue: a failure on one year halts the remaining years.

use std::path::PathBuf;

use error_stack::{Report, ResultExt};
use log::info;

use crate::catalog::{Catalog, TimeKind};
use crate::error::ConvertError;
use crate::retrieval::{MarsClient, MarsRequest};
use crate::writer::{self, OutputMetadata};

/// What to retrieve and convert, and where to put it.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Output variable name, looked up in the catalog.
    pub variable: String,
    /// Required when the variable exists for both time kinds.
    pub time_kind: Option<TimeKind>,
    /// MARS dataset id, also part of the output file names.
    pub dataset: String,
    pub output_dir: PathBuf,
    pub first_year: i32,
    pub last_year: i32,
    /// Delete each retrieved file once its conversion succeeded.
    pub delete_intermediate: bool,
    pub metadata: OutputMetadata,
}

/// Run the job, returning the converted file paths in year order.
///
/// Output files are named
/// `{variable}_{frequency}_{dataset}_{experiment}_{year}.nc`, with the
/// frequency and experiment both derived from the variable's time kind.
pub fn download_and_convert_by_year(
    client: &dyn MarsClient,
    catalog: &Catalog,
    job: &BatchJob,
) -> error_stack::Result<Vec<PathBuf>, ConvertError> {
    let spec = catalog
        .lookup(&job.variable, job.time_kind)
        .map_err(Report::new)?;
    if spec.invariant {
        return Err(Report::new(ConvertError::Configuration(format!(
            "variable '{}' is time-invariant; convert it once instead of per year",
            job.variable
        ))));
    }
    if job.first_year > job.last_year {
        return Err(Report::new(ConvertError::Configuration(format!(
            "year range {}..{} is empty",
            job.first_year, job.last_year
        ))));
    }

    let mut written = Vec::with_capacity((job.last_year - job.first_year + 1) as usize);
    for year in job.first_year..=job.last_year {
        info!("Retrieving '{}' for {year}", job.variable);
        let intermediate = job
            .output_dir
            .join(format!("{}_{year}_raw.nc", spec.name));
        let request = MarsRequest::for_year(spec, &job.dataset, year, intermediate);
        let fetched = client.retrieve(&request).map_err(Report::new)?;

        let output = job.output_dir.join(format!(
            "{}_{}_{}_{}_{year}.nc",
            spec.name,
            spec.time_kind.frequency(),
            job.dataset,
            spec.time_kind,
        ));
        writer::convert_file(&fetched, &output, spec, &job.metadata, None)
            .attach_printable_lazy(|| format!("converting year {year}"))?;

        if job.delete_intermediate {
            std::fs::remove_file(&fetched)
                .change_context_lazy(|| ConvertError::Cleanup(fetched.clone()))?;
        }
        written.push(output);
    }
    info!("Converted {} year(s) of '{}'", written.len(), job.variable);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use netcdf::Extents;
    use tempfile::TempDir;

    use super::*;

    /// Stands in for the MARS network client: writes a synthetic one-run
    /// precipitation extract wherever the request's target points.
    struct SyntheticClient {
        requests: RefCell<Vec<MarsRequest>>,
        fail_on_year: Option<i32>,
    }

    impl SyntheticClient {
        fn new() -> Self {
            Self {
                requests: RefCell::new(Vec::new()),
                fail_on_year: None,
            }
        }
    }

    impl MarsClient for SyntheticClient {
        fn retrieve(&self, request: &MarsRequest) -> Result<PathBuf, ConvertError> {
            if let Some(year) = self.fail_on_year {
                if request.date.starts_with(&year.to_string()) {
                    return Err(ConvertError::Retrieval("synthetic outage".to_string()));
                }
            }
            self.requests.borrow_mut().push(request.clone());

            let mut nc = netcdf::create(&request.target).unwrap();
            nc.add_dimension("latitude", 2).unwrap();
            nc.add_dimension("longitude", 2).unwrap();
            nc.add_dimension("time", 4).unwrap();
            let mut lat = nc.add_variable::<f32>("latitude", &["latitude"]).unwrap();
            lat.put_values(&[45.0f32, 44.25], Extents::All).unwrap();
            let mut lon = nc.add_variable::<f32>("longitude", &["longitude"]).unwrap();
            lon.put_values(&[0.0f32, 0.75], Extents::All).unwrap();
            let mut time = nc.add_variable::<f64>("time", &["time"]).unwrap();
            time.put_values(&[3.0, 6.0, 9.0, 12.0], Extents::All).unwrap();
            time.put_attribute("units", "hours since 1990-01-01 00:00:00")
                .unwrap();
            let mut tp = nc
                .add_variable::<f64>("tp", &["time", "latitude", "longitude"])
                .unwrap();
            let values: Vec<f64> = (1..=4).flat_map(|s| vec![s as f64 * 0.001; 4]).collect();
            tp.put_values(&values, Extents::All).unwrap();
            tp.put_attribute("units", "m").unwrap();
            drop(nc);

            Ok(request.target.clone())
        }
    }

    fn pr_job(dir: &TempDir) -> BatchJob {
        BatchJob {
            variable: "pr".to_string(),
            time_kind: None,
            dataset: "era-interim".to_string(),
            output_dir: dir.path().to_owned(),
            first_year: 1990,
            last_year: 1991,
            delete_intermediate: true,
            metadata: OutputMetadata::default(),
        }
    }

    #[test]
    fn test_batch_converts_each_year_in_order() {
        let dir = TempDir::new().unwrap();
        let client = SyntheticClient::new();
        let catalog = Catalog::builtin().unwrap();

        let written =
            download_and_convert_by_year(&client, &catalog, &pr_job(&dir)).unwrap();

        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "pr_3hr_era-interim_forecast_1990.nc",
                "pr_3hr_era-interim_forecast_1991.nc",
            ]
        );
        for path in &written {
            assert!(path.exists());
        }

        // Intermediates deleted after successful conversion.
        for request in client.requests.borrow().iter() {
            assert!(!request.target.exists());
        }

        // Years requested in increasing order.
        let dates: Vec<String> = client
            .requests
            .borrow()
            .iter()
            .map(|r| r.date.clone())
            .collect();
        assert_eq!(
            dates,
            vec!["1990-01-01/to/1990-12-31", "1991-01-01/to/1991-12-31"]
        );
    }

    #[test]
    fn test_batch_halts_on_first_failure() {
        let dir = TempDir::new().unwrap();
        let mut client = SyntheticClient::new();
        client.fail_on_year = Some(1990);
        let catalog = Catalog::builtin().unwrap();

        let err = download_and_convert_by_year(&client, &catalog, &pr_job(&dir)).unwrap_err();
        assert!(matches!(err.current_context(), ConvertError::Retrieval(_)));
        // 1991 never ran.
        assert!(client.requests.borrow().is_empty());
    }

    #[test]
    fn test_batch_rejects_invariant_variables() {
        let dir = TempDir::new().unwrap();
        let client = SyntheticClient::new();
        let catalog = Catalog::builtin().unwrap();
        let mut job = pr_job(&dir);
        job.variable = "sftlf".to_string();

        let err = download_and_convert_by_year(&client, &catalog, &job).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ConvertError::Configuration(_)
        ));
    }

    #[test]
    fn test_batch_rejects_empty_year_range() {
        let dir = TempDir::new().unwrap();
        let client = SyntheticClient::new();
        let catalog = Catalog::builtin().unwrap();
        let mut job = pr_job(&dir);
        job.first_year = 1995;
        job.last_year = 1990;

        let err = download_and_convert_by_year(&client, &catalog, &job).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ConvertError::Configuration(_)
        ));
    }

    #[test]
    fn test_kept_intermediates_survive() {
        let dir = TempDir::new().unwrap();
        let client = SyntheticClient::new();
        let catalog = Catalog::builtin().unwrap();
        let mut job = pr_job(&dir);
        job.last_year = 1990;
        job.delete_intermediate = false;

        download_and_convert_by_year(&client, &catalog, &job).unwrap();
        for request in client.requests.borrow().iter() {
            assert!(request.target.exists());
        }
    }
}
