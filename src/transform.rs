//! Turns a raw data array from a MARS extract into the values that belong
//! in the output file.
//!
//! The steps run in a fixed order, each on the output of the previous one:
//! de-accumulation, scale, offset, positivity clamp. Only the steps the
//! [`VariableSpec`] asks for are applied; with none of them set this is the
//! identity function.

use ndarray::{ArrayD, Axis};

use crate::catalog::{AccumulationMethod, VariableSpec};
use crate::error::ConvertError;

/// Number of lead-time steps in one forecast run. ERA-Interim sub-daily
/// forecasts carry accumulations at +3/+6/+9/+12 h since run start.
pub const FORECAST_RUN_STEPS: usize = 4;

/// Apply the spec's transformations to `data`, shaped [time, lat, lon]
/// (time may be absent for invariant fields, in which case only scaling,
/// offset, and clamping make sense).
///
/// Takes the array by value: de-accumulation rewrites it in place, and
/// callers must never see cumulative data half-differenced.
pub fn transform_field(
    data: ArrayD<f64>,
    spec: &VariableSpec,
) -> Result<ArrayD<f64>, ConvertError> {
    let mut data = data;

    if let Some(method) = spec.accumulation {
        data = deaccumulate(data, method)?;
    }
    if let Some(scale) = spec.scale_factor {
        data.mapv_inplace(|v| v * scale);
    }
    if let Some(offset) = spec.add_offset {
        data.mapv_inplace(|v| v + offset);
    }
    if spec.force_positive {
        // NaNs and fill values compare false here and pass through.
        data.mapv_inplace(|v| if v < 0.0 { 0.0 } else { v });
    }

    Ok(data)
}

/// Recover per-interval values from running totals.
///
/// The source holds cumulative sums restarted every [`FORECAST_RUN_STEPS`]
/// samples. Within each run the steps are differenced from their
/// predecessor in reverse order, so every subtraction sees the
/// predecessor's original cumulative value; the first step of a run is
/// already the first-interval accumulation and stays as-is.
fn deaccumulate(
    mut data: ArrayD<f64>,
    method: AccumulationMethod,
) -> Result<ArrayD<f64>, ConvertError> {
    match method {
        AccumulationMethod::Mean => (),
        AccumulationMethod::Min | AccumulationMethod::Max => {
            return Err(ConvertError::UnsupportedAccumulation(method));
        }
    }

    let nt = data.len_of(Axis(0));
    if nt % FORECAST_RUN_STEPS != 0 {
        return Err(ConvertError::UnsupportedFeature(format!(
            "de-accumulating a time series that is not a whole number of \
             {FORECAST_RUN_STEPS}-step forecast runs ({nt} samples)"
        )));
    }

    for run_start in (0..nt).step_by(FORECAST_RUN_STEPS) {
        for i in (run_start + 1..run_start + FORECAST_RUN_STEPS).rev() {
            let prev = data.index_axis(Axis(0), i - 1).to_owned();
            let mut cur = data.index_axis_mut(Axis(0), i);
            cur -= &prev;
        }
    }
    Ok(data)
}
