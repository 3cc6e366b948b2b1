//! Builds the CF time coordinate for the output file from a source time
//! axis and the catalog's cell-method hint.
//!
//! All output axes are expressed in [`TARGET_TIME_UNITS`] on the
//! [`TARGET_CALENDAR`] calendar. Values are re-based through the absolute
//! epoch datetime rather than rescaled, so sources with a different epoch
//! (e.g. "hours since 1979-01-01") convert correctly.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use itertools::Itertools;
use ndarray::{Array1, Array2};

use crate::error::ConvertError;

/// Unit string of every output time coordinate.
pub const TARGET_TIME_UNITS: &str = "hours since 1900-01-01 00:00:00";
/// Calendar of every output time coordinate.
pub const TARGET_CALENDAR: &str = "gregorian";

/// Tolerance, in hours, when checking step uniformity and whole-hour values.
const TOLERANCE_HOURS: f64 = 1e-6;

/// A derived output time coordinate.
///
/// The variant records how the coordinate must be typed in the file:
/// instantaneous axes are exact whole hours and are written as integers,
/// window-averaged axes sit on interval midpoints and need sub-hour
/// (floating point) resolution plus a bounds variable. Downstream tools
/// rely on this distinction, so it is part of the type rather than an
/// attribute of it.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeAxis {
    /// Whole hours since the target epoch, one per sample.
    Instant(Array1<i32>),
    /// Window midpoints plus a (time, 2) array of window edges, both in
    /// hours since the target epoch.
    Interval {
        midpoints: Array1<f64>,
        bounds: Array2<f64>,
    },
}

impl TimeAxis {
    pub fn len(&self) -> usize {
        match self {
            TimeAxis::Instant(hours) => hours.len(),
            TimeAxis::Interval { midpoints, .. } => midpoints.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_bounds(&self) -> bool {
        matches!(self, TimeAxis::Interval { .. })
    }
}

/// Derive the output time axis.
///
/// `values` are the source time coordinate values in `units` (a CF
/// "<unit> since <datetime>" string) on `calendar`. `cell_methods` is the
/// catalog's hint: empty or "time: point" keeps the converted values as
/// instantaneous samples; anything else treats each value as the *end* of
/// an averaging window one step wide, emitting midpoints and bounds.
pub fn build_time_axis(
    values: &[f64],
    units: &str,
    calendar: &str,
    cell_methods: Option<&str>,
) -> Result<TimeAxis, ConvertError> {
    check_calendar(calendar)?;
    let (unit, epoch) = parse_time_units(units)?;

    let epoch_offset_hours = (epoch - target_epoch()).num_seconds() as f64 / 3600.0;
    let hours: Vec<f64> = values
        .iter()
        .map(|&v| v * unit.in_hours() + epoch_offset_hours)
        .collect();

    // Uniformity is judged in hours so the tolerance means the same thing
    // whatever the source unit is.
    let step_hours = uniform_step(&hours)?;

    let instantaneous = matches!(cell_methods, None | Some("") | Some("time: point"));
    if instantaneous {
        let whole: Vec<i32> = hours
            .iter()
            .map(|&h| {
                if (h - h.round()).abs() > TOLERANCE_HOURS {
                    Err(ConvertError::UnsupportedFeature(format!(
                        "an instantaneous time axis with sub-hour values (got {h} hours)"
                    )))
                } else {
                    Ok(h.round() as i32)
                }
            })
            .collect::<Result<_, _>>()?;
        return Ok(TimeAxis::Instant(Array1::from_vec(whole)));
    }

    // Each converted value ends an averaging window one step wide.
    let step_hours = step_hours.ok_or_else(|| {
        ConvertError::IrregularTimeAxis(
            "at least two samples are needed to derive the averaging window width".to_string(),
        )
    })?;

    let midpoints: Array1<f64> = hours.iter().map(|&h| h - step_hours / 2.0).collect();
    let mut bounds = Array2::<f64>::zeros((hours.len(), 2));
    for (i, &h) in hours.iter().enumerate() {
        bounds[[i, 0]] = h - step_hours;
        bounds[[i, 1]] = h;
    }
    Ok(TimeAxis::Interval { midpoints, bounds })
}

/// Check that successive differences are all equal, returning the common
/// step. Values and step are in hours. `None` when there are fewer than
/// two values.
fn uniform_step(hours: &[f64]) -> Result<Option<f64>, ConvertError> {
    let mut steps = hours.iter().tuple_windows().map(|(a, b)| b - a);
    let first = match steps.next() {
        Some(s) => s,
        None => return Ok(None),
    };
    for (i, step) in steps.enumerate() {
        if (step - first).abs() > TOLERANCE_HOURS {
            return Err(ConvertError::IrregularTimeAxis(format!(
                "step between samples {} and {} is {step} hours, expected {first}",
                i + 1,
                i + 2
            )));
        }
    }
    Ok(Some(first))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn in_hours(&self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0 / 3600.0,
            TimeUnit::Minutes => 1.0 / 60.0,
            TimeUnit::Hours => 1.0,
            TimeUnit::Days => 24.0,
        }
    }
}

fn check_calendar(calendar: &str) -> Result<(), ConvertError> {
    match calendar.to_ascii_lowercase().as_str() {
        "gregorian" | "standard" | "proleptic_gregorian" => Ok(()),
        other => Err(ConvertError::UnsupportedFeature(format!(
            "the '{other}' calendar"
        ))),
    }
}

fn parse_time_units(units: &str) -> Result<(TimeUnit, NaiveDateTime), ConvertError> {
    let (unit_part, epoch_part) = units.split_once(" since ").ok_or_else(|| {
        ConvertError::Configuration(format!(
            "time units '{units}' are not of the form '<unit> since <datetime>'"
        ))
    })?;

    let unit = match unit_part.trim().to_ascii_lowercase().as_str() {
        "seconds" | "second" | "secs" | "sec" | "s" => TimeUnit::Seconds,
        "minutes" | "minute" | "mins" | "min" => TimeUnit::Minutes,
        "hours" | "hour" | "hrs" | "hr" | "h" => TimeUnit::Hours,
        "days" | "day" | "d" => TimeUnit::Days,
        other => {
            return Err(ConvertError::Configuration(format!(
                "unsupported time unit '{other}'"
            )))
        }
    };

    let epoch = parse_epoch(epoch_part)?;
    Ok((unit, epoch))
}

fn parse_epoch(s: &str) -> Result<NaiveDateTime, ConvertError> {
    let s = s.trim().trim_end_matches('Z').trim_end_matches(" UTC").trim();

    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d.and_time(NaiveTime::MIN));
    }
    Err(ConvertError::Configuration(format!(
        "could not interpret '{s}' as a reference datetime"
    )))
}

fn target_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .map(|d| d.and_time(NaiveTime::MIN))
        .expect("1900-01-01 is a valid date")
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    /// Hours from 1900-01-01 to 1979-01-01 (ERA-Interim's first year).
    const HOURS_1900_TO_1979: f64 = 692_496.0;

    #[test]
    fn test_mean_axis_midpoints_and_bounds() {
        let axis = build_time_axis(
            &[0.0, 6.0, 12.0, 18.0],
            TARGET_TIME_UNITS,
            "gregorian",
            Some("time: mean"),
        )
        .unwrap();

        match axis {
            TimeAxis::Interval { midpoints, bounds } => {
                let expected_mid = [-3.0, 3.0, 9.0, 15.0];
                for (got, want) in midpoints.iter().zip(expected_mid) {
                    assert_abs_diff_eq!(*got, want, epsilon = 1e-9);
                }
                let expected_bounds = [[-6.0, 0.0], [0.0, 6.0], [6.0, 12.0], [12.0, 18.0]];
                for (i, pair) in expected_bounds.iter().enumerate() {
                    assert_abs_diff_eq!(bounds[[i, 0]], pair[0], epsilon = 1e-9);
                    assert_abs_diff_eq!(bounds[[i, 1]], pair[1], epsilon = 1e-9);
                }
            }
            TimeAxis::Instant(_) => panic!("'time: mean' must produce a bounded axis"),
        }
    }

    #[test]
    fn test_point_axis_passes_values_through() {
        let axis = build_time_axis(
            &[0.0, 6.0, 12.0],
            TARGET_TIME_UNITS,
            "gregorian",
            Some("time: point"),
        )
        .unwrap();
        assert_eq!(axis, TimeAxis::Instant(Array1::from_vec(vec![0, 6, 12])));
        assert!(!axis.has_bounds());
    }

    #[test]
    fn test_missing_cell_methods_means_instantaneous() {
        let axis = build_time_axis(&[6.0], TARGET_TIME_UNITS, "gregorian", None).unwrap();
        assert_eq!(axis, TimeAxis::Instant(Array1::from_vec(vec![6])));
    }

    #[test]
    fn test_irregular_axis_rejected() {
        let err = build_time_axis(
            &[0.0, 6.0, 18.0],
            TARGET_TIME_UNITS,
            "gregorian",
            Some("time: mean"),
        )
        .unwrap_err();
        assert!(matches!(err, ConvertError::IrregularTimeAxis(_)));
    }

    #[test]
    fn test_single_sample_cannot_have_bounds() {
        let err = build_time_axis(&[3.0], TARGET_TIME_UNITS, "gregorian", Some("time: mean"))
            .unwrap_err();
        assert!(matches!(err, ConvertError::IrregularTimeAxis(_)));
    }

    #[test]
    fn test_epoch_rebasing() {
        // The epoch difference must be carried through, not just the unit.
        let axis = build_time_axis(
            &[0.0, 6.0],
            "hours since 1979-01-01 00:00:00",
            "gregorian",
            None,
        )
        .unwrap();
        let expected = Array1::from_vec(vec![
            HOURS_1900_TO_1979 as i32,
            HOURS_1900_TO_1979 as i32 + 6,
        ]);
        assert_eq!(axis, TimeAxis::Instant(expected));
    }

    #[test]
    fn test_uniformity_tolerance_is_in_hours() {
        // Half a millisecond of jitter on an hourly axis in seconds is far
        // below a micro-hour; it must not trip the uniformity check even
        // though 0.0005 would in raw source units.
        let axis = build_time_axis(
            &[0.0, 3600.0, 7200.0005],
            "seconds since 1900-01-01 00:00:00",
            "gregorian",
            None,
        )
        .unwrap();
        assert_eq!(axis, TimeAxis::Instant(Array1::from_vec(vec![0, 1, 2])));
    }

    #[test]
    fn test_day_units_converted() {
        let axis = build_time_axis(&[0.0, 1.0], "days since 1900-01-01", "standard", None).unwrap();
        assert_eq!(axis, TimeAxis::Instant(Array1::from_vec(vec![0, 24])));
    }

    #[test]
    fn test_unusual_calendar_rejected() {
        let err = build_time_axis(&[0.0, 6.0], TARGET_TIME_UNITS, "360_day", None).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_sub_hour_instantaneous_rejected() {
        let err = build_time_axis(
            &[0.0, 0.5, 1.0],
            TARGET_TIME_UNITS,
            "gregorian",
            Some("time: point"),
        )
        .unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_bad_unit_strings_rejected() {
        let err =
            build_time_axis(&[0.0], "fortnights since 1900-01-01", "gregorian", None).unwrap_err();
        assert!(matches!(err, ConvertError::Configuration(_)));

        let err = build_time_axis(&[0.0], "hours", "gregorian", None).unwrap_err();
        assert!(matches!(err, ConvertError::Configuration(_)));
    }
}
