//! Time-of-flight to distance conversion and display range configuration.

use serde::{Deserialize, Serialize};

/// Speed of sound in air at roughly 20 °C, in millimetres per second.
pub const SPEED_OF_SOUND_MM_PER_S: f32 = 343_000.0;

/// Divisor turning `speed * tof_us` into a one-way distance:
/// 2 for the round trip, 1_000_000 for microseconds to seconds.
pub const ROUND_TRIP_US_DIVISOR: f32 = 2_000_000.0;

/// Default upper bound of the distance axis (mm)
pub const DEFAULT_X_MAX: f32 = 3000.0;

/// Default upper bound of the amplitude axis (ADC counts)
pub const DEFAULT_Y_MAX: f32 = 700.0;

/// Convert an echo's round-trip time of flight to the reflector distance.
///
/// Total over all inputs: negative or huge values pass straight through,
/// bounding them is up to whoever draws the points.
///
/// ```
/// use ddiscan_core::range::tof_to_distance_mm;
/// assert_eq!(tof_to_distance_mm(1000.0), 171.5);
/// ```
#[inline]
pub fn tof_to_distance_mm(tof_us: f32) -> f32 {
    SPEED_OF_SOUND_MM_PER_S * tof_us / ROUND_TRIP_US_DIVISOR
}

/// Axis bounds used by the renderer.
///
/// Only ever replaced wholesale through [`RangeConfig::set_range`]; values
/// are taken as given, including zero, negative or inverted bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeConfig {
    /// Distance upper bound in millimetres
    pub x_max: f32,
    /// Amplitude upper bound in ADC counts
    pub y_max: f32,
}

impl Default for RangeConfig {
    fn default() -> Self {
        RangeConfig {
            x_max: DEFAULT_X_MAX,
            y_max: DEFAULT_Y_MAX,
        }
    }
}

impl RangeConfig {
    pub fn new(x_max: f32, y_max: f32) -> Self {
        RangeConfig { x_max, y_max }
    }

    /// Overwrite both bounds. No validation.
    pub fn set_range(&mut self, x_max: f32, y_max: f32) {
        self.x_max = x_max;
        self.y_max = y_max;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_millisecond_is_171_5_mm() {
        assert_eq!(tof_to_distance_mm(1000.0), 171.5);
    }

    #[test]
    fn test_two_milliseconds_is_343_mm() {
        assert_eq!(tof_to_distance_mm(2000.0), 343.0);
    }

    #[test]
    fn test_no_clamping() {
        assert_eq!(tof_to_distance_mm(0.0), 0.0);
        assert_eq!(tof_to_distance_mm(-1000.0), -171.5);
        // Far beyond the default x_max of 3000 mm
        assert!(tof_to_distance_mm(100_000.0) > DEFAULT_X_MAX);
    }

    #[test]
    fn test_set_range_accepts_anything() {
        let mut range = RangeConfig::default();
        assert_eq!(range, RangeConfig::new(3000.0, 700.0));

        range.set_range(-5.0, 0.0);
        assert_eq!(range.x_max, -5.0);
        assert_eq!(range.y_max, 0.0);
    }

    #[test]
    fn test_range_json_is_camel_case() {
        let json = serde_json::to_string(&RangeConfig::new(1500.0, 512.0)).unwrap();
        assert_eq!(json, r#"{"xMax":1500.0,"yMax":512.0}"#);

        let back: RangeConfig = serde_json::from_str(r#"{"xMax":10,"yMax":20}"#).unwrap();
        assert_eq!(back, RangeConfig::new(10.0, 20.0));
    }
}
