//! RMS level in dBFS for the peak meter.

use async_trait::async_trait;

use super::meter::RmsRoutine;

/// Lowest level the meter displays.
pub const METER_FLOOR_DB: f32 = -100.0;

/// Highest level the meter displays.
pub const METER_CEIL_DB: f32 = 10.0;

/// Root-mean-square of a sample window, linear scale.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// RMS converted to dBFS and clamped to the meter range.
pub fn rms_dbfs(samples: &[f32]) -> f32 {
    let level = rms(samples);
    if level <= 0.0 || !level.is_finite() {
        return METER_FLOOR_DB;
    }
    (20.0 * level.log10()).clamp(METER_FLOOR_DB, METER_CEIL_DB)
}

/// In-process RMS routine used when no remote meter is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DbfsRms;

#[async_trait]
impl RmsRoutine for DbfsRms {
    async fn compute_rms(&self, samples: &[f32]) -> anyhow::Result<f32> {
        Ok(rms_dbfs(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_floor() {
        assert_eq!(rms_dbfs(&[0.0; 256]), METER_FLOOR_DB);
        assert_eq!(rms_dbfs(&[]), METER_FLOOR_DB);
    }

    #[test]
    fn test_full_scale_square_is_zero_db() {
        let square: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!(rms_dbfs(&square).abs() < 1e-4);
    }

    #[test]
    fn test_sine_is_about_minus_three_db() {
        let sine: Vec<f32> = (0..4800)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
            .collect();
        let db = rms_dbfs(&sine);
        assert!((db + 3.01).abs() < 0.1, "got {db}");
    }

    #[test]
    fn test_clamped_to_ceiling() {
        assert_eq!(rms_dbfs(&[100.0; 16]), METER_CEIL_DB);
    }
}
