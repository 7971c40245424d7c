use crate::error::CalibrationError;

/// Maps a raw probe sample onto 0..=100 % using the dry (0 %) and wet (100 %)
/// endpoints. Either endpoint may be numerically larger.
pub fn moisture_percent(raw: i32, dry: i32, wet: i32) -> Result<f32, CalibrationError> {
    if dry == wet {
        return Err(CalibrationError::Degenerate { reading: dry });
    }

    let span = wet as f32 - dry as f32;
    let percent = (raw as f32 - dry as f32) * 100.0 / span;
    Ok(if percent <= 0.0 { 0.0 } else { percent.min(100.0) })
}
