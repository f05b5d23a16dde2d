//! Shared numeric constants for the separation engine.
//!
//! `UNSEEN` is the HEALPix "no data" marker; it only crosses the public map
//! boundary. Internally validity travels as explicit masks.

pub const PI: f64 = std::f64::consts::PI;
pub const FOUR_PI: f64 = 4.0 * PI;

/// Reserved invalid-value marker shared with HEALPix map files.
pub const UNSEEN: f64 = -1.6375e30;

pub const ARCMIN_PER_RADIAN: f64 = 180.0 * 60.0 / PI;

/// Planck over Boltzmann constant, in K / GHz.
pub const H_OVER_K_GHZ: f64 = 0.047_992_430_733_662_14;

/// Exact comparison; values merely close to the marker are valid data.
pub fn is_unseen(value: f64) -> bool {
    value == UNSEEN
}

#[cfg(test)]
mod tests {
    use super::{ARCMIN_PER_RADIAN, FOUR_PI, PI, UNSEEN, is_unseen};

    #[test]
    fn constants_match_expected_relationships() {
        assert!((FOUR_PI - 4.0 * PI).abs() <= 1.0e-15);
        assert!((ARCMIN_PER_RADIAN * PI / 180.0 - 60.0).abs() <= 1.0e-12);
    }

    #[test]
    fn unseen_predicate_accepts_marker_only() {
        assert!(is_unseen(UNSEEN));
        assert!(!is_unseen(UNSEEN * (1.0 + 1.0e-7)));
        assert!(!is_unseen(0.0));
        assert!(!is_unseen(-1.0e30));
        assert!(!is_unseen(f64::NAN));
    }
}
