use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Ownership value of a voxel that no supervoxel owns.
pub const UNASSIGNED: u32 = u32::MAX;

/// Scales grayscale differences (0-255) to the CIELab lightness range (0-100).
pub const COLOR_NORMALIZATION: f64 = 100.0 / 255.0;

/// Variant of the clustering, it only changes how the distance weights of a label adapt between
/// iterations.
///
/// The assignment and update steps are shared, the tag is resolved once per iteration.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SlicVariant {
    /// Fixed `m_s` and `m_c` given by the user.
    Slic,
    /// `m_s` adapts per label to the maximum observed spatial distance, `m_c` is fixed.
    Slico,
    /// Both `m_s` and `m_c` adapt per label to the observed maxima.
    Aslic,
}

impl SlicVariant {
    #[inline]
    pub fn adapts_spatial(self) -> bool {
        self != SlicVariant::Slic
    }

    #[inline]
    pub fn adapts_color(self) -> bool {
        self == SlicVariant::Aslic
    }
}

/// Parameters of one supervoxel computation.
///
/// These are stored next to the result so queries know how it was produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Supervoxel size (_m_s_) in spacing units (usually nm).
    ///
    /// It drives the seed grid step and the half side of the candidate region of every label.
    pub spatial_size: u8,
    /// Color weight (_m_c_). Together with `spatial_size` it gives the initial blending weight
    /// `(m_c / m_s)^2` of the spatial part of the distance.
    pub color_weight: u8,
    pub variant: SlicVariant,
    /// Upper bound of assign/update iterations.
    pub max_iterations: u32,
    /// Maximum center displacement (spacing units) for the run to count as converged.
    ///
    /// `0` disables the convergence test and all `max_iterations` are done.
    pub tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spatial_size: 10,
            color_weight: 20,
            variant: SlicVariant::Aslic,
            max_iterations: 10,
            tolerance: 0.0,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.spatial_size == 0 {
            return Err(Error::InvalidConfig(
                "spatial size must be larger than zero".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig(
                "at least one iteration is needed to assign voxels".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "tolerance must be a non-negative number, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }

    /// Tolerance compared against squared displacements, `None` when disabled.
    pub(crate) fn squared_tolerance(&self) -> Option<f64> {
        (self.tolerance > 0.0).then(|| self.tolerance * self.tolerance)
    }

    /// Initial spatial-part weight of every label.
    pub(crate) fn initial_norm_quotient(&self) -> f64 {
        let m_c = self.color_weight as f64;
        let m_s = self.spatial_size as f64;
        (m_c * m_c) / (m_s * m_s)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, SlicVariant};
    use approx::assert_relative_eq;

    #[test]
    fn config_validation() {
        assert!(Config::default().validate().is_ok());
        let config = Config {
            spatial_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            max_iterations: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            tolerance: f64::NAN,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            tolerance: -1.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tolerance_is_squared_once() {
        let mut config = Config::default();
        assert_eq!(config.squared_tolerance(), None);
        config.tolerance = 1.5;
        assert_relative_eq!(config.squared_tolerance().unwrap(), 2.25);
        assert_relative_eq!(config.initial_norm_quotient(), 4.0);
    }

    #[test]
    fn variant_adaptation() {
        assert!(!SlicVariant::Slic.adapts_spatial());
        assert!(!SlicVariant::Slic.adapts_color());
        assert!(SlicVariant::Slico.adapts_spatial());
        assert!(!SlicVariant::Slico.adapts_color());
        assert!(SlicVariant::Aslic.adapts_spatial());
        assert!(SlicVariant::Aslic.adapts_color());
    }
}
