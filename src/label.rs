use crate::arrays::Region;
use crate::common::{Config, SlicVariant};

/// Supervoxel descriptor.
///
/// `center` and `color` are updated by `slic::update()`, the weights by
/// `Label::adapt_weights()` at the end of every update step.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    /// Voxel index of the center, always inside the volume.
    pub center: [usize; 3],
    /// Average intensity of the owned voxels.
    pub color: u8,
    /// Position in the label sequence, stable for the whole run.
    pub index: u32,
    /// Spatial scale (_m_s_), adaptive for SLICO and ASLIC.
    pub m_s: f64,
    /// Color scale (_m_c_), adaptive for ASLIC.
    pub m_c: f64,
    /// Precomputed `(m_c / m_s)^2`, weight of the spatial part of the distance.
    pub norm_quotient: f64,
}

/// Squared distance maxima seen by a label during one assignment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObservedMaxima {
    pub spatial: f64,
    pub color: f64,
}

impl ObservedMaxima {
    #[inline(always)]
    pub fn observe(&mut self, spatial: f64, color: f64) {
        if spatial > self.spatial {
            self.spatial = spatial;
        }
        if color > self.color {
            self.color = color;
        }
    }
}

impl Label {
    pub fn new(index: u32, center: [usize; 3], color: u8, config: &Config) -> Self {
        Self {
            center,
            color,
            index,
            m_s: config.spatial_size as f64,
            m_c: config.color_weight as f64,
            norm_quotient: config.initial_norm_quotient(),
        }
    }

    /// Candidate region: `half` voxels around the center on every axis, clamped to `dims`.
    #[inline(always)]
    pub(crate) fn candidate_region(&self, half: [usize; 3], dims: [usize; 3]) -> Region {
        Region::around(self.center, half, dims)
    }

    /// Replaces the adaptive scales by the roots of this iteration's observed maxima.
    ///
    /// A maximum of zero (no voxel claimed, or a flat label) keeps the previous scale.
    pub fn adapt_weights(&mut self, variant: SlicVariant, observed: ObservedMaxima) {
        if variant.adapts_spatial() && observed.spatial > 0.0 {
            self.m_s = observed.spatial.sqrt();
        }
        if variant.adapts_color() && observed.color > 0.0 {
            self.m_c = observed.color.sqrt();
        }
        if variant.adapts_spatial() {
            let m_s = self.m_s.max(1.0);
            self.norm_quotient = (self.m_c * self.m_c) / (m_s * m_s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Label, ObservedMaxima};
    use crate::common::{Config, SlicVariant};
    use approx::assert_relative_eq;

    fn label() -> Label {
        let config = Config {
            spatial_size: 4,
            color_weight: 8,
            ..Config::default()
        };
        Label::new(3, [5, 5, 5], 100, &config)
    }

    #[test]
    fn initial_weights() {
        let label = label();
        assert_eq!(label.index, 3);
        assert_relative_eq!(label.m_s, 4.0);
        assert_relative_eq!(label.m_c, 8.0);
        assert_relative_eq!(label.norm_quotient, 4.0);
    }

    #[test]
    fn slic_never_adapts() {
        let mut label = label();
        label.adapt_weights(
            SlicVariant::Slic,
            ObservedMaxima {
                spatial: 100.0,
                color: 400.0,
            },
        );
        assert_eq!(label, self::label());
    }

    #[test]
    fn slico_adapts_spatial_only() {
        let mut label = label();
        label.adapt_weights(
            SlicVariant::Slico,
            ObservedMaxima {
                spatial: 16.0,
                color: 400.0,
            },
        );
        assert_relative_eq!(label.m_s, 4.0);
        assert_relative_eq!(label.m_c, 8.0);
        label.adapt_weights(
            SlicVariant::Slico,
            ObservedMaxima {
                spatial: 64.0,
                color: 400.0,
            },
        );
        assert_relative_eq!(label.m_s, 8.0);
        assert_relative_eq!(label.norm_quotient, 1.0);
    }

    #[test]
    fn aslic_adapts_both() {
        let mut label = label();
        label.adapt_weights(
            SlicVariant::Aslic,
            ObservedMaxima {
                spatial: 0.25,
                color: 9.0,
            },
        );
        assert_relative_eq!(label.m_s, 0.5);
        assert_relative_eq!(label.m_c, 3.0);
        // spatial scale is clamped to one voxel in the quotient
        assert_relative_eq!(label.norm_quotient, 9.0);
        // nothing observed keeps the scales
        label.adapt_weights(SlicVariant::Aslic, ObservedMaxima::default());
        assert_relative_eq!(label.m_c, 3.0);
    }

    #[test]
    fn observed_maxima() {
        let mut maxima = ObservedMaxima::default();
        maxima.observe(3.0, 1.0);
        maxima.observe(2.0, 5.0);
        assert_eq!(
            maxima,
            ObservedMaxima {
                spatial: 3.0,
                color: 5.0
            }
        );
    }
}
