//! Out-of-distribution checks for inference vectors.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::profile::{lag_feature_name, DistributionProfile};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionVerdict {
    pub position: usize,
    pub feature: String,
    pub value: f64,
    pub z_score: f64,
    pub below_min: bool,
    pub above_max: bool,
    pub z_exceeded: bool,
}

impl PositionVerdict {
    pub fn drifted(&self) -> bool {
        self.below_min || self.above_max || self.z_exceeded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAssessment {
    pub profile_loaded: bool,
    pub z_cutoff: f64,
    /// Positions whose feature the profile does not describe are absent.
    pub verdicts: Vec<PositionVerdict>,
}

impl DriftAssessment {
    pub fn drift(&self) -> bool {
        self.verdicts.iter().any(PositionVerdict::drifted)
    }
}

/// Compares position `i` of `vector` against the profile's `lag_{i+1}`.
pub fn assess_drift(
    vector: &[f64],
    profile: Option<&DistributionProfile>,
    z_cutoff: f64,
) -> DriftAssessment {
    let Some(profile) = profile else {
        return DriftAssessment {
            profile_loaded: false,
            z_cutoff,
            verdicts: Vec::new(),
        };
    };

    let verdicts: Vec<PositionVerdict> = vector
        .iter()
        .enumerate()
        .filter_map(|(position, value)| {
            let feature = lag_feature_name(position + 1);
            let stats = profile.feature(&feature)?;
            let z_score = if stats.std == 0.0 {
                0.0
            } else {
                (value - stats.mean).abs() / stats.std
            };
            Some(PositionVerdict {
                position,
                feature,
                value: *value,
                z_score,
                below_min: *value < stats.min,
                above_max: *value > stats.max,
                z_exceeded: z_score > z_cutoff,
            })
        })
        .collect();

    let assessment = DriftAssessment {
        profile_loaded: true,
        z_cutoff,
        verdicts,
    };

    if assessment.drift() {
        let drifted: Vec<&str> = assessment
            .verdicts
            .iter()
            .filter(|verdict| verdict.drifted())
            .map(|verdict| verdict.feature.as_str())
            .collect();
        warn!(
            component = "drift",
            event = "drift.detected",
            features = ?drifted,
            z_cutoff
        );
    }

    assessment
}

pub fn is_drift(vector: &[f64], profile: Option<&DistributionProfile>, z_cutoff: f64) -> bool {
    assess_drift(vector, profile, z_cutoff).drift()
}
