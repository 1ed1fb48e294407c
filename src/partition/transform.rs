//! Reversible split of a tilt stack into kept and quarantined frames.
//!
//! Epistemic foundation:
//! - K_i: depth(stack) == len(angles), checked before anything is selected
//! - K_i: The index map (quarantined slot → original ordinal) is the only
//!   state needed to invert a split
//! - K_i: recombine(split(S, A)) == (S, A), including the empty selections
//! - B_i: Inconsistent partitions are rejected, never trimmed to fit

use super::stack::TiltStack;
use crate::models::{Result, TiltflowError};
use serde::{Deserialize, Serialize};

/// Rule deciding which frames are outliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ThresholdRule {
    /// Quarantine frames whose mean lies outside μ ± factor·σ of the whole stack
    Sigma {
        #[serde(default = "default_factor")]
        factor: f64,
    },

    /// Quarantine frames whose mean lies outside the [low, high] percentiles
    /// of all stack intensities (linear interpolation)
    Percentile { low: f64, high: f64 },
}

fn default_factor() -> f64 {
    2.0
}

impl Default for ThresholdRule {
    fn default() -> Self {
        Self::Sigma {
            factor: default_factor(),
        }
    }
}

impl ThresholdRule {
    pub fn sigma(factor: f64) -> Self {
        Self::Sigma { factor }
    }

    /// Check the rule's parameters.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            Self::Sigma { factor } if !factor.is_finite() || factor < 0.0 => Err(format!(
                "partition factor must be finite and non-negative, got {factor}"
            )),
            Self::Percentile { low, high }
                if !(0.0..=100.0).contains(&low)
                    || !(0.0..=100.0).contains(&high)
                    || low > high =>
            {
                Err(format!(
                    "percentiles must satisfy 0 <= low <= high <= 100, got {low}..{high}"
                ))
            }
            _ => Ok(()),
        }
    }

    /// Acceptance interval for frame means, or `None` for an empty stack.
    pub fn bounds(&self, stack: &TiltStack, stats: &StackStatistics) -> Option<(f64, f64)> {
        if stats.count == 0 {
            return None;
        }
        match *self {
            Self::Sigma { factor } => Some((
                stats.mean - factor * stats.std_dev,
                stats.mean + factor * stats.std_dev,
            )),
            Self::Percentile { low, high } => {
                let mut values: Vec<f64> = stack.values().collect();
                values.sort_by(f64::total_cmp);
                Some((percentile(&values, low), percentile(&values, high)))
            }
        }
    }
}

/// Intensity statistics of a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct StackStatistics {
    /// Number of samples
    pub count: usize,
    /// Global mean μ
    pub mean: f64,
    /// Global population standard deviation σ
    pub std_dev: f64,
    /// Mean of each frame, in stack order
    pub frame_means: Vec<f64>,
}

impl StackStatistics {
    pub fn compute(stack: &TiltStack) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut frame_means = Vec::with_capacity(stack.depth());

        for z in 0..stack.depth() {
            let (n, s) = stack
                .frame_values(z)
                .fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
            frame_means.push(if n == 0 { 0.0 } else { s / n as f64 });
            count += n;
            sum += s;
        }

        let mean = if count == 0 { 0.0 } else { sum / count as f64 };
        let std_dev = if count == 0 {
            0.0
        } else {
            (stack.values().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64).sqrt()
        };

        Self {
            count,
            mean,
            std_dev,
            frame_means,
        }
    }
}

/// Result of splitting a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Frames that passed the rule, in original relative order
    pub kept: TiltStack,
    pub kept_angles: Vec<f64>,
    /// Outlier frames, in original relative order
    pub quarantined: TiltStack,
    pub quarantined_angles: Vec<f64>,
    /// Original ordinal of each quarantined frame, ascending
    pub index_map: Vec<usize>,
}

impl Partition {
    /// Depth of the stack this partition was split from.
    pub fn original_depth(&self) -> usize {
        self.kept.depth() + self.quarantined.depth()
    }
}

/// Ordinals of frames the rule marks as outliers.
///
/// Comparisons are strict: a frame mean exactly on a bound is kept.
pub fn select_quarantine(stack: &TiltStack, rule: &ThresholdRule) -> Vec<usize> {
    let stats = StackStatistics::compute(stack);
    let Some((low, high)) = rule.bounds(stack, &stats) else {
        return Vec::new();
    };
    stats
        .frame_means
        .iter()
        .enumerate()
        .filter(|(_, m)| **m < low || **m > high)
        .map(|(i, _)| i)
        .collect()
}

/// Split a stack under a thresholding rule.
pub fn split(stack: &TiltStack, angles: &[f64], rule: &ThresholdRule) -> Result<Partition> {
    check_depth(stack, angles)?;
    let ordinals = select_quarantine(stack, rule);
    split_at(stack, angles, &ordinals)
}

/// Split a stack at explicit ordinals (e.g. from a saved plan).
pub fn split_at(stack: &TiltStack, angles: &[f64], ordinals: &[usize]) -> Result<Partition> {
    check_depth(stack, angles)?;
    check_index_map(ordinals, stack.depth())?;

    let mut kept = Vec::with_capacity(stack.depth() - ordinals.len());
    let mut kept_angles = Vec::with_capacity(kept.capacity());
    let mut quarantined = Vec::with_capacity(ordinals.len());
    let mut quarantined_angles = Vec::with_capacity(ordinals.len());

    let mut next = ordinals.iter().peekable();
    for (i, (frame, &angle)) in stack.frames().iter().zip(angles).enumerate() {
        if next.peek() == Some(&&i) {
            next.next();
            quarantined.push(frame.clone());
            quarantined_angles.push(angle);
        } else {
            kept.push(frame.clone());
            kept_angles.push(angle);
        }
    }

    Ok(Partition {
        kept: stack.with_frames(kept),
        kept_angles,
        quarantined: stack.with_frames(quarantined),
        quarantined_angles,
        index_map: ordinals.to_vec(),
    })
}

/// Interleave quarantined frames back into their original ordinals.
pub fn recombine(partition: &Partition) -> Result<(TiltStack, Vec<f64>)> {
    let Partition {
        kept,
        kept_angles,
        quarantined,
        quarantined_angles,
        index_map,
    } = partition;

    check_depth(kept, kept_angles)?;
    if quarantined.depth() != index_map.len() || quarantined_angles.len() != index_map.len() {
        return Err(TiltflowError::Consistency(format!(
            "Quarantine has {} frames and {} angles but {} index entries",
            quarantined.depth(),
            quarantined_angles.len(),
            index_map.len()
        )));
    }
    if !kept.same_geometry(quarantined) {
        return Err(TiltflowError::Consistency(format!(
            "Kept frames are {}x{} {:?}, quarantined frames are {}x{} {:?}",
            kept.nx(),
            kept.ny(),
            kept.mode(),
            quarantined.nx(),
            quarantined.ny(),
            quarantined.mode()
        )));
    }
    let depth = partition.original_depth();
    check_index_map(index_map, depth)?;

    let mut frames = Vec::with_capacity(depth);
    let mut angles = Vec::with_capacity(depth);
    let mut kept_iter = kept.frames().iter().zip(kept_angles);
    let mut quarantined_iter = quarantined.frames().iter().zip(quarantined_angles);
    let mut next = index_map.iter().peekable();

    for i in 0..depth {
        let source = if next.peek() == Some(&&i) {
            next.next();
            quarantined_iter.next()
        } else {
            kept_iter.next()
        };
        let Some((frame, &angle)) = source else {
            return Err(TiltflowError::Internal(format!(
                "Ran out of frames at ordinal {i} of {depth}"
            )));
        };
        frames.push(frame.clone());
        angles.push(angle);
    }

    Ok((kept.with_frames(frames), angles))
}

fn check_depth(stack: &TiltStack, angles: &[f64]) -> Result<()> {
    if stack.depth() != angles.len() {
        return Err(TiltflowError::Consistency(format!(
            "Stack has {} frames but angle list has {} entries",
            stack.depth(),
            angles.len()
        )));
    }
    Ok(())
}

fn check_index_map(index_map: &[usize], depth: usize) -> Result<()> {
    if let Some(&bad) = index_map.iter().find(|&&i| i >= depth) {
        return Err(TiltflowError::Consistency(format!(
            "Quarantined ordinal {bad} is out of range for depth {depth}"
        )));
    }
    if index_map.windows(2).any(|w| w[0] >= w[1]) {
        return Err(TiltflowError::Consistency(
            "Quarantined ordinals must be strictly ascending".into(),
        ));
    }
    Ok(())
}

/// Percentile of sorted values with linear interpolation between ranks.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_with_means(means: &[f32]) -> TiltStack {
        let frames: Vec<Vec<f32>> = means.iter().map(|&m| vec![m; 4]).collect();
        TiltStack::from_f32_frames(2, 2, &frames).unwrap()
    }

    fn even_angles(n: usize) -> Vec<f64> {
        if n == 1 {
            return vec![0.0];
        }
        (0..n)
            .map(|i| -60.0 + 120.0 * i as f64 / (n - 1) as f64)
            .collect()
    }

    fn outlier_stack() -> (TiltStack, Vec<f64>) {
        let mut means = vec![200.0f32; 10];
        means[0] = 1.0;
        means[9] = 1.0;
        (stack_with_means(&means), even_angles(10))
    }

    #[test]
    fn test_threshold_selects_extreme_frames() {
        // μ = 160.2, σ = 79.6: outer frames sit 2σ below, the rest 0.5σ above.
        let (stack, angles) = outlier_stack();
        let partition = split(&stack, &angles, &ThresholdRule::sigma(1.5)).unwrap();

        assert_eq!(partition.index_map, vec![0, 9]);
        assert_eq!(partition.quarantined_angles, vec![-60.0, 60.0]);
        assert_eq!(partition.kept.depth(), 8);
        assert_eq!(partition.kept_angles.len(), 8);
    }

    #[test]
    fn test_wide_factor_keeps_everything() {
        let (stack, angles) = outlier_stack();
        let partition = split(&stack, &angles, &ThresholdRule::sigma(3.0)).unwrap();
        assert!(partition.index_map.is_empty());
        assert_eq!(partition.kept, stack);
    }

    #[test]
    fn test_percentile_rule() {
        let (stack, _) = outlier_stack();
        let rule = ThresholdRule::Percentile {
            low: 25.0,
            high: 100.0,
        };
        assert_eq!(select_quarantine(&stack, &rule), vec![0, 9]);
    }

    #[test]
    fn test_round_trip_is_exact() {
        let (stack, angles) = outlier_stack();
        for factor in [0.0, 0.4, 1.5, 2.5] {
            let partition = split(&stack, &angles, &ThresholdRule::sigma(factor)).unwrap();
            let (restored, restored_angles) = recombine(&partition).unwrap();
            assert_eq!(restored, stack, "factor {factor}");
            assert_eq!(restored_angles, angles, "factor {factor}");
        }
    }

    #[test]
    fn test_round_trip_all_quarantined() {
        let (stack, angles) = outlier_stack();
        let all: Vec<usize> = (0..10).collect();
        let partition = split_at(&stack, &angles, &all).unwrap();
        assert_eq!(partition.kept.depth(), 0);

        let (restored, restored_angles) = recombine(&partition).unwrap();
        assert_eq!(restored, stack);
        assert_eq!(restored_angles, angles);
    }

    #[test]
    fn test_round_trip_empty_stack() {
        let stack = stack_with_means(&[]);
        let partition = split(&stack, &[], &ThresholdRule::default()).unwrap();
        let (restored, angles) = recombine(&partition).unwrap();
        assert_eq!(restored, stack);
        assert!(angles.is_empty());
    }

    #[test]
    fn test_depth_mismatch_rejected() {
        let stack = stack_with_means(&[1.0; 10]);
        let err = split(&stack, &even_angles(8), &ThresholdRule::default()).unwrap_err();
        assert!(matches!(err, TiltflowError::Consistency(_)));
    }

    #[test]
    fn test_bad_index_map_rejected() {
        let (stack, angles) = outlier_stack();
        let mut partition = split(&stack, &angles, &ThresholdRule::sigma(1.5)).unwrap();
        partition.index_map = vec![9, 0];
        assert!(matches!(
            recombine(&partition),
            Err(TiltflowError::Consistency(_))
        ));

        partition.index_map = vec![0];
        assert!(matches!(
            recombine(&partition),
            Err(TiltflowError::Consistency(_))
        ));

        assert!(matches!(
            split_at(&stack, &angles, &[10]),
            Err(TiltflowError::Consistency(_))
        ));
    }

    #[test]
    fn test_rule_validation() {
        assert!(ThresholdRule::sigma(0.0).validate().is_ok());
        assert!(ThresholdRule::sigma(-1.0).validate().is_err());
        assert!(ThresholdRule::sigma(f64::NAN).validate().is_err());
        assert!(ThresholdRule::Percentile {
            low: 90.0,
            high: 10.0
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_rule_serde_shape() {
        let rule: ThresholdRule = toml::from_str("kind = \"sigma\"").unwrap();
        assert_eq!(rule, ThresholdRule::sigma(2.0));
        let rule: ThresholdRule =
            toml::from_str("kind = \"percentile\"\nlow = 1.0\nhigh = 99.0").unwrap();
        assert!(matches!(rule, ThresholdRule::Percentile { .. }));
    }
}
