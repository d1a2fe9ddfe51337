//! Weighted picker (C2): named channels drawing one outcome per request according
//! to integer weights, expanded at compile time into a flat outcome array.

use std::collections::HashMap;

use rand::Rng;
use thiserror::Error;

use crate::wire::{Weight, WeightFactor};

#[derive(Debug, Error)]
pub enum WeightCompileError {
    #[error("weight channel {0:?} has a total weight of zero")]
    ZeroTotal(String),
}

/// One named channel: the raw `outcome -> weight` map plus its expansion.
#[derive(Debug, Clone)]
pub struct WeightChannel {
    factor: WeightFactor,
    outcomes: Vec<String>,
}

impl WeightChannel {
    pub fn compile(name: &str, factor: WeightFactor) -> Result<Self, WeightCompileError> {
        let outcomes = expand(&factor);
        if outcomes.is_empty() {
            return Err(WeightCompileError::ZeroTotal(name.to_string()));
        }
        Ok(Self { factor, outcomes })
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Draw one outcome, uniformly over the expanded array.
    pub fn dice(&self) -> &str {
        let idx = rand::thread_rng().gen_range(0..self.outcomes.len());
        &self.outcomes[idx]
    }

    /// Deep, per-outcome merge: entries in `patch` overwrite or insert into this
    /// channel's factor map, entries not named in `patch` are untouched, then the
    /// channel is re-expanded.
    pub fn patch(&mut self, patch: WeightFactor) {
        for (outcome, weight) in patch {
            self.factor.insert(outcome, weight);
        }
        self.outcomes = expand(&self.factor);
    }

    pub fn raw(&self) -> &WeightFactor {
        &self.factor
    }
}

fn expand(factor: &WeightFactor) -> Vec<String> {
    let mut outcomes = Vec::with_capacity(factor.values().map(|w| *w as usize).sum());
    for (outcome, weight) in factor {
        for _ in 0..*weight {
            outcomes.push(outcome.clone());
        }
    }
    outcomes
}

/// All of a rule's weight channels, keyed by channel name.
#[derive(Debug, Clone, Default)]
pub struct WeightPicker {
    channels: HashMap<String, WeightChannel>,
}

impl WeightPicker {
    pub fn compile(weight: Option<&Weight>) -> Result<Self, WeightCompileError> {
        let mut channels = HashMap::new();
        if let Some(weight) = weight {
            for (name, factor) in weight {
                channels.insert(name.clone(), WeightChannel::compile(name, factor.clone())?);
            }
        }
        Ok(Self { channels })
    }

    /// One independent draw per channel.
    pub fn dice_all(&self) -> HashMap<String, String> {
        self.channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.dice().to_string()))
            .collect()
    }

    pub fn channel(&self, name: &str) -> Option<&WeightChannel> {
        self.channels.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Apply an admin PATCH: per-channel, merge deeply into an existing channel or
    /// create a new one outright if the channel didn't exist before.
    pub fn patch(&mut self, patch: &Weight) -> Result<(), WeightCompileError> {
        for (name, factor) in patch {
            match self.channels.get_mut(name) {
                Some(channel) => channel.patch(factor.clone()),
                None => {
                    self.channels
                        .insert(name.clone(), WeightChannel::compile(name, factor.clone())?);
                }
            }
        }
        Ok(())
    }

    pub fn wrap(&self) -> Weight {
        self.channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.raw().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factor(pairs: &[(&str, u64)]) -> WeightFactor {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn zero_total_channel_is_rejected() {
        let err = WeightChannel::compile("outcome", factor(&[("success", 0)]));
        assert!(matches!(err, Err(WeightCompileError::ZeroTotal(_))));
    }

    #[test]
    fn expansion_length_equals_sum_of_weights() {
        let channel = WeightChannel::compile("outcome", factor(&[("success", 3), ("failure", 1)]))
            .unwrap();
        assert_eq!(channel.total(), 4);
    }

    #[test]
    fn draw_converges_to_weight_ratio() {
        let channel = WeightChannel::compile("outcome", factor(&[("success", 3), ("failure", 1)]))
            .unwrap();
        let mut success = 0u32;
        let trials = 10_000;
        for _ in 0..trials {
            if channel.dice() == "success" {
                success += 1;
            }
        }
        let ratio = success as f64 / trials as f64;
        assert!((ratio - 0.75).abs() < 0.03, "ratio was {ratio}");
    }

    #[test]
    fn patch_merges_per_outcome_and_leaves_others_untouched() {
        let mut channel =
            WeightChannel::compile("outcome", factor(&[("success", 3), ("failure", 1)])).unwrap();
        channel.patch(factor(&[("failure", 2)]));
        assert_eq!(channel.raw().get("success"), Some(&3));
        assert_eq!(channel.raw().get("failure"), Some(&2));
        assert_eq!(channel.total(), 5);
    }

    #[test]
    fn picker_patch_creates_new_channel_outright() {
        let mut picker = WeightPicker::default();
        let mut patch_map = Weight::new();
        patch_map.insert("status".to_string(), factor(&[("ok", 1)]));
        picker.patch(&patch_map).unwrap();
        assert!(picker.channel("status").is_some());
    }
}
