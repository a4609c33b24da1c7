//! Environment effects
//!
//! Effects applied at the start of every tick, before any script runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::datamodel::DEFAULT_PROFILE;
use crate::substation::Substation;

/// Something that changes the simulated plant independent of scripts
pub trait Environment: Send {
    fn name(&self) -> &str;

    fn apply(&mut self, substation: &mut Substation, now_ms: u64);
}

/// An input register perturbed around a base value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseTarget {
    #[serde(default = "default_profile")]
    pub profile: String,
    pub address: u16,
    pub base: f64,
    pub amplitude: f64,
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

/// Uniform noise on analog inputs, reproducible from a seed
pub struct NoiseEnvironment {
    rng: StdRng,
    targets: Vec<NoiseTarget>,
}

impl NoiseEnvironment {
    pub fn new(targets: Vec<NoiseTarget>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, targets }
    }

    pub fn targets(&self) -> &[NoiseTarget] {
        &self.targets
    }
}

impl Environment for NoiseEnvironment {
    fn name(&self) -> &str {
        "noise"
    }

    fn apply(&mut self, substation: &mut Substation, _now_ms: u64) {
        for target in &self.targets {
            let offset = if target.amplitude > 0.0 {
                self.rng.gen_range(-target.amplitude..=target.amplitude)
            } else {
                0.0
            };
            let value = (target.base + offset).round().clamp(0.0, u16::MAX as f64) as u16;
            substation
                .model_mut()
                .profile_mut(&target.profile)
                .input_registers
                .insert(target.address, value);
        }
    }
}
