//! Per-run execution context
//!
//! Holds the random generator and the device handle for one search
//! invocation. Nothing in the crate keeps process-wide random state; every
//! component that needs randomness borrows it from here.

use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque compute device reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    /// Accelerator ordinal; tensors stay host-resident in this crate
    Accelerator(usize),
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(i) => write!(f, "accel:{}", i),
        }
    }
}

/// Random generator and device for a single search run
#[derive(Debug, Clone)]
pub struct RunContext {
    rng: Xoshiro256PlusPlus,
    device: Device,
    seed: u64,
}

impl RunContext {
    pub fn new(seed: u64, device: Device) -> Self {
        Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            device,
            seed,
        }
    }

    /// Context on the host CPU
    pub fn cpu(seed: u64) -> Self {
        Self::new(seed, Device::Cpu)
    }

    pub fn rng(&mut self) -> &mut Xoshiro256PlusPlus {
        &mut self.rng
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Draw a seed for an independent child generator (one per batch shard)
    pub fn fork_seed(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Child generator derived from this context
    pub fn fork(&mut self) -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(self.fork_seed())
    }
}
