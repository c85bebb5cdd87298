//! AFLFast-style power scheduler.
//!
//! Energy is the iteration budget the worker spends on a selected seed.
//! The `aflfast` policy computes `α(i)/β · 2^s(i) / f(i)` in log space;
//! `s(i)` is capped at 256, which would overflow any fixed-width integer if
//! evaluated directly.

use std::str::FromStr;

use log::info;

use crate::corpus::SeedRecord;
use crate::ConfigError;

const MAX_SI: u64 = 256;

/// Energy assignment policy, selected by `fuzzing.assign_energy_function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyPolicy {
    /// Constant `M` for every seed.
    Simple,
    AflFast,
}

impl FromStr for EnergyPolicy {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "simple" => Ok(EnergyPolicy::Simple),
            "aflfast" => Ok(EnergyPolicy::AflFast),
            other => Err(ConfigError::UnknownEnergyFunction(other.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct PowerScheduler {
    policy: EnergyPolicy,
    beta: f64,
    m: f64,
}

impl PowerScheduler {
    pub fn new(policy: EnergyPolicy, m: f64) -> Self {
        PowerScheduler {
            policy,
            beta: 1.0,
            m,
        }
    }

    pub fn with_beta(policy: EnergyPolicy, beta: f64, m: f64) -> Self {
        PowerScheduler { policy, beta, m }
    }

    /// Energy for the selected seed, in `(0, M]`. Called once per seed
    /// selection; the worker runs `ceil(energy)` inner iterations.
    pub fn assign_energy(
        &self,
        seed: &SeedRecord,
        total_tested_count: u64,
        total_elapsed_us: u64,
    ) -> f64 {
        match self.policy {
            EnergyPolicy::Simple => self.m,
            EnergyPolicy::AflFast => self.aflfast(seed, total_tested_count, total_elapsed_us),
        }
    }

    fn aflfast(&self, seed: &SeedRecord, total_tested_count: u64, total_elapsed_us: u64) -> f64 {
        let si = seed.total_tested_count.max(1).min(MAX_SI);
        let fi = seed.total_same_coverage_seed_count.max(1) as f64;

        let alpha = self.alpha(seed, total_tested_count, total_elapsed_us);

        let log_e =
            alpha.ln() - self.beta.ln() + si as f64 * std::f64::consts::LN_2 - fi.ln();
        let energy = if log_e >= self.m.ln() {
            self.m
        } else {
            log_e.exp()
        };

        info!(
            "energy for seed {}: {energy:.3} (alpha: {alpha}, beta: {}, s(i): {si}, f(i): {fi})",
            seed.id, self.beta
        );
        energy
    }

    /// Performance score from the execution-time ratio, in the classic AFL
    /// bands {10, 25, 50, 75, 100, 150, 200, 300}.
    fn alpha(&self, seed: &SeedRecord, total_tested_count: u64, total_elapsed_us: u64) -> f64 {
        let avg_exec_us = if total_tested_count > 0 {
            total_elapsed_us as f64 / total_tested_count as f64
        } else {
            1.0
        };
        let exec_us = if seed.total_tested_count > 0 {
            total_elapsed_us as f64 / seed.total_tested_count as f64
        } else {
            avg_exec_us
        };

        let perf_score: f64 = if exec_us * 0.1 > avg_exec_us {
            10.0
        } else if exec_us * 0.2 > avg_exec_us {
            25.0
        } else if exec_us * 0.5 > avg_exec_us {
            50.0
        } else if exec_us * 0.75 > avg_exec_us {
            75.0
        } else if exec_us * 4.0 < avg_exec_us {
            300.0
        } else if exec_us * 3.0 < avg_exec_us {
            200.0
        } else if exec_us * 2.0 < avg_exec_us {
            150.0
        } else {
            100.0
        };

        perf_score.max(1.0)
    }
}
