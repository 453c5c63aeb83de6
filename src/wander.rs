//! Mean-reverting random walk used to move a price between real fetches.
//!
//! Each step pulls the current price back toward the last real observation
//! and adds noise proportional to the current price. The result is floored at
//! [`MIN_PRICE`] so the multiplicative noise term can never lock the price at
//! zero.

use rand::Rng;
use rand_distr::StandardNormal;

pub const MIN_PRICE: f64 = 0.00001;

const SECONDS_PER_YEAR: f64 = 365.25 * 86400.0;
const SIGMA: f64 = 1.0;

/// Parameters derived from a source's poll interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WanderModel {
    annualised_interval: f64,
    kappa: f64,
}

impl WanderModel {
    pub fn new(poll_interval_secs: f64) -> Self {
        let annualised_interval = poll_interval_secs / SECONDS_PER_YEAR;
        Self {
            annualised_interval,
            kappa: 1.0 / annualised_interval,
        }
    }

    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    /// Next price for a given standard normal sample `z`.
    pub fn step(&self, real_price: f64, current_price: f64, z: f64) -> f64 {
        let drift = self.kappa * (real_price - current_price) * self.annualised_interval;
        let noise = SIGMA * current_price * self.annualised_interval.sqrt() * z;
        // f64::max ignores a NaN operand, so a NaN step also lands on the floor
        (current_price + drift + noise).max(MIN_PRICE)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, real_price: f64, current_price: f64) -> f64 {
        let z: f64 = rng.sample(StandardNormal);
        self.step(real_price, current_price, z)
    }
}
