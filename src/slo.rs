//! Per-client service-level objectives.
//!
//! Every dmClock client declares an [`Slo`]: a guaranteed minimum rate, a
//! proportional weight for spare capacity, and an upper cap. All three are
//! expressed against the scheduler's virtual clock, not wall time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheduling policy for one client: `(reserve, prop, limit)`.
///
/// `reserve` and `limit` are rates in requests per unit of virtual time;
/// `prop` is a unitless weight, typically a share in `[0, 1]`. A zero value
/// disables the corresponding channel. When `limit` is non-zero it must
/// exceed `reserve`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Slo {
    /// Guaranteed minimum dispatch rate; 0 disables the reservation channel.
    pub reserve: u64,
    /// Proportional claim on unreserved capacity; 0 disables.
    pub prop: f64,
    /// Upper cap on dispatch rate; 0 disables.
    pub limit: u64,
}

impl Slo {
    pub fn new(reserve: u64, prop: f64, limit: u64) -> Self {
        Slo {
            reserve,
            prop,
            limit,
        }
    }

    /// Check the policy for internal consistency.
    ///
    /// Enqueueing an invalid policy is a fatal assertion in the scheduler;
    /// callers that receive policies from an external source should validate
    /// first and handle the error.
    pub fn validate(&self) -> Result<(), SloError> {
        if !self.prop.is_finite() || self.prop < 0.0 {
            return Err(SloError::InvalidWeight { prop: self.prop });
        }
        if self.limit > 0 && self.limit <= self.reserve {
            return Err(SloError::LimitNotAboveReserve {
                limit: self.limit,
                reserve: self.reserve,
            });
        }
        Ok(())
    }

    /// True if neither the reservation nor the proportional channel is set.
    ///
    /// Such a client is legal but will never be dispatched from the dmClock
    /// queue; it belongs in the strict or weighted queue instead.
    pub fn is_best_effort(&self) -> bool {
        self.reserve == 0 && self.prop == 0.0
    }
}

/// Validation failures for an [`Slo`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SloError {
    #[error("limit ({limit}) must exceed reserve ({reserve}) when non-zero")]
    LimitNotAboveReserve { limit: u64, reserve: u64 },
    #[error("proportional weight must be finite and non-negative, got {prop}")]
    InvalidWeight { prop: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fields_are_valid() {
        assert!(Slo::new(0, 0.0, 0).validate().is_ok());
        assert!(Slo::new(0, 0.0, 0).is_best_effort());
    }

    #[test]
    fn limit_must_exceed_reserve() {
        let slo = Slo::new(100, 0.0, 100);
        assert_eq!(
            slo.validate(),
            Err(SloError::LimitNotAboveReserve {
                limit: 100,
                reserve: 100
            })
        );
        assert!(Slo::new(100, 0.0, 101).validate().is_ok());
        // A zero limit disables the cap entirely.
        assert!(Slo::new(100, 0.0, 0).validate().is_ok());
    }

    #[test]
    fn weight_must_be_finite_and_non_negative() {
        assert!(Slo::new(0, -0.5, 0).validate().is_err());
        assert!(Slo::new(0, f64::NAN, 0).validate().is_err());
        assert!(Slo::new(0, f64::INFINITY, 0).validate().is_err());
        assert!(Slo::new(0, 0.5, 0).validate().is_ok());
    }

    #[test]
    fn slo_round_trips_through_serde() {
        let slo = Slo::new(250, 1.0 / 6.0, 1000);
        let json = serde_json::to_string(&slo).unwrap();
        let back: Slo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, slo);
    }
}
