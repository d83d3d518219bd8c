//! Credit budget and reservations for billed steps.
//!
//! A billed step reserves its estimated cost before calling out, then
//! either commits the actual cost or drops the reservation. Dropping
//! (including during unwinding) always releases the reserved amount.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Credit budget of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditAccount {
    /// Maximum credits the run may consume (unbounded if unset)
    #[serde(default)]
    pub limit: Option<u64>,

    /// Credits committed by completed steps
    #[serde(default)]
    pub used: u64,

    /// Outstanding reservations; never persisted
    #[serde(skip)]
    reserved: u64,
}

impl CreditAccount {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: 0,
            reserved: 0,
        }
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Credits still available for new reservations
    pub fn available(&self) -> Option<u64> {
        self.limit
            .map(|limit| limit.saturating_sub(self.used + self.reserved))
    }

    /// Reserve `amount` credits against the budget
    pub fn reserve(&mut self, amount: u64) -> Result<Reservation<'_>, CreditViolation> {
        if let Some(available) = self.available() {
            if amount > available {
                return Err(CreditViolation::Insufficient {
                    requested: amount,
                    available,
                });
            }
        }

        self.reserved += amount;
        Ok(Reservation {
            account: self,
            amount,
            settled: false,
        })
    }
}

/// A provisional charge; released on drop unless committed
#[derive(Debug)]
pub struct Reservation<'a> {
    account: &'a mut CreditAccount,
    amount: u64,
    settled: bool,
}

impl Reservation<'_> {
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Finalize with the actual cost, returning the new total used
    pub fn commit(mut self, actual: u64) -> u64 {
        self.account.reserved -= self.amount;
        self.account.used += actual;
        self.settled = true;
        self.account.used
    }

    /// Give the reservation back explicitly
    pub fn release(self) {}
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.account.reserved -= self.amount;
        }
    }
}

/// Budget violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreditViolation {
    #[error("Insufficient credits: requested {requested}, available {available}")]
    Insufficient { requested: u64, available: u64 },
}
