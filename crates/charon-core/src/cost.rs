//! Cost accrual math
//!
//! All amounts are integer cents; prices are integer cents per hour. A VM is
//! billed per started minute: `ceil(minutes * price / 60)` with
//! `minutes = ceil(elapsed_seconds / 60)`. The candidate's cached
//! `spentCents` is derived from these functions by the reconciler; the
//! functions themselves are the source of truth.

use chrono::{DateTime, Utc};

use crate::model::Vm;

/// Whole minutes between two instants, rounded up; never negative
pub fn billed_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let seconds = (end - start).num_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + 59) / 60
}

/// Cents accrued for a number of billed minutes at a per-hour price
pub fn accrued_cents(minutes: i64, price_cents_per_hour: i64) -> i64 {
    if minutes <= 0 || price_cents_per_hour <= 0 {
        return 0;
    }
    (minutes * price_cents_per_hour + 59) / 60
}

/// Accrued cost of one VM as of `now` (or its termination instant)
pub fn vm_accrued_cents(vm: &Vm, now: DateTime<Utc>) -> i64 {
    let end = vm.terminated_at.unwrap_or(now);
    accrued_cents(billed_minutes(vm.launched_at, end), vm.price_cents_per_hour)
}

/// Authoritative spend for a candidate's VM history
///
/// VMs launched before `spent_reset_at` are excluded, which is how
/// re-adding a removed candidate starts them from zero.
pub fn compute_spent(vms: &[Vm], spent_reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    vms.iter()
        .filter(|vm| match spent_reset_at {
            Some(reset) => vm.launched_at >= reset,
            None => true,
        })
        .map(|vm| vm_accrued_cents(vm, now))
        .sum()
}
