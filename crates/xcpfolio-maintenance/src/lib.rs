//! Expired-order maintenance: re-lists `XCPFOLIO.<asset>` sell orders for
//! balances that are no longer listed anywhere (spec.md §4.2).

mod classify;
mod constants;
mod controller;

pub use controller::{MaintenanceController, MaintenanceStatus};
