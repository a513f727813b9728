//! The order-fulfillment state machine: watches the DEX for filled
//! `XCPFOLIO.<asset>` orders and drives each one to a confirmed on-chain
//! asset transfer (spec.md §4.1).

mod constants;
mod controller;

pub use controller::{FulfillmentController, Snapshot};
