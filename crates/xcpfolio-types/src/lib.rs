//! Domain types shared by every crate in the workspace: the order/transfer
//! data model (spec.md §3), the durable state envelopes (§6.5), and process
//! configuration (§6.1).

pub mod config;
pub mod envelope;
pub mod failure;
pub mod order;
pub mod primitive;
pub mod result;
pub mod transfer;

pub use config::{Config, Network, PriceTable};
pub use envelope::{ActiveOrderEntry, FailedAssetEntry, FulfillmentEnvelope, MaintenanceEnvelope};
pub use failure::{retry_tier, should_back_off, FailureRecord, RetryTier, ALERT_THRESHOLDS};
pub use order::{Order, OrderMatch, OrderStatus};
pub use primitive::{AssetName, BtcAddress, OrderHash, TxId, XCPFOLIO_PREFIX};
pub use result::{MaintenanceResult, ProcessOrderResult};
pub use transfer::{AssetTransfer, Stage, TransferFlags};
