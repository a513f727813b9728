//! Shared in-memory fakes of every external trait the controllers consume
//! (SPEC_FULL.md §5), used by `xcpfolio-fulfillment` and
//! `xcpfolio-maintenance`'s tests. Hand-written fakes behind the real
//! traits, not a mocking-framework macro, matching this workspace's
//! `testing-tools` conventions.

pub mod fake_chain;
pub mod fake_ledger;
pub mod fake_notify;
pub mod fake_signer;
pub mod fake_state;

pub use fake_chain::{BroadcastBehavior, FakeChainClient};
pub use fake_ledger::FakeLedgerClient;
pub use fake_notify::FakeNotifier;
pub use fake_signer::FakeSigner;
pub use fake_state::FakeStateStore;
