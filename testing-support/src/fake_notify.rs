//! Records notifications instead of delivering them, so tests can assert on
//! which alerts fired (spec §4.1: alerts at the retry-count thresholds;
//! spec §4.1 step 1: warning on mempool-at-capacity).

use async_trait::async_trait;
use parking_lot::Mutex;

use xcpfolio_notify::{Notifier, Severity};

#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<(Severity, String)>>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Severity, String)> {
        self.sent.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.sent.lock().iter().filter(|(s, _)| *s == severity).count()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        self.sent.lock().push((severity, message.to_string()));
    }
}
