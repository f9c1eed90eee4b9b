//! A mock CDN serving round mailboxes.

use std::collections::HashMap;

use alpenhorn_proto::{append_envelope, split_envelopes, ServiceId};
use parking_lot::Mutex;

/// In-memory mailbox store keyed by `(service, round, mailbox)`.
#[derive(Default)]
pub struct MockCdn {
    store: Mutex<HashMap<(ServiceId, u32, u32), Vec<u8>>>,
    echo_duplicates: Mutex<bool>,
}

impl MockCdn {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one envelope to a mailbox.
    pub fn put(&self, service: ServiceId, round: u32, mailbox: u32, envelope: &[u8]) {
        let mut store = self.store.lock();
        let blob = store.entry((service, round, mailbox)).or_default();
        append_envelope(blob, envelope);
    }

    /// Fetch a mailbox blob.
    pub fn get(&self, service: ServiceId, round: u32, mailbox: u32) -> Option<Vec<u8>> {
        let store = self.store.lock();
        let blob = store.get(&(service, round, mailbox))?.clone();
        if !*self.echo_duplicates.lock() {
            return Some(blob);
        }

        // Replay mode: serve every envelope twice, simulating duplicate
        // mailbox delivery.
        let Ok(envelopes) = split_envelopes(&blob) else {
            return Some(blob);
        };
        let mut doubled = Vec::with_capacity(blob.len() * 2);
        for envelope in envelopes.iter().chain(envelopes.iter()) {
            append_envelope(&mut doubled, envelope);
        }
        Some(doubled)
    }

    /// Serve every envelope twice on fetch. Used to test duplicate-delivery
    /// idempotence.
    pub fn set_echo_duplicates(&self, enabled: bool) {
        *self.echo_duplicates.lock() = enabled;
    }
}
