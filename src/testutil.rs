//! Shared test doubles for the in-crate unit tests.

use std::sync::{Arc, Mutex};

use crate::address::OverlayAddress;
use crate::identity::Identity;
use crate::kademlia::PeerRecord;
use crate::messages::CourierMsg;
use crate::protocols::PeerConnection;

/// A fake live peer that records what is sent to it.
pub(crate) struct TestPeer {
    address: OverlayAddress,
    identity: Identity,
    pub sent: Mutex<Vec<CourierMsg>>,
    pub dropped: Mutex<Option<String>>,
    pub fail_sends: bool,
}

impl TestPeer {
    pub fn new(address: OverlayAddress) -> Arc<Self> {
        Self::build(address, false)
    }

    pub fn failing(address: OverlayAddress) -> Arc<Self> {
        Self::build(address, true)
    }

    fn build(address: OverlayAddress, fail_sends: bool) -> Arc<Self> {
        let mut id = [0u8; 32];
        id.copy_from_slice(address.as_bytes());
        Arc::new(Self {
            address,
            identity: Identity::from_bytes(id),
            sent: Mutex::new(Vec::new()),
            dropped: Mutex::new(None),
            fail_sends,
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl PeerConnection for TestPeer {
    fn address(&self) -> &OverlayAddress {
        &self.address
    }

    fn identity(&self) -> Identity {
        self.identity
    }

    fn send(&self, msg: CourierMsg) -> anyhow::Result<()> {
        if self.fail_sends {
            anyhow::bail!("injected send failure");
        }
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    fn disconnect(&self, reason: &str) {
        *self.dropped.lock().unwrap() = Some(reason.to_string());
    }

    fn record(&self) -> PeerRecord {
        PeerRecord::new(self.address, "test")
    }
}
