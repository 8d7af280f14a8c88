//! In-process fake adapter for integration tests: no native library, no
//! real bus. Grounded on the teacher's `cec::cec_fake::CECFakeInterface`
//! ("fake implementation for integration testing"), generalised from a
//! one-shot HTTP stub into a scriptable presence map plus bus-echo, so
//! the documented end-to-end scenarios (spec §8) can be driven without
//! hardware.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::adapter::{CecAdapter, InboundCallback};
use super::enums::CECError;
use crate::codec::{self, CecFrame};

struct Shared {
    presence: Mutex<HashMap<u8, bool>>,
    // plain std Mutex: `set_inbound_callback` is a synchronous trait method
    // and must take effect before the caller's next `.await` point, not
    // whenever a spawned task happens to get scheduled (spec §9 "Inbound
    // callback re-entrancy").
    callback: std::sync::Mutex<Option<InboundCallback>>,
}

pub struct FakeAdapter {
    logical_address: u8,
    shared: Arc<Shared>,
}

/// A handle a test keeps to script presence and inject bus frames while
/// `FakeAdapter` itself is owned by the running network/server.
#[derive(Clone)]
pub struct FakeAdapterHandle {
    shared: Arc<Shared>,
}

impl FakeAdapter {
    pub fn new(logical_address: u8) -> (FakeAdapter, FakeAdapterHandle) {
        let shared = Arc::new(Shared {
            presence: Mutex::new(HashMap::new()),
            callback: std::sync::Mutex::new(None),
        });
        (
            FakeAdapter {
                logical_address,
                shared: shared.clone(),
            },
            FakeAdapterHandle { shared },
        )
    }
}

impl FakeAdapterHandle {
    pub async fn set_present(&self, address: u8, present: bool) {
        self.shared.presence.lock().await.insert(address, present);
    }

    /// Simulates an unsolicited frame arriving from the bus.
    pub async fn inject(&self, frame: &CecFrame) {
        if let Some(cb) = self.shared.callback.lock().unwrap().clone() {
            cb(codec::render(frame));
        }
    }
}

#[async_trait::async_trait]
impl CecAdapter for FakeAdapter {
    async fn init(&mut self) -> Result<(), CECError> {
        Ok(())
    }

    async fn poll(&mut self, address: u8) -> bool {
        self.shared
            .presence
            .lock()
            .await
            .get(&address)
            .copied()
            .unwrap_or(false)
    }

    async fn transmit(&mut self, frame: CecFrame) -> Result<(), CECError> {
        // the fake bus echoes every transmitted frame back through the
        // inbound callback (spec §8 scenario 1: "Bus returns a frame ...
        // via adapter inbound").
        if let Some(cb) = self.shared.callback.lock().unwrap().clone() {
            cb(codec::render(&frame));
        }
        Ok(())
    }

    async fn standby_all(&mut self) -> Result<(), CECError> {
        Ok(())
    }

    async fn power_on_all(&mut self) -> Result<(), CECError> {
        Ok(())
    }

    fn logical_address(&self) -> u8 {
        self.logical_address
    }

    async fn shutdown(&mut self) {
        *self.shared.callback.lock().unwrap() = None;
    }

    fn set_inbound_callback(&mut self, callback: InboundCallback) {
        *self.shared.callback.lock().unwrap() = Some(callback);
    }
}
