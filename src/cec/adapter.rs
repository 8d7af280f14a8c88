//! Transport-neutral adapter capability surface (spec §4.3 / C3).
//!
//! Mirrors the shape of the teacher's `AVReceiverInterface`: a
//! `#[async_trait]` trait, mockable with `mockall::automock` in tests,
//! implemented by two concrete transports (`native`, `tunnel`).

use super::enums::CECError;
use crate::codec::CecFrame;

/// Invoked for every inbound frame, as a decoded text line with its echo
/// marker already stripped by the adapter (spec §4.3).
pub type InboundCallback = std::sync::Arc<dyn Fn(String) + Send + Sync>;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CecAdapter: Sync + Send {
    /// Acquires bus access. Idempotent: re-init after shutdown is allowed.
    async fn init(&mut self) -> Result<(), CECError>;

    /// Reports whether `address` is present on the bus. May take up to the
    /// adapter's poll timeout.
    async fn poll(&mut self, address: u8) -> bool;

    /// Enqueues `frame` for transmission. No acknowledgement.
    async fn transmit(&mut self, frame: CecFrame) -> Result<(), CECError>;

    async fn standby_all(&mut self) -> Result<(), CECError>;

    async fn power_on_all(&mut self) -> Result<(), CECError>;

    /// The adapter's own source address.
    fn logical_address(&self) -> u8;

    /// Releases bus access, cancels in-flight polls and drops the inbound
    /// callback.
    async fn shutdown(&mut self);

    fn set_inbound_callback(&mut self, callback: InboundCallback);
}
