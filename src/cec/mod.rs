//! CEC transport layer (spec §4.3/§4.7 / C3, C7): the adapter capability
//! surface and its two implementations.

mod adapter;
mod enums;
pub mod fake;
mod ffi;
mod native;
mod tunnel;

pub use adapter::{CecAdapter, InboundCallback};
#[cfg(test)]
pub use adapter::MockCecAdapter;
pub use enums::{device_type_name, vendor_name, CECError, Opcode, BROADCAST_ADDRESS, MAX_DEVICE_ADDRESS};
pub use fake::{FakeAdapter, FakeAdapterHandle};
pub use native::NativeAdapter;
pub use tunnel::TunnelAdapter;
