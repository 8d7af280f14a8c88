//! Per–logical-address device cache and refresh loop (spec §4.4 / C4).
//! Grounded on `original_source/pycec/network.py`'s `HdmiDevice`, recast
//! from its `async_run`/`update` coroutine pair into a cancellable tokio
//! task the way the teacher's `AVReceiverInterface` users structure
//! long-running tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cec::{device_type_name, vendor_name, Opcode};
use crate::codec::CecFrame;
use crate::physical_address::PhysicalAddress;

const STEP: std::time::Duration = std::time::Duration::from_millis(300);

/// Any property the refresh loop requests and an inbound reply can update.
/// Each carries its own `fresh` flag (spec §3: "cleared on every refresh
/// cycle and set when a matching reply arrives").
#[derive(Debug, Default, Clone, Copy)]
pub struct Freshness {
    pub power_status: bool,
    pub osd_name: bool,
    pub vendor_id: bool,
    pub physical_address: bool,
    pub deck_status: bool,
    pub audio_status: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AudioStatus {
    pub mute: bool,
    /// `None` once the device has reported an "unknown" (0x7F) reading.
    pub volume: Option<u8>,
}

/// Sends a single frame on behalf of a device. Implemented by `HdmiNetwork`
/// (spec §9: "express the network as the owner and the device's
/// back-reference as a non-owning handle").
#[async_trait::async_trait]
pub trait FrameSink: Sync + Send {
    async fn send(&self, frame: CecFrame);
}

pub struct HdmiDevice {
    logical_address: u8,
    network: std::sync::Weak<dyn FrameSink>,
    osd_name: String,
    vendor_id: u32,
    physical_address: PhysicalAddress,
    device_type: u8,
    power_status: u8,
    deck_status: u8,
    audio: AudioStatus,
    fresh: Freshness,
    stop: Arc<AtomicBool>,
    update_period: std::time::Duration,
}

impl HdmiDevice {
    pub fn new(
        logical_address: u8,
        network: std::sync::Weak<dyn FrameSink>,
        update_period: std::time::Duration,
    ) -> HdmiDevice {
        HdmiDevice {
            logical_address,
            network,
            osd_name: String::new(),
            vendor_id: 0,
            physical_address: PhysicalAddress::from_int(0),
            device_type: 0,
            power_status: 0,
            deck_status: 0,
            audio: AudioStatus::default(),
            fresh: Freshness::default(),
            stop: Arc::new(AtomicBool::new(false)),
            update_period,
        }
    }

    pub fn logical_address(&self) -> u8 {
        self.logical_address
    }

    pub fn osd_name(&self) -> &str {
        &self.osd_name
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn vendor(&self) -> String {
        vendor_name(self.vendor_id)
    }

    pub fn physical_address(&self) -> PhysicalAddress {
        self.physical_address
    }

    pub fn device_type(&self) -> u8 {
        self.device_type
    }

    pub fn type_name(&self) -> &'static str {
        device_type_name(self.device_type)
    }

    pub fn power_status(&self) -> u8 {
        self.power_status
    }

    pub fn deck_status(&self) -> u8 {
        self.deck_status
    }

    pub fn audio(&self) -> AudioStatus {
        self.audio
    }

    pub fn is_on(&self) -> bool {
        self.power_status == 0
    }

    pub fn is_off(&self) -> bool {
        self.power_status == 1
    }

    pub fn fresh(&self) -> Freshness {
        self.fresh
    }

    /// Absorbs an inbound frame whose `src` matches this device (spec
    /// §4.4). Returns whether any field was updated, so the network can
    /// decide whether to also bubble the frame to the external sink.
    pub fn update(&mut self, frame: &CecFrame) -> bool {
        let opcode = match frame.opcode.and_then(|o| std::convert::TryFrom::try_from(o).ok()) {
            Some(opcode) => opcode,
            None => return false,
        };
        match opcode {
            Opcode::ReportPowerStatus => {
                if let Some(&byte) = frame.operands.first() {
                    self.power_status = byte;
                    self.fresh.power_status = true;
                    true
                } else {
                    false
                }
            }
            Opcode::SetOsdName => {
                // trailing NULs must not truncate text already decoded
                // (spec §8 boundary behavior).
                self.osd_name = frame
                    .operands
                    .iter()
                    .take_while(|&&b| b != 0)
                    .map(|&b| b as char)
                    .collect();
                self.fresh.osd_name = true;
                true
            }
            Opcode::DeviceVendorId => {
                if frame.operands.len() >= 3 {
                    self.vendor_id = (frame.operands[0] as u32) << 16
                        | (frame.operands[1] as u32) << 8
                        | frame.operands[2] as u32;
                    self.fresh.vendor_id = true;
                    true
                } else {
                    false
                }
            }
            Opcode::ReportPhysicalAddress => {
                if frame.operands.len() >= 2 {
                    self.physical_address =
                        PhysicalAddress::from_bytes(frame.operands[0], frame.operands[1]);
                    if let Some(&device_type) = frame.operands.get(2) {
                        self.device_type = device_type;
                    }
                    self.fresh.physical_address = true;
                    true
                } else {
                    false
                }
            }
            Opcode::DeckStatus => {
                if let Some(&byte) = frame.operands.first() {
                    self.deck_status = byte;
                    self.fresh.deck_status = true;
                    true
                } else {
                    false
                }
            }
            Opcode::ReportAudioStatus => {
                if let Some(&byte) = frame.operands.first() {
                    let volume = byte & 0x7F;
                    if volume == 0x7F {
                        // "unknown": leave volume unchanged, fresh=false.
                        self.audio.mute = byte & 0x80 != 0;
                        return true;
                    }
                    self.audio.mute = byte & 0x80 != 0;
                    self.audio.volume = Some(volume.min(100));
                    self.fresh.audio_status = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Signals the refresh loop to exit at its next 0.3s step (spec §5:
    /// "stop clears no state").
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// A cloneable handle to the stop flag, independent of the device's
    /// own `Mutex` guard. `run()` keeps that guard locked for its entire
    /// lifetime (it is borrowed across every `.await` inside the loop), so
    /// a caller stopping a device whose task is already running must signal
    /// through this handle rather than through `self.stop()` behind a
    /// fresh `lock().await` — the latter would never acquire the lock
    /// until the very loop it's trying to stop has already exited.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn request(&self, opcode: Opcode) -> CecFrame {
        CecFrame::new(
            crate::cec::BROADCAST_ADDRESS,
            self.logical_address,
            opcode.into(),
            vec![],
        )
    }

    async fn send(&self, frame: CecFrame) {
        if let Some(network) = self.network.upgrade() {
            network.send(frame).await;
        }
    }

    /// The cooperative refresh loop (spec §4.4/§9): clears every `fresh`
    /// flag, emits one request per updateable property, then sleeps in
    /// 0.3s steps so `stop()` is observed promptly.
    pub async fn run(&mut self) {
        log::debug!("Starting device {:#x}", self.logical_address);
        while !self.stop.load(Ordering::SeqCst) {
            self.fresh = Freshness::default();
            for opcode in [
                Opcode::GiveDevicePowerStatus,
                Opcode::GiveOsdName,
                Opcode::GiveDeviceVendorId,
                Opcode::GivePhysicalAddress,
                Opcode::GiveDeckStatus,
                Opcode::GiveAudioStatus,
            ] {
                let frame = self.request(opcode);
                self.send(frame).await;
            }

            let mut slept = std::time::Duration::ZERO;
            while slept < self.update_period {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(STEP).await;
                slept += STEP;
            }
        }
    }

    async fn control(&self, operand: u8) {
        let frame = CecFrame::new(
            crate::cec::BROADCAST_ADDRESS,
            self.logical_address,
            Opcode::UserControlPressed.into(),
            vec![operand],
        );
        self.send(frame).await;
    }

    pub async fn turn_on(&self) {
        self.control(0x6D).await;
    }

    pub async fn turn_off(&self) {
        self.control(0x6C).await;
    }

    pub async fn toggle(&self) {
        self.control(0x40).await;
    }
}

impl PartialEq for HdmiDevice {
    fn eq(&self, other: &Self) -> bool {
        self.logical_address == other.logical_address
    }
}

impl Eq for HdmiDevice {}

impl std::hash::Hash for HdmiDevice {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.logical_address.hash(state);
    }
}

impl std::fmt::Display for HdmiDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "HDMI {:#x}: {}, {} ({}), power {}",
            self.logical_address,
            self.vendor(),
            self.osd_name,
            self.physical_address,
            self.power_status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    #[async_trait::async_trait]
    impl FrameSink for NullSink {
        async fn send(&self, _frame: CecFrame) {}
    }

    fn device() -> HdmiDevice {
        HdmiDevice::new(2, std::sync::Weak::new(), std::time::Duration::from_secs(30))
    }

    #[test]
    fn it_updates_power_status() {
        let mut device = device();
        let frame = CecFrame::new(2, 0, Opcode::ReportPowerStatus.into(), vec![0x01]);
        assert!(device.update(&frame));
        assert_eq!(1, device.power_status());
        assert!(device.fresh().power_status);
        assert!(device.is_off());
    }

    #[test]
    fn it_decodes_an_osd_name_reply() {
        let mut device = device();
        let bytes: Vec<u8> = "Onkyo HTX-22HDX".bytes().collect();
        let frame = CecFrame::new(2, 0, Opcode::SetOsdName.into(), bytes);
        assert!(device.update(&frame));
        assert_eq!("Onkyo HTX-22HDX", device.osd_name());
    }

    #[test]
    fn it_does_not_truncate_osd_name_on_trailing_nuls() {
        let mut device = device();
        let mut bytes: Vec<u8> = "Onkyo".bytes().collect();
        bytes.extend([0, 0, 0]);
        let frame = CecFrame::new(2, 0, Opcode::SetOsdName.into(), bytes);
        device.update(&frame);
        assert_eq!("Onkyo", device.osd_name());
    }

    #[test]
    fn it_decodes_a_vendor_id() {
        let mut device = device();
        let frame = CecFrame::new(2, 0, Opcode::DeviceVendorId.into(), vec![0x00, 0x09, 0xB0]);
        assert!(device.update(&frame));
        assert_eq!(0x0009B0, device.vendor_id());
        assert_eq!("Onkyo", device.vendor());
    }

    #[test]
    fn it_decodes_physical_address_and_device_type() {
        let mut device = device();
        let frame = CecFrame::new(
            2,
            0,
            Opcode::ReportPhysicalAddress.into(),
            vec![0xc0, 0x86, 0x01],
        );
        assert!(device.update(&frame));
        assert_eq!("c.0.8.6", device.physical_address().dotted());
        assert_eq!(1, device.device_type());
    }

    #[test]
    fn it_treats_audio_status_0x7f_as_unknown_and_leaves_volume() {
        let mut device = device();
        device.audio.volume = Some(42);
        let frame = CecFrame::new(2, 0, Opcode::ReportAudioStatus.into(), vec![0x7F]);
        device.update(&frame);
        assert_eq!(Some(42), device.audio().volume);
        assert!(!device.fresh().audio_status);
    }

    #[test]
    fn it_clamps_audio_status_volume_above_100() {
        let mut device = device();
        // low 7 bits = 0x7E = 126, clamped to 100.
        let frame = CecFrame::new(2, 0, Opcode::ReportAudioStatus.into(), vec![0x7E]);
        device.update(&frame);
        assert_eq!(Some(100), device.audio().volume);
        assert!(device.fresh().audio_status);
    }

    #[test]
    fn it_decodes_mute_flag_from_the_high_bit() {
        let mut device = device();
        let frame = CecFrame::new(2, 0, Opcode::ReportAudioStatus.into(), vec![0x80 | 20]);
        device.update(&frame);
        assert!(device.audio().mute);
        assert_eq!(Some(20), device.audio().volume);
    }

    #[test]
    fn it_ignores_frames_with_no_matching_opcode() {
        let mut device = device();
        let frame = CecFrame::poll(2, 0);
        assert!(!device.update(&frame));
    }

    #[test]
    fn it_is_equal_and_hashes_by_logical_address_alone() {
        let a = device();
        let mut b = HdmiDevice::new(2, std::sync::Weak::new(), std::time::Duration::from_secs(1));
        b.osd_name = String::from("different state entirely");
        assert_eq!(a, b);
    }

    #[test]
    fn it_formats_as_the_documented_display_string() {
        let device = device();
        assert_eq!("HDMI 0x2: Unknown, (0.0.0.0), power 0", format!("{}", device));
    }

    #[test_log::test(tokio::test)]
    async fn it_exits_the_refresh_loop_promptly_after_stop() {
        let mut device = HdmiDevice::new(
            2,
            std::sync::Weak::new(),
            std::time::Duration::from_secs(3600),
        );
        device.stop();
        let start = tokio::time::Instant::now();
        device.run().await;
        assert!(start.elapsed() < std::time::Duration::from_millis(500));
    }
}
