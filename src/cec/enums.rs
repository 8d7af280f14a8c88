//! CEC opcodes and adapter error taxonomy referenced by the core (spec §6).
//!
//! Trimmed from the teacher's `CECOpcode`/`CECLogicalAddress` libcec
//! bindings down to the opcodes this bridge actually decodes or emits;
//! the codec itself stays opaque to any opcode not listed here (spec
//! §4.1: "the codec is opaque to unknown opcodes").

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CECError {
    AdapterNotFound,
    CommandFailed,
    InvalidConfiguration(&'static str),
    NotInitialized,
    OpenFailed,
}

/// Request/reply and command opcodes named by spec §4.4 / §6.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    FeatureAbort = 0x00,
    GiveDeckStatus = 0x1A,
    DeckStatus = 0x1B,
    Standby = 0x36,
    UserControlPressed = 0x44,
    UserControlRelease = 0x45,
    GiveOsdName = 0x46,
    SetOsdName = 0x47,
    GiveAudioStatus = 0x71,
    ReportAudioStatus = 0x7A,
    ActiveSource = 0x82,
    GivePhysicalAddress = 0x83,
    ReportPhysicalAddress = 0x84,
    DeviceVendorId = 0x87,
    SetStreamPath = 0x86,
    GiveDeviceVendorId = 0x8C,
    GiveDevicePowerStatus = 0x8F,
    ReportPowerStatus = 0x90,
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> u8 {
        opcode as u8
    }
}

impl std::convert::TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match value {
            0x00 => FeatureAbort,
            0x1A => GiveDeckStatus,
            0x1B => DeckStatus,
            0x36 => Standby,
            0x44 => UserControlPressed,
            0x45 => UserControlRelease,
            0x46 => GiveOsdName,
            0x47 => SetOsdName,
            0x71 => GiveAudioStatus,
            0x7A => ReportAudioStatus,
            0x82 => ActiveSource,
            0x83 => GivePhysicalAddress,
            0x84 => ReportPhysicalAddress,
            0x87 => DeviceVendorId,
            0x86 => SetStreamPath,
            0x8C => GiveDeviceVendorId,
            0x8F => GiveDevicePowerStatus,
            0x90 => ReportPowerStatus,
            _ => return Err(()),
        })
    }
}

/// The broadcast/unregistered logical address (spec §3).
pub const BROADCAST_ADDRESS: u8 = 15;

/// Highest addressable, non-broadcast logical address (spec §3, §4.5: scan
/// covers addresses 0..14).
pub const MAX_DEVICE_ADDRESS: u8 = 14;

/// Mirrors `original_source/pycec/const.py`'s `VENDORS` dict verbatim
/// (including its two vendors with more than one registered id).
pub fn vendor_name(vendor_id: u32) -> String {
    match vendor_id {
        0x000000 => String::from("Unknown"),
        0x0020C7 => String::from("Akai"),
        0x0010FA => String::from("Apple"),
        0x002467 => String::from("AOC"),
        0x8065E9 => String::from("Benq"),
        0x18C086 => String::from("Broadcom"),
        0x009053 => String::from("Daewoo"),
        0x0005CD => String::from("Denon"),
        0x001A11 => String::from("Google"),
        0x00D0D5 => String::from("Grundig"),
        0x001950 => String::from("Harman Kardon"),
        0x9C645E => String::from("Harman Kardon"),
        0x00E091 => String::from("LG"),
        0x000982 => String::from("Loewe"),
        0x000678 => String::from("Marantz"),
        0x000CB8 => String::from("Medion"),
        0x0009B0 => String::from("Onkyo"),
        0x008045 => String::from("Panasonic"),
        0x00903E => String::from("Philips"),
        0x00E036 => String::from("Pioneer"),
        0x001582 => String::from("Pulse Eight"),
        0x8AC72E => String::from("Roku"),
        0x0000F0 => String::from("Samsung"),
        0x08001F => String::from("Sharp"),
        0x534850 => String::from("Sharp"),
        0x080046 => String::from("Sony"),
        0x000039 => String::from("Toshiba"),
        0x000CE7 => String::from("Toshiba"),
        0x6B746D => String::from("Vizio"),
        0x00A0DE => String::from("Yamaha"),
        _ => format!("{:#08x}", vendor_id),
    }
}

pub fn device_type_name(device_type: u8) -> &'static str {
    match device_type {
        0 => "TV",
        1 => "Recording Device",
        2 => "Reserved",
        3 => "Tuner",
        4 => "Playback Device",
        5 => "Audio System",
        _ => "Unknown",
    }
}
