//! Raw bindings to `libcec` (https://github.com/Pulse-Eight/libcec), the
//! native library backing the `native` adapter. Grounded on the teacher's
//! `kp/src/cec/structs.rs` + `functions.rs`, trimmed to the subset of the
//! C API this bridge drives: open/close a connection, poll/transmit a
//! frame, broadcast standby/power-on, and register callbacks.

#![allow(dead_code)]

pub type LibcecConnectionT = *mut libc::c_void;

pub const CEC_MAX_DATA_PACKET_SIZE: usize = 16 * 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CECLogLevel {
    Error = 1,
    Warning = 2,
    Notice = 4,
    Traffic = 8,
    Debug = 16,
    All = 31,
}

#[repr(C)]
pub struct CECLogMessage {
    pub message: *const libc::c_char,
    pub level: CECLogLevel,
    pub time: i64,
}

#[repr(C)]
pub struct CECKeypress {
    pub keycode: u32,
    pub duration: libc::c_int,
}

#[repr(C)]
#[derive(Copy)]
pub struct CECAdapterDescriptor {
    pub path: [libc::c_char; 1024],
    pub comm: [libc::c_char; 1024],
}

impl Default for CECAdapterDescriptor {
    fn default() -> CECAdapterDescriptor {
        CECAdapterDescriptor {
            path: [0; 1024],
            comm: [0; 1024],
        }
    }
}

impl Clone for CECAdapterDescriptor {
    fn clone(&self) -> CECAdapterDescriptor {
        CECAdapterDescriptor {
            path: self.path,
            comm: self.comm,
        }
    }
}

impl std::fmt::Debug for CECAdapterDescriptor {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        unsafe {
            fmt.debug_struct("CECAdapterDescriptor")
                .field("path", &std::ffi::CStr::from_ptr(self.path.as_ptr()))
                .field("comm", &std::ffi::CStr::from_ptr(self.comm.as_ptr()))
                .finish()
        }
    }
}

/// A CEC frame on the wire, libcec's native representation. `opcode_set`
/// mirrors the codec's distinction between a poll frame and an opcode
/// frame (spec §3: "absent for polling frames").
#[repr(C)]
#[derive(Debug)]
pub struct CECCommand {
    pub initiator: u8,
    pub destination: u8,
    pub ack: i8,
    pub eom: i8,
    pub opcode: u8,
    pub opcode_set: i8,
    pub operands: [u8; CEC_MAX_DATA_PACKET_SIZE],
    pub operand_count: u8,
    pub transmit_timeout: i32,
}

#[repr(C)]
pub struct LibcecParameter {
    pub param_type: u32,
    pub param_data: *mut libc::c_void,
}

#[repr(C)]
pub struct ICECCallbacks {
    pub log_message: extern "C" fn(*mut libc::c_void, *const CECLogMessage),
    pub key_press: extern "C" fn(*mut libc::c_void, *const CECKeypress),
    pub command_received: extern "C" fn(*mut libc::c_void, *const CECCommand),
    pub alert: extern "C" fn(*mut libc::c_void, u32, LibcecParameter),
}

#[repr(C)]
pub struct LibcecConfiguration {
    pub client_version: u32,
    pub str_device_name: [libc::c_char; 13],
    pub device_type: u32,
    pub b_activate_source: u8,
    pub callback_param: *mut libc::c_void,
    pub callbacks: *mut ICECCallbacks,
}

// linked via `build.rs` (pkg-config probe of `libcec`, falling back to a
// bare `-lcec`), not a `#[link(...)]` attribute here.
extern "C" {
    pub fn libcec_initialise(configuration: *mut LibcecConfiguration) -> LibcecConnectionT;
    pub fn libcec_destroy(connection: LibcecConnectionT);
    pub fn libcec_open(
        connection: LibcecConnectionT,
        str_port: *const libc::c_char,
        i_timeout: u32,
    ) -> libc::c_int;
    pub fn libcec_close(connection: LibcecConnectionT);
    pub fn libcec_find_adapters(
        connection: LibcecConnectionT,
        device_list: *mut CECAdapterDescriptor,
        i_buf_size: u8,
        str_device_path: *mut libc::c_char,
    ) -> i8;
    pub fn libcec_clear_configuration(configuration: *mut LibcecConfiguration);
    pub fn libcec_poll_device(connection: LibcecConnectionT, logical_address: u8) -> libc::c_int;
    pub fn libcec_transmit(connection: LibcecConnectionT, command: *const CECCommand) -> libc::c_int;
    pub fn libcec_power_on_devices(connection: LibcecConnectionT, logical_address: u8) -> libc::c_int;
    pub fn libcec_standby_devices(connection: LibcecConnectionT, logical_address: u8) -> libc::c_int;
    pub fn libcec_get_logical_address(connection: LibcecConnectionT) -> u8;
}
