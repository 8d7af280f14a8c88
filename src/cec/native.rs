//! Native CEC adapter: drives a USB CEC dongle through `libcec`.
//!
//! `libcec`'s own calls are synchronous. Per spec §5 ("Blocking operations
//! and the worker pool"), every one of them is dispatched to a single
//! dedicated worker thread, so that two calls against the same adapter are
//! never interleaved and the event loop is never blocked waiting on the
//! bus. This mirrors the teacher's `CECConnection::exec` retry-on-failure
//! wrapper (`kp/src/cec/cec.rs`), generalised from `power_on`/`standby`
//! only to the full adapter surface the spec requires.

use std::convert::TryInto;

use super::adapter::{CecAdapter, InboundCallback};
use super::enums::CECError;
use super::ffi::*;
use crate::codec::{self, CecFrame};

unsafe impl Send for Job {}

/// A unit of work dispatched to the worker thread: a boxed closure over the
/// raw connection handle, and the channel its result is sent back on.
struct Job {
    run: Box<dyn FnOnce(LibcecConnectionT) + Send>,
}

struct Worker {
    sender: std::sync::mpsc::Sender<Job>,
    _handle: std::thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(connection: LibcecConnectionT) -> Worker {
        let (sender, receiver) = std::sync::mpsc::channel::<Job>();
        let connection = SendPtr(connection);
        let handle = std::thread::spawn(move || {
            let connection = connection;
            for job in receiver {
                (job.run)(connection.0);
            }
        });
        Worker {
            sender,
            _handle: handle,
        }
    }

    async fn exec<F, T>(&self, f: F) -> T
    where
        F: FnOnce(LibcecConnectionT) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let job = Job {
            run: Box::new(move |conn| {
                let _ = tx.send(f(conn));
            }),
        };
        // the worker thread only ever dies with the connection; a send
        // failure here means the adapter has already been shut down.
        let _ = self.sender.send(job);
        rx.await.expect("CEC worker thread dropped a job")
    }
}

#[derive(Clone, Copy)]
struct SendPtr(LibcecConnectionT);
unsafe impl Send for SendPtr {}

extern "C" fn log_message(_param: *mut libc::c_void, message: *const CECLogMessage) {
    unsafe {
        if let Some(msg) = message.as_ref().and_then(|m| m.message.as_ref()) {
            let level = match message.as_ref().unwrap().level {
                CECLogLevel::Error => log::Level::Warn,
                CECLogLevel::Warning => log::Level::Info,
                _ => log::Level::Debug,
            };
            log::log!(level, "CEC log: {:?}", std::ffi::CStr::from_ptr(msg));
        }
    }
}

extern "C" fn key_press(_param: *mut libc::c_void, _key: *const CECKeypress) {}

extern "C" fn command_received(param: *mut libc::c_void, command: *const CECCommand) {
    if param.is_null() || command.is_null() {
        return;
    }
    unsafe {
        let callback = &*(param as *const InboundCallbackSlot);
        if let Some(cb) = callback.get() {
            let command = &*command;
            let frame = CecFrame {
                src: command.initiator,
                dst: command.destination,
                opcode: if command.opcode_set != 0 {
                    Some(command.opcode)
                } else {
                    None
                },
                operands: command.operands[..command.operand_count as usize].to_vec(),
            };
            cb(codec::render(&frame));
        }
    }
}

extern "C" fn alert(_param: *mut libc::c_void, alert_type: u32, _param_data: LibcecParameter) {
    log::info!("CEC alert [{}]", alert_type);
}

/// Holds the Rust inbound callback behind the `void*` libcec hands back to
/// `command_received`. Set once during `init`; read (never mutated
/// concurrently with a device-set mutation, per §5) on every inbound frame.
#[derive(Default)]
struct InboundCallbackSlot(std::sync::Mutex<Option<InboundCallback>>);

impl InboundCallbackSlot {
    fn get(&self) -> Option<InboundCallback> {
        self.0.lock().unwrap().clone()
    }

    fn set(&self, callback: InboundCallback) {
        *self.0.lock().unwrap() = Some(callback);
    }
}

pub struct NativeAdapter {
    client_version: u32,
    device_name: String,
    connection: Option<LibcecConnectionT>,
    worker: Option<Worker>,
    callbacks: Box<ICECCallbacks>,
    callback_slot: Box<InboundCallbackSlot>,
    logical_address: u8,
}

unsafe impl Send for NativeAdapter {}
unsafe impl Sync for NativeAdapter {}

impl NativeAdapter {
    pub fn new(client_version: &str, device_name: &str) -> Result<NativeAdapter, CECError> {
        Ok(NativeAdapter {
            client_version: parse_version(client_version)?,
            device_name: device_name.to_owned(),
            connection: None,
            worker: None,
            callbacks: Box::new(ICECCallbacks {
                log_message,
                key_press,
                command_received,
                alert,
            }),
            callback_slot: Box::new(InboundCallbackSlot::default()),
            logical_address: crate::cec::enums::BROADCAST_ADDRESS,
        })
    }

    fn build_configuration(&mut self) -> LibcecConfiguration {
        let mut name = [0 as libc::c_char; 13];
        for (i, b) in self.device_name.bytes().take(12).enumerate() {
            name[i] = b as libc::c_char;
        }
        LibcecConfiguration {
            client_version: self.client_version,
            str_device_name: name,
            device_type: 1, // recording device
            b_activate_source: 0,
            callback_param: &*self.callback_slot as *const InboundCallbackSlot as *mut libc::c_void,
            callbacks: &mut *self.callbacks,
        }
    }

    fn open_connection(&mut self) -> Result<LibcecConnectionT, CECError> {
        let mut configuration = self.build_configuration();
        let connection = unsafe { libcec_initialise(&mut configuration) };
        if connection.is_null() {
            return Err(CECError::CommandFailed);
        }

        let mut buf = [CECAdapterDescriptor::default(); 10];
        let adapter_count = unsafe {
            libcec_find_adapters(connection, buf.as_mut_ptr(), buf.len() as u8, std::ptr::null_mut())
        };
        if adapter_count <= 0 {
            unsafe {
                libcec_destroy(connection);
            }
            return Err(CECError::AdapterNotFound);
        }
        let adapter = &buf[0];
        if unsafe { libcec_open(connection, adapter.comm.as_ptr(), 5000) } == 0 {
            unsafe {
                libcec_destroy(connection);
            }
            return Err(CECError::OpenFailed);
        }
        Ok(connection)
    }
}

#[async_trait::async_trait]
impl CecAdapter for NativeAdapter {
    async fn init(&mut self) -> Result<(), CECError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let connection = self.open_connection()?;
        self.logical_address = unsafe { libcec_get_logical_address(connection) };
        self.worker = Some(Worker::spawn(connection));
        self.connection = Some(connection);
        Ok(())
    }

    async fn poll(&mut self, address: u8) -> bool {
        let worker = match &self.worker {
            Some(w) => w,
            None => return false,
        };
        worker.exec(move |conn| unsafe { libcec_poll_device(conn, address) != 0 }).await
    }

    async fn transmit(&mut self, frame: CecFrame) -> Result<(), CECError> {
        let worker = self.worker.as_ref().ok_or(CECError::NotInitialized)?;
        let ok = worker
            .exec(move |conn| {
                let mut operands = [0u8; CEC_MAX_DATA_PACKET_SIZE];
                let count = frame.operands.len().min(operands.len());
                operands[..count].copy_from_slice(&frame.operands[..count]);
                let command = CECCommand {
                    initiator: frame.src,
                    destination: frame.dst,
                    ack: 0,
                    eom: 1,
                    opcode: frame.opcode.unwrap_or(0),
                    opcode_set: frame.opcode.is_some() as i8,
                    operands,
                    operand_count: count as u8,
                    transmit_timeout: 1000,
                };
                unsafe { libcec_transmit(conn, &command) != 0 }
            })
            .await;
        if ok {
            Ok(())
        } else {
            Err(CECError::CommandFailed)
        }
    }

    async fn standby_all(&mut self) -> Result<(), CECError> {
        let worker = self.worker.as_ref().ok_or(CECError::NotInitialized)?;
        let ok = worker
            .exec(move |conn| unsafe {
                libcec_standby_devices(conn, crate::cec::enums::BROADCAST_ADDRESS) != 0
            })
            .await;
        if ok {
            Ok(())
        } else {
            Err(CECError::CommandFailed)
        }
    }

    async fn power_on_all(&mut self) -> Result<(), CECError> {
        let worker = self.worker.as_ref().ok_or(CECError::NotInitialized)?;
        let ok = worker
            .exec(move |conn| unsafe {
                libcec_power_on_devices(conn, crate::cec::enums::BROADCAST_ADDRESS) != 0
            })
            .await;
        if ok {
            Ok(())
        } else {
            Err(CECError::CommandFailed)
        }
    }

    fn logical_address(&self) -> u8 {
        self.logical_address
    }

    async fn shutdown(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Some(worker) = self.worker.take() {
                worker
                    .exec(move |_| unsafe {
                        libcec_close(connection);
                        libcec_destroy(connection);
                    })
                    .await;
            }
        }
    }

    fn set_inbound_callback(&mut self, callback: InboundCallback) {
        self.callback_slot.set(callback);
    }
}

fn parse_version(version: &str) -> Result<u32, CECError> {
    let mut parts: Vec<u32> = version
        .split('.')
        .map(|s| {
            s.parse()
                .map_err(|_| CECError::InvalidConfiguration("invalid CEC client version"))
        })
        .take(3)
        .collect::<Result<Vec<u32>, CECError>>()?;
    parts.resize(3, 0);
    let parts: [u32; 3] = parts.try_into().unwrap();
    Ok(parts[0] << 16 | parts[1] << 8 | parts[2])
}
