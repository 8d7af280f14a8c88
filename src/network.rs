//! HDMI network: device-set owner, bus scan/watch loops, frame routing
//! (spec §4.5 / C5). Grounded on `original_source/pycec/network.py`'s
//! `HdmiNetwork` and the sink wiring in `pycec/server.py`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cec::{CecAdapter, Opcode, BROADCAST_ADDRESS, MAX_DEVICE_ADDRESS};
use crate::codec::{self, CecFrame};
use crate::device::{FrameSink, HdmiDevice};
use crate::physical_address::PhysicalAddress;

const SCAN_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);
const STEP: std::time::Duration = std::time::Duration::from_millis(300);

pub type CommandSink = Arc<dyn Fn(CecFrame) + Send + Sync>;
pub type DeviceSink = Arc<dyn Fn(u8) + Send + Sync>;
pub type InitSink = Arc<dyn Fn() + Send + Sync>;

struct Sinks {
    on_command: Option<CommandSink>,
    on_device_added: Option<DeviceSink>,
    on_device_removed: Option<DeviceSink>,
    on_initialized: Option<InitSink>,
}

impl Default for Sinks {
    fn default() -> Self {
        Sinks {
            on_command: None,
            on_device_added: None,
            on_device_removed: None,
            on_initialized: None,
        }
    }
}

/// A device's refresh-loop task, paired with a stop handle that does not
/// require locking the device itself (see `HdmiDevice::stop_handle`).
struct DeviceTask {
    handle: tokio::task::JoinHandle<()>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

struct Devices {
    running: bool,
    map: HashMap<u8, DeviceTask>,
    cache: HashMap<u8, Arc<Mutex<HdmiDevice>>>,
}

/// Owns the device set and the single adapter (spec §4.5). Wrapped in
/// `Arc` so devices can hold a non-owning `Weak<dyn FrameSink>` back
/// reference (spec §9 "Callbacks and cycles").
pub struct HdmiNetwork<A: CecAdapter + 'static> {
    adapter: Arc<Mutex<A>>,
    devices: Mutex<Devices>,
    sinks: Mutex<Sinks>,
    update_period: std::time::Duration,
    scan_interval: std::time::Duration,
    self_ref: Mutex<Option<std::sync::Weak<HdmiNetwork<A>>>>,
}

impl<A: CecAdapter + 'static> HdmiNetwork<A> {
    pub fn new(
        adapter: A,
        update_period: std::time::Duration,
        scan_interval: std::time::Duration,
    ) -> Arc<HdmiNetwork<A>> {
        let network = Arc::new(HdmiNetwork {
            adapter: Arc::new(Mutex::new(adapter)),
            devices: Mutex::new(Devices {
                running: false,
                map: HashMap::new(),
                cache: HashMap::new(),
            }),
            sinks: Mutex::new(Sinks::default()),
            update_period,
            scan_interval,
            self_ref: Mutex::new(None),
        });
        let weak = Arc::downgrade(&network);
        // `try_lock` is safe here: nothing else holds `self_ref` yet, this
        // `Arc` has not escaped this function.
        *network.self_ref.try_lock().unwrap() = Some(weak);
        network
    }

    pub async fn set_on_command(&self, sink: CommandSink) {
        self.sinks.lock().await.on_command = Some(sink);
    }

    pub async fn set_on_device_added(&self, sink: DeviceSink) {
        self.sinks.lock().await.on_device_added = Some(sink);
    }

    pub async fn set_on_device_removed(&self, sink: DeviceSink) {
        self.sinks.lock().await.on_device_removed = Some(sink);
    }

    pub async fn set_on_initialized(&self, sink: InitSink) {
        self.sinks.lock().await.on_initialized = Some(sink);
    }

    /// Initializes the underlying adapter and registers `on_frame` as its
    /// inbound callback (spec §4.5).
    pub async fn init(self: &Arc<Self>) -> Result<(), crate::BridgeError> {
        let weak = Arc::downgrade(self);
        let callback: crate::cec::InboundCallback = Arc::new(move |line: String| {
            if let Some(network) = weak.upgrade() {
                tokio::spawn(async move {
                    network.on_frame(&line).await;
                });
            }
        });
        {
            let mut adapter = self.adapter.lock().await;
            adapter.set_inbound_callback(callback);
            adapter.init().await?;
        }
        self.devices.lock().await.running = true;
        if let Some(sink) = self.sinks.lock().await.on_initialized.clone() {
            sink();
        }
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.devices.lock().await.running
    }

    /// One scan cycle (spec §4.5): ascending address order, insert/remove
    /// devices, start/stop their refresh tasks.
    pub async fn scan(self: &Arc<Self>) {
        log::info!("Looking for new devices...");
        for address in 0..=MAX_DEVICE_ADDRESS {
            let present = self.adapter.lock().await.poll(address).await;
            let known = self.devices.lock().await.cache.contains_key(&address);
            match (present, known) {
                (true, false) => {
                    let weak_self: std::sync::Weak<dyn FrameSink> = {
                        let self_ref = self.self_ref.lock().await;
                        self_ref.as_ref().unwrap().clone()
                    };
                    let device = Arc::new(Mutex::new(HdmiDevice::new(
                        address,
                        weak_self,
                        self.update_period,
                    )));
                    // taken before spawning, while nothing else can be
                    // contending for the lock: the stop flag must be
                    // reachable without locking the device once its task
                    // is running (see `DeviceTask`).
                    let stop = device.lock().await.stop_handle();
                    let task_device = device.clone();
                    let handle = tokio::spawn(async move {
                        task_device.lock().await.run().await;
                    });
                    let mut devices = self.devices.lock().await;
                    devices.cache.insert(address, device);
                    devices.map.insert(address, DeviceTask { handle, stop });
                    drop(devices);
                    log::info!("Adding device {:#x}", address);
                    if let Some(sink) = self.sinks.lock().await.on_device_added.clone() {
                        sink(address);
                    }
                }
                (false, true) => {
                    let task = {
                        let mut devices = self.devices.lock().await;
                        devices.cache.remove(&address);
                        devices.map.remove(&address)
                    };
                    // signalled and awaited, never aborted (spec §5:
                    // cancellation is always cooperative, the in-flight
                    // task is awaited to completion, not interrupted).
                    if let Some(task) = task {
                        task.stop.store(true, Ordering::SeqCst);
                        let _ = task.handle.await;
                    }
                    log::info!("Removing device {:#x}", address);
                    if let Some(sink) = self.sinks.lock().await.on_device_removed.clone() {
                        sink(address);
                    }
                }
                _ => {}
            }
        }
    }

    /// Runs until shutdown: retries `init` every second while
    /// uninitialized; otherwise scans and sleeps in 0.3s steps for
    /// `scan_interval` (spec §4.5/§9).
    pub async fn watch(self: &Arc<Self>, stop: Arc<std::sync::atomic::AtomicBool>) {
        while !stop.load(Ordering::SeqCst) {
            if !self.is_initialized().await {
                if let Err(e) = self.init().await {
                    log::error!("Failed to initialize CEC adapter: {}", e);
                }
                tokio::time::sleep(SCAN_RETRY_DELAY).await;
                continue;
            }
            self.scan().await;
            let mut slept = std::time::Duration::ZERO;
            while slept < self.scan_interval {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(STEP).await;
                slept += STEP;
            }
        }
    }

    /// Substitutes the adapter's own address when `src` is missing or
    /// broadcast, then transmits (spec §4.5).
    pub async fn send(&self, mut frame: CecFrame) {
        let mut adapter = self.adapter.lock().await;
        if frame.src == BROADCAST_ADDRESS {
            frame.src = adapter.logical_address();
        }
        if let Err(e) = adapter.transmit(frame).await {
            log::warn!("Failed to transmit frame: {:?}", e);
        }
    }

    /// Two broadcast frames announcing a new active source (spec §4.5):
    /// opcode 0x82 (ActiveSource) then 0x86 (SetStreamPath).
    pub async fn active_source(&self, physical_address: PhysicalAddress) {
        let (hi, lo) = physical_address.bytes();
        for opcode in [Opcode::ActiveSource, Opcode::SetStreamPath] {
            let frame = CecFrame::new(BROADCAST_ADDRESS, BROADCAST_ADDRESS, opcode.into(), vec![hi, lo]);
            self.send(frame).await;
        }
    }

    /// Decodes an inbound line and routes it to the matching device(s)
    /// (spec §4.5); forwards unmatched frames to the command sink.
    pub async fn on_frame(&self, line: &str) {
        let line = codec::CecFrame::strip_echo_marker(line);
        let frame = match codec::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed frame {:?}: {}", line, e);
                return;
            }
        };

        let mut matched = false;
        if frame.src == BROADCAST_ADDRESS {
            let devices: Vec<_> = self.devices.lock().await.cache.values().cloned().collect();
            for device in devices {
                matched |= device.lock().await.update(&frame);
            }
        } else if let Some(device) = self.devices.lock().await.cache.get(&frame.src).cloned() {
            matched = device.lock().await.update(&frame);
        }

        if !matched {
            if let Some(sink) = self.sinks.lock().await.on_command.clone() {
                sink(frame);
            }
        }
    }

    /// Reports whether `address` is present, delegating to the adapter
    /// (used by the TCP server's poll-request handling, spec §4.6).
    pub async fn poll(&self, address: u8) -> bool {
        self.adapter.lock().await.poll(address).await
    }

    pub async fn adapter_logical_address(&self) -> u8 {
        self.adapter.lock().await.logical_address()
    }

    pub async fn standby(&self) {
        if let Err(e) = self.adapter.lock().await.standby_all().await {
            log::warn!("Failed to standby: {:?}", e);
        }
    }

    pub async fn power_on(&self) {
        if let Err(e) = self.adapter.lock().await.power_on_all().await {
            log::warn!("Failed to power on: {:?}", e);
        }
    }

    /// Stops every device, then the adapter. Safe against double-call
    /// (spec §4.5). Cancellation is cooperative (spec §5): each device's
    /// task is signalled via `stop()` and then awaited to completion,
    /// never aborted, so an in-flight refresh-loop iteration always runs
    /// to its next 0.3s step before this returns.
    pub async fn shutdown(&self) {
        let mut devices = self.devices.lock().await;
        if !devices.running {
            return;
        }
        devices.running = false;
        devices.cache.clear();
        let tasks: Vec<_> = devices.map.drain().map(|(_, task)| task).collect();
        drop(devices);
        // signalled through the stop handle (not `device.lock().await.stop()`:
        // the running task holds that lock for the whole of `run()`, so a
        // fresh lock attempt here would never succeed until the task has
        // already stopped on its own) then awaited to completion, never
        // aborted (spec §5: cancellation is cooperative, "awaited to
        // completion").
        for task in &tasks {
            task.stop.store(true, Ordering::SeqCst);
        }
        for task in tasks {
            let _ = task.handle.await;
        }
        self.adapter.lock().await.shutdown().await;
    }
}

#[async_trait::async_trait]
impl<A: CecAdapter + 'static> FrameSink for HdmiNetwork<A> {
    async fn send(&self, frame: CecFrame) {
        HdmiNetwork::send(self, frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cec::MockCecAdapter;

    fn network_with(adapter: MockCecAdapter) -> Arc<HdmiNetwork<MockCecAdapter>> {
        HdmiNetwork::new(
            adapter,
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(30),
        )
    }

    #[test_log::test(tokio::test)]
    async fn it_discovers_devices_on_scan_and_removes_them_on_the_next() {
        let mut adapter = MockCecAdapter::new();
        adapter.expect_logical_address().return_const(15u8);
        adapter.expect_transmit().returning(|_| Ok(()));
        let responses = Arc::new(std::sync::Mutex::new(HashMap::from([
            (0u8, true),
            (1u8, true),
            (3u8, true),
            (5u8, true),
        ])));
        let responses_clone = responses.clone();
        adapter.expect_poll().returning(move |address| {
            responses_clone.lock().unwrap().get(&address).copied().unwrap_or(false)
        });

        let network = network_with(adapter);
        network.scan().await;

        let known: std::collections::HashSet<u8> =
            network.devices.lock().await.cache.keys().copied().collect();
        assert_eq!(
            std::collections::HashSet::from([0, 1, 3, 5]),
            known
        );

        {
            let mut responses = responses.lock().unwrap();
            responses.insert(0, true);
            responses.insert(1, false);
            responses.insert(3, false);
            responses.insert(5, false);
        }
        network.scan().await;
        let known: std::collections::HashSet<u8> =
            network.devices.lock().await.cache.keys().copied().collect();
        assert_eq!(std::collections::HashSet::from([0]), known);
    }

    #[tokio::test]
    async fn it_substitutes_its_own_address_when_src_is_broadcast() {
        let mut adapter = MockCecAdapter::new();
        adapter.expect_logical_address().return_const(3u8);
        adapter
            .expect_transmit()
            .withf(|frame| frame.src == 3)
            .returning(|_| Ok(()));

        let network = network_with(adapter);
        network
            .send(CecFrame::new(BROADCAST_ADDRESS, 0, 0x90, vec![]))
            .await;
    }

    #[tokio::test]
    async fn it_forwards_unmatched_frames_to_the_command_sink() {
        let adapter = MockCecAdapter::new();
        let network = network_with(adapter);
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let forwarded_clone = forwarded.clone();
        network
            .set_on_command(Arc::new(move |frame| {
                let forwarded = forwarded_clone.clone();
                tokio::spawn(async move {
                    forwarded.lock().await.push(frame);
                });
            }))
            .await;

        network.on_frame("0f:90:02").await;
        tokio::task::yield_now().await;
        assert_eq!(1, forwarded.lock().await.len());
    }

    #[test_log::test(tokio::test)]
    async fn it_stops_a_running_device_task_on_shutdown_without_deadlocking() {
        // a device's spawned task holds its `Mutex<HdmiDevice>` guard for
        // the entire lifetime of `run()` (the guard is borrowed across every
        // `.await` inside the loop), so `shutdown()` must signal the stop
        // flag through `HdmiDevice::stop_handle()`, not by trying to
        // `lock().await` the same device from the outside — that lock
        // would never be granted until the very loop it's meant to stop
        // has already exited. The `timeout` below is the regression guard:
        // it fires if `shutdown()` ever goes back to locking the device
        // to stop it.
        let mut adapter = MockCecAdapter::new();
        adapter.expect_logical_address().return_const(15u8);
        adapter.expect_poll().returning(|address| address == 0);
        adapter.expect_transmit().returning(|_| Ok(()));
        adapter.expect_shutdown().returning(|| ());

        let network = network_with(adapter);
        network.scan().await;
        assert_eq!(1, network.devices.lock().await.cache.len());

        tokio::time::timeout(std::time::Duration::from_secs(2), network.shutdown())
            .await
            .expect("shutdown() deadlocked waiting on the running device's own Mutex guard");

        assert!(network.devices.lock().await.cache.is_empty());
        assert!(network.devices.lock().await.map.is_empty());
    }

    #[tokio::test]
    async fn it_never_triggers_network_send_for_a_poll_line() {
        // a 2-char line parses as src/dst with no opcode; `on_frame` only
        // ever decodes and routes, it never calls `send` itself (that is
        // the server's job per spec §8 boundary behavior).
        let adapter = MockCecAdapter::new();
        let network = network_with(adapter);
        network.on_frame("14").await;
    }
}
