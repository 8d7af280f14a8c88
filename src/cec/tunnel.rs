//! TCP-tunnel adapter (spec §4.7 / C7): an adapter implementation that
//! relays frames to another instance of this bridge's TCP server instead of
//! to a physical bus. Grounded on `original_source/pycec/tcp.py`
//! (`TcpAdapter`/`TcpProtocol`): same line framing, same two-phase poll
//! convention, same reconnect-with-backoff policy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::adapter::{CecAdapter, InboundCallback};
use super::enums::{CECError, BROADCAST_ADDRESS};
use crate::codec::{self, CecFrame};

const MAX_CONNECTION_ATTEMPTS: u32 = 5;
const CONNECTION_ATTEMPT_DELAY: Duration = Duration::from_secs(3);
const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_PROBE_INTERVAL: Duration = Duration::from_millis(100);

type PendingPolls = Arc<Mutex<HashMap<u8, HashSet<u64>>>>;
// plain std Mutex: `set_inbound_callback` is a synchronous trait method and
// must take effect immediately, not whenever a spawned task is next
// scheduled (spec §9 "Inbound callback re-entrancy").
type SharedCallback = Arc<std::sync::Mutex<Option<InboundCallback>>>;

pub struct TunnelAdapter {
    host: String,
    port: u16,
    write_half: Option<OwnedWriteHalf>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    pending: PendingPolls,
    callback: SharedCallback,
    token_counter: Arc<AtomicU64>,
}

impl TunnelAdapter {
    pub fn new(host: impl Into<String>, port: u16) -> TunnelAdapter {
        TunnelAdapter {
            host: host.into(),
            port,
            write_half: None,
            reader_task: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            callback: Arc::new(std::sync::Mutex::new(None)),
            token_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn write_frame(&mut self, frame: CecFrame) -> Result<(), CECError> {
        let write_half = self.write_half.as_mut().ok_or(CECError::NotInitialized)?;
        let line = format!("{}\r\n", codec::render(&frame));
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|_| CECError::CommandFailed)
    }
}

#[async_trait::async_trait]
impl CecAdapter for TunnelAdapter {
    async fn init(&mut self) -> Result<(), CECError> {
        let mut last_err = None;
        for attempt in 0..MAX_CONNECTION_ATTEMPTS {
            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(stream) => {
                    let (mut read_half, write_half) = stream.into_split();
                    self.write_half = Some(write_half);

                    let pending = self.pending.clone();
                    let callback = self.callback.clone();
                    self.reader_task = Some(tokio::spawn(async move {
                        run_reader(&mut read_half, pending, callback).await;
                    }));
                    log::info!("Tunnel connected to {}:{}", self.host, self.port);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Unable to connect to {}:{} ({}). {} attempts remaining.",
                        self.host,
                        self.port,
                        e,
                        MAX_CONNECTION_ATTEMPTS - attempt - 1
                    );
                    last_err = Some(e);
                    if attempt + 1 < MAX_CONNECTION_ATTEMPTS {
                        tokio::time::sleep(CONNECTION_ATTEMPT_DELAY).await;
                    }
                }
            }
        }
        log::error!("Unable to connect to {}:{}. Giving up.", self.host, self.port);
        let _ = last_err;
        Err(CECError::OpenFailed)
    }

    async fn poll(&mut self, address: u8) -> bool {
        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .await
            .entry(address)
            .or_default()
            .insert(token);

        if self
            .write_frame(CecFrame::poll(self.logical_address(), address))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&address);
            return false;
        }

        let deadline = tokio::time::Instant::now() + POLL_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            let still_pending = self
                .pending
                .lock()
                .await
                .get(&address)
                .map(|tokens| tokens.contains(&token))
                .unwrap_or(false);
            if !still_pending {
                log::debug!("Found device {:#x}", address);
                return true;
            }
            tokio::time::sleep(POLL_PROBE_INTERVAL).await;
        }
        if let Some(tokens) = self.pending.lock().await.get_mut(&address) {
            tokens.remove(&token);
        }
        false
    }

    async fn transmit(&mut self, frame: CecFrame) -> Result<(), CECError> {
        self.write_frame(frame).await
    }

    async fn standby_all(&mut self) -> Result<(), CECError> {
        self.write_frame(CecFrame::new(
            self.logical_address(),
            BROADCAST_ADDRESS,
            super::enums::Opcode::Standby.into(),
            vec![],
        ))
        .await
    }

    async fn power_on_all(&mut self) -> Result<(), CECError> {
        self.write_frame(CecFrame::new(
            self.logical_address(),
            BROADCAST_ADDRESS,
            super::enums::Opcode::UserControlPressed.into(),
            vec![0x40],
        ))
        .await?;
        self.write_frame(CecFrame::new(
            self.logical_address(),
            BROADCAST_ADDRESS,
            super::enums::Opcode::UserControlRelease.into(),
            vec![],
        ))
        .await
    }

    fn logical_address(&self) -> u8 {
        // the tunnel adapter has no physical presence on the remote bus.
        BROADCAST_ADDRESS
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.write_half = None;
    }

    fn set_inbound_callback(&mut self, callback: InboundCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}

/// Reads lines from the peer: a 2-char line clears the matching pending
/// poll; anything else is forwarded to the inbound callback, prefixed with
/// `"<< "` for log symmetry with the native adapter's `">> "` marker.
async fn run_reader(
    stream: &mut tokio::net::tcp::OwnedReadHalf,
    pending: PendingPolls,
    callback: SharedCallback,
) {
    let mut buffer = String::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => {
                log::warn!("Tunnel connection lost");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::warn!("Tunnel read error: {}", e);
                break;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));

        while let Some(idx) = buffer.find(['\r', '\n']) {
            let line = buffer[..idx].to_string();
            let rest_start = idx + buffer[idx..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            buffer.drain(..rest_start);

            let line = codec::CecFrame::strip_echo_marker(line.trim());
            if line.is_empty() {
                continue;
            }
            if line.len() == 2 {
                // the reply's low nibble carries the polled address (spec
                // §4.6/§8 scenario 2: self-address in the high nibble,
                // polled address in the low nibble), so pending polls are
                // matched by `dst`, not `src`.
                if let Ok(frame) = codec::parse(line) {
                    if let Some(tokens) = pending.lock().await.get_mut(&frame.dst) {
                        tokens.clear();
                    }
                }
            } else if let Some(cb) = callback.lock().unwrap().clone() {
                cb(format!("<< {}", line));
            }
        }
    }
}
