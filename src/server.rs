//! Line-oriented TCP broadcast gateway (spec §4.6 / C6). Grounded on
//! `original_source/pycec/server.py`'s `CECServerProtocol`/`CECServer`;
//! graceful shutdown follows `router/src/lib.rs`'s `serve`/`shutdown_signal`
//! `futures::select!` pattern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::cec::CecAdapter;
use crate::codec::{self, CecFrame};
use crate::network::HdmiNetwork;

/// Per-connection broadcast sender plus a one-shot handle the server can
/// fire to force that connection's read loop to drop its socket during
/// shutdown (spec §5: "A shutdown on the TCP server closes the listening
/// socket, then the connection set (each close is best-effort)").
struct ConnectionHandle {
    sender: tokio::sync::mpsc::UnboundedSender<String>,
    close: tokio::sync::oneshot::Sender<()>,
}

type Connections = Arc<Mutex<HashMap<u64, ConnectionHandle>>>;

/// Removes a connection from the broadcast set on drop, mirroring
/// `CECServerProtocol.connection_lost` (spec §4.6 supplement in
/// SPEC_FULL.md).
struct ConnectionGuard {
    id: u64,
    connections: Connections,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let connections = self.connections.clone();
        let id = self.id;
        tokio::spawn(async move {
            connections.lock().await.remove(&id);
        });
    }
}

/// Spawns the accept loop on `listener` against `network`, until `shutdown`
/// resolves (spec §4.6, §5 "A shutdown on the TCP server closes the
/// listening socket, then the connection set").
pub async fn serve<A: CecAdapter + 'static>(
    listener: TcpListener,
    network: Arc<HdmiNetwork<A>>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicU64::new(0));

    {
        let connections = connections.clone();
        network
            .set_on_command(Arc::new(move |frame: CecFrame| {
                let connections = connections.clone();
                tokio::spawn(async move {
                    broadcast(&connections, frame).await;
                });
            }))
            .await;
    }

    let mut shutdown = Box::pin(shutdown).fuse();
    loop {
        let accept = listener.accept().fuse();
        tokio::pin!(accept);
        futures::select! {
            result = accept => {
                match result {
                    Ok((stream, addr)) => {
                        log::info!("Connection opened by {}", addr);
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        let connections = connections.clone();
                        let network = network.clone();
                        tokio::spawn(async move {
                            handle_connection(id, stream, connections, network).await;
                        });
                    }
                    Err(e) => log::warn!("Failed to accept connection: {}", e),
                }
            }
            _ = shutdown => {
                log::info!("TCP server shutting down");
                break;
            }
        }
    }

    for (id, handle) in connections.lock().await.drain() {
        log::debug!("Closing connection {} for shutdown", id);
        let _ = handle.close.send(());
    }
}

async fn handle_connection<A: CecAdapter + 'static>(
    id: u64,
    stream: TcpStream,
    connections: Connections,
    network: Arc<HdmiNetwork<A>>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let (close_tx, mut close_rx) = tokio::sync::oneshot::channel::<()>();
    connections.lock().await.insert(
        id,
        ConnectionHandle {
            sender: tx,
            close: close_tx,
        },
    );
    let _guard = ConnectionGuard {
        id,
        connections: connections.clone(),
    };

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut buffer = String::new();
    let mut chunk = [0u8; 1024];
    'read: loop {
        let n = tokio::select! {
            result = read_half.read(&mut chunk) => match result {
                Ok(0) => break 'read,
                Ok(n) => n,
                Err(e) => {
                    log::warn!("Connection read error: {}", e);
                    break 'read;
                }
            },
            _ = &mut close_rx => {
                log::info!("Closing connection {} for shutdown", id);
                break 'read;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));

        while let Some(idx) = buffer.find(['\r', '\n']) {
            let line = buffer[..idx].to_string();
            let rest_start = idx + buffer[idx..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            buffer.drain(..rest_start);

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            process_line(line, id, &connections, &network).await;
        }
    }

    log::info!("Connection with client {} lost", id);
    writer.abort();
}

/// Classifies an inbound line by length (spec §4.6): exactly two
/// characters is a poll request; anything else is an inject.
async fn process_line<A: CecAdapter + 'static>(
    line: &str,
    origin: u64,
    connections: &Connections,
    network: &Arc<HdmiNetwork<A>>,
) {
    if line.len() == 2 {
        let frame = match codec::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Malformed poll request {:?}: {}", line, e);
                return;
            }
        };
        let self_address = network.adapter_logical_address().await;
        let found = network.poll(frame.dst).await;
        if found {
            let reply = CecFrame::poll(self_address, frame.dst);
            write_to(connections, origin, codec::render(&reply)).await;
        }
    } else {
        match codec::parse(line) {
            Ok(frame) => network.send(frame).await,
            Err(e) => log::warn!("Malformed frame {:?}: {}", line, e),
        }
    }
}

async fn write_to(connections: &Connections, id: u64, line: String) {
    if let Some(handle) = connections.lock().await.get(&id) {
        let _ = handle.sender.send(format!("{}\r\n", line));
    }
}

async fn broadcast(connections: &Connections, frame: CecFrame) {
    let line = format!("{}\r\n", codec::render(&frame));
    for handle in connections.lock().await.values() {
        let _ = handle.sender.send(line.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cec::MockCecAdapter;

    async fn start_test_server(
        adapter: MockCecAdapter,
    ) -> (
        std::net::SocketAddr,
        tokio::sync::oneshot::Sender<()>,
        Arc<HdmiNetwork<MockCecAdapter>>,
    ) {
        let network = HdmiNetwork::new(
            adapter,
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(30),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let serve_network = network.clone();
        tokio::spawn(async move {
            serve(listener, serve_network, async {
                let _ = rx.await;
            })
            .await;
        });
        (addr, tx, network)
    }

    #[tokio::test]
    async fn it_writes_a_poll_reply_only_to_the_originating_client() {
        let mut adapter = MockCecAdapter::new();
        adapter.expect_logical_address().return_const(15u8);
        adapter.expect_poll().with(mockall::predicate::eq(4u8)).returning(|_| true);

        let (addr, _shutdown, _network) = start_test_server(adapter).await;

        let mut client_a = TcpStream::connect(addr).await.unwrap();
        let mut client_b = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        client_a.write_all(b"14\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = client_a.read(&mut buf).await.unwrap();
        assert_eq!("f4\r\n", String::from_utf8_lossy(&buf[..n]));

        client_b.write_all(b"ignored\r\n").await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(100), client_b.read(&mut buf))
            .await
            .expect_err("client B should not have received the poll reply");
    }

    #[tokio::test]
    async fn it_never_calls_send_for_a_two_char_line() {
        let mut adapter = MockCecAdapter::new();
        adapter.expect_logical_address().return_const(15u8);
        adapter.expect_poll().returning(|_| false);
        // no expect_transmit: a poll-request line must never inject.

        let (addr, _shutdown, _network) = start_test_server(adapter).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.write_all(b"19\r\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn it_injects_a_longer_line_onto_the_bus() {
        let mut adapter = MockCecAdapter::new();
        adapter.expect_logical_address().return_const(15u8);
        adapter
            .expect_transmit()
            .withf(|frame| frame.src == 1 && frame.dst == 0xf && frame.opcode == Some(0x90))
            .returning(|_| Ok(()));

        let (addr, _shutdown, _network) = start_test_server(adapter).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.write_all(b"1f:90:02\r\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn it_broadcasts_unmatched_bus_frames_to_every_client() {
        let adapter = MockCecAdapter::new();
        let (addr, _shutdown, network) = start_test_server(adapter).await;

        let mut client_a = TcpStream::connect(addr).await.unwrap();
        let mut client_b = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // no device is registered for address 0, so this reaches on_command
        // and is broadcast to every connected client (spec §4.6).
        network.on_frame("0f:90:02").await;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(std::time::Duration::from_millis(200), client_a.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!("0f:90:02\r\n", String::from_utf8_lossy(&buf[..n]));

        let n = tokio::time::timeout(std::time::Duration::from_millis(200), client_b.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!("0f:90:02\r\n", String::from_utf8_lossy(&buf[..n]));
    }
}
