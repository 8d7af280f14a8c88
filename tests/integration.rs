//! End-to-end scenarios from spec.md §8, driven over a real TCP socket
//! against the full `serve`/network/server stack with `cec::FakeAdapter`
//! standing in for a physical bus (no native library, no real hardware).
//! Grounded on `original_source/pycec`'s own integration style and the
//! teacher's `kp/tests/integration.rs` `TestFixture` + `rstest::fixture` +
//! `oneshot` shutdown-channel pattern.

use std::time::Duration;

use cecbridge::cec::{FakeAdapter, FakeAdapterHandle};
use cecbridge::codec::CecFrame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Adapter's own logical address in every fixture: unregistered/broadcast
/// (15), matching a tunnel adapter's fixed address (spec §4.7) and keeping
/// poll-reply arithmetic (`self << 4 | dst`) easy to read in assertions.
const SELF_ADDRESS: u8 = 15;

struct TestFixture {
    addr: std::net::SocketAddr,
    handle: FakeAdapterHandle,
    exit_channel: Option<futures::channel::oneshot::Sender<()>>,
    serve: tokio::task::JoinHandle<()>,
}

impl TestFixture {
    async fn start(scan_interval: Duration) -> TestFixture {
        let _ = env_logger::Builder::from_default_env()
            .is_test(true)
            .try_init();

        let (adapter, handle) = FakeAdapter::new(SELF_ADDRESS);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = futures::channel::oneshot::channel();
        let serve = tokio::spawn(async move {
            cecbridge::run_with_adapter_on_listener(
                adapter,
                listener,
                Duration::from_secs(30),
                scan_interval,
                Some(rx),
            )
            .await;
        });

        // give the accept loop a moment to bind before clients connect.
        tokio::time::sleep(Duration::from_millis(20)).await;

        TestFixture {
            addr,
            handle,
            exit_channel: Some(tx),
            serve,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }
}

impl Drop for TestFixture {
    fn drop(&mut self) {
        if let Some(tx) = self.exit_channel.take() {
            let _ = tx.send(());
        }
    }
}

async fn read_line(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
        .await
        .expect("timed out waiting for a line")
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
}

async fn expect_silence(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    let result = tokio::time::timeout(Duration::from_millis(150), stream.read(&mut buf)).await;
    assert!(result.is_err(), "expected no data, got a read");
}

#[tokio::test]
async fn scenario_1_echo_round_trip() {
    // spec §8 scenario 1: client injects a frame, the bus echoes it back
    // (here: FakeAdapter's transmit loops straight through the inbound
    // callback), and the server broadcasts it to every connected client.
    let fixture = TestFixture::start(Duration::from_secs(30)).await;
    let mut client_a = fixture.connect().await;
    let mut client_b = fixture.connect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    client_a.write_all(b"1f:90:02\r\n").await.unwrap();

    assert_eq!("1f:90:02\r\n", read_line(&mut client_a).await);
    assert_eq!("1f:90:02\r\n", read_line(&mut client_b).await);
}

#[tokio::test]
async fn scenario_2_successful_poll_replies_only_to_the_originator() {
    let fixture = TestFixture::start(Duration::from_secs(30)).await;
    fixture.handle.set_present(4, true).await;

    let mut client_a = fixture.connect().await;
    let mut client_b = fixture.connect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    client_a.write_all(b"14\r\n").await.unwrap();

    assert_eq!("f4\r\n", read_line(&mut client_a).await);
    expect_silence(&mut client_b).await;
}

#[tokio::test]
async fn scenario_3_failed_poll_writes_nothing() {
    let fixture = TestFixture::start(Duration::from_secs(30)).await;
    // address 9 was never scripted present; FakeAdapter.poll defaults false.
    let mut client_a = fixture.connect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    client_a.write_all(b"19\r\n").await.unwrap();

    expect_silence(&mut client_a).await;
}

#[tokio::test]
async fn a_poll_request_never_injects_onto_the_bus() {
    // a 2-char line must never reach `network.send`/`adapter.transmit`; if
    // it mistakenly did, the fake bus would echo a broadcast "14" back in
    // addition to the synthetic poll reply. Address 4 is scripted present
    // so the reply is expected; nothing else should follow it.
    let fixture = TestFixture::start(Duration::from_secs(30)).await;
    fixture.handle.set_present(4, true).await;
    let mut client_a = fixture.connect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    client_a.write_all(b"14\r\n").await.unwrap();
    assert_eq!("f4\r\n", read_line(&mut client_a).await);
    expect_silence(&mut client_a).await;
}

#[tokio::test]
async fn device_discovery_absorbs_matched_frames_instead_of_broadcasting_them() {
    // spec §8 scenario 4 (device discovery) observed indirectly through the
    // network's public surface: once a scan has discovered address 2, an
    // inbound reply from 2 is absorbed by its device cache and therefore
    // never reaches a connected client; before discovery, the identical
    // frame has nowhere to land and is broadcast as an unmatched command.
    let fixture = TestFixture::start(Duration::from_millis(120)).await;
    let mut client = fixture.connect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let osd_name_reply = CecFrame::new(2, SELF_ADDRESS, 0x47, "Onkyo".bytes().collect());

    // not yet discovered: no device exists for address 2, so the frame is
    // forwarded to the command sink and broadcast.
    fixture.handle.inject(&osd_name_reply).await;
    assert_eq!("2f:47:4f:6e:6b:79:6f\r\n", read_line(&mut client).await);

    // scripted present, wait for at least one scan cycle to discover it.
    // `watch()`'s first iteration always spends the 1s init-retry delay
    // before its first `scan()` (spec §4.5/§9), so this has to clear
    // comfortably more than 1s, not just one `scan_interval`.
    fixture.handle.set_present(2, true).await;
    tokio::time::sleep(Duration::from_millis(1300)).await;

    // drain whatever the device's own refresh-loop requests produced (the
    // fake adapter echoes every transmitted frame back through the
    // callback, so the freshly-started device's own poll requests show up
    // here too; none of them match anything and all get broadcast).
    loop {
        let drained = tokio::time::timeout(Duration::from_millis(50), client.read(&mut [0u8; 4096])).await;
        if drained.is_err() {
            break;
        }
    }

    fixture.handle.inject(&osd_name_reply).await;
    expect_silence(&mut client).await;
}

#[tokio::test]
async fn it_shuts_down_cleanly_when_the_exit_channel_resolves() {
    let mut fixture = TestFixture::start(Duration::from_secs(30)).await;
    // spec.md:157: shutdown closes the listening socket, then the
    // connection set; a client left connected at shutdown time must see
    // its connection closed, not leaked past the server task's exit.
    let mut client = fixture.connect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sender = fixture.exit_channel.take().unwrap();
    let _ = sender.send(());

    tokio::time::timeout(Duration::from_secs(2), &mut fixture.serve)
        .await
        .expect("serve task did not shut down promptly")
        .expect("serve task panicked");

    let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut [0u8; 16]))
        .await
        .expect("client connection was never closed by the server")
        .unwrap();
    assert_eq!(0, n, "expected EOF on the still-open client connection");
}
