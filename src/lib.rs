pub mod cec;
pub mod codec;
pub mod configuration;
mod device;
mod error;
mod network;
mod physical_address;
mod server;

pub use error::BridgeError;

use std::sync::Arc;

use configuration::{BridgeConfiguration, Mode};

/// Wires adapter + network + TCP server together and runs until
/// `exit_channel` resolves (or, if `None`, until Ctrl+C/SIGTERM) — the
/// bridge's single entry point, mirroring the teacher's `serve_kp`.
pub async fn serve(
    configuration: &BridgeConfiguration,
    exit_channel: Option<futures::channel::oneshot::Receiver<()>>,
) {
    let mode = match configuration.server.resolve_mode() {
        Ok(mode) => mode,
        Err(e) => {
            log::error!("{}", e);
            return;
        }
    };

    let update_period = std::time::Duration::from_secs(configuration.network.update_period_secs);
    let scan_interval = std::time::Duration::from_secs(configuration.network.scan_interval_secs);

    match mode {
        Mode::Server if configuration.cec.fake_target.is_some() => {
            let (adapter, _handle) = cec::FakeAdapter::new(cec::BROADCAST_ADDRESS);
            run_with_adapter(
                adapter,
                configuration.server.bind_address(),
                configuration.server.port,
                update_period,
                scan_interval,
                exit_channel,
            )
            .await;
        }
        Mode::Server => {
            let adapter = match cec::NativeAdapter::new(
                &configuration.cec.client_version,
                &configuration.cec.device_name,
            ) {
                Ok(adapter) => adapter,
                Err(e) => {
                    log::error!("Invalid CEC configuration: {:?}", e);
                    return;
                }
            };
            run_with_adapter(
                adapter,
                configuration.server.bind_address(),
                configuration.server.port,
                update_period,
                scan_interval,
                exit_channel,
            )
            .await;
        }
        Mode::Client => {
            let adapter = cec::TunnelAdapter::new(configuration.server.peer_host(), configuration.server.port);
            run_with_adapter(
                adapter,
                configuration.server.bind_address(),
                configuration.server.port,
                update_period,
                scan_interval,
                exit_channel,
            )
            .await;
        }
    }
}

/// Runs the bridge against any `CecAdapter`, bound to `bind_address:port`.
pub async fn run_with_adapter<A: cec::CecAdapter + 'static>(
    adapter: A,
    bind_address: String,
    port: u16,
    update_period: std::time::Duration,
    scan_interval: std::time::Duration,
    exit_channel: Option<futures::channel::oneshot::Receiver<()>>,
) {
    let listen_addr = format!("{}:{}", bind_address, port);
    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {}", listen_addr, e);
            return;
        }
    };
    log::info!("Listening on {}", listen_addr);
    run_with_adapter_on_listener(adapter, listener, update_period, scan_interval, exit_channel).await;
}

/// Same as [`run_with_adapter`] but against an already-bound listener,
/// until `exit_channel` resolves. A public seam so integration tests can
/// drive the full network/server stack — on an ephemeral port, against
/// `cec::FakeAdapter` (spec §0.5) — instead of going through `serve`'s mode
/// derivation and a fixed bind address.
pub async fn run_with_adapter_on_listener<A: cec::CecAdapter + 'static>(
    adapter: A,
    listener: tokio::net::TcpListener,
    update_period: std::time::Duration,
    scan_interval: std::time::Duration,
    exit_channel: Option<futures::channel::oneshot::Receiver<()>>,
) {
    let network = network::HdmiNetwork::new(adapter, update_period, scan_interval);

    let watch_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let watch_network = network.clone();
    let watch_stop_clone = watch_stop.clone();
    let watch_task = tokio::spawn(async move {
        watch_network.watch(watch_stop_clone).await;
    });

    server::serve(listener, network.clone(), shutdown_signal(exit_channel)).await;

    watch_stop.store(true, std::sync::atomic::Ordering::SeqCst);
    let _ = watch_task.await;
    network.shutdown().await;
}

async fn shutdown_signal(exit_channel: Option<futures::channel::oneshot::Receiver<()>>) {
    use futures::FutureExt;

    let mut exit_channel = match exit_channel {
        Some(receiver) => receiver.fuse(),
        None => {
            let (_sender, receiver) = futures::channel::oneshot::channel::<()>();
            // the sender is leaked deliberately: with no injected exit
            // channel, only Ctrl+C/SIGTERM below can end the process.
            std::mem::forget(_sender);
            receiver.fuse()
        }
    };

    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c()).fuse();

    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Could not intercept TERM signal");
    let mut term = Box::pin(term.recv()).fuse();

    futures::select! {
        c = ctrl_c => log::info!("Received Ctrl+C, exiting: {:?}", c),
        r = exit_channel => log::info!("Received exit signal: {:?}", r),
        t = term => log::info!("Received terminate signal: {:?}", t),
    }
}
