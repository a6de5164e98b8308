//! UDP receiver for the simulator export stream.
//!
//! Owns the network endpoint and the background receive loop. Each datagram
//! is fed to the owned [`StreamParser`] and fanned out verbatim to raw-byte
//! stream listeners. The sender's address is remembered so commands can be
//! returned to the simulator on the command port.

use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::error::Result;
use crate::protocol::{
    DataListener, ParserStats, StreamListener, StreamParser, StreamRegistry, SyncListener,
};
use crate::transport::{bind_stream_socket, SocketConfig};
use crate::MAX_DATAGRAM;

/// Anything that can carry a command back to the simulator.
///
/// The seam between the bus controller and the receiver; sends are
/// fire-and-forget.
pub trait CommandSink: Send + Sync {
    /// Send a command datagram upstream. Never blocks, never errors; a
    /// send with no known peer is a no-op.
    fn send_command(&self, command: &[u8]);
}

struct Shared {
    socket: UdpSocket,
    /// Address of the simulator we last heard from.
    peer: RwLock<Option<IpAddr>>,
    command_port: u16,
    /// Loop-exit request flag; cleared by `stop()` and by fatal errors.
    running: AtomicBool,
    recv_timeout: Duration,
    stream_listeners: Mutex<Vec<Arc<dyn StreamListener>>>,
}

impl Shared {
    fn notify_stream(&self, data: &[u8]) {
        let snapshot = self.stream_listeners.lock().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener.stream_data(data))).is_err() {
                warn!("stream listener panicked during dispatch");
            }
        }
    }
}

/// Receiver for the simulator's UDP export stream.
///
/// `start()` and `stop()` are idempotent. The receive call uses a bounded
/// wait so a stop request is observed within about a second. A non-timeout
/// socket error is fatal for this instance: the loop stops and stays
/// stopped; restart policy belongs to the caller.
pub struct UdpReceiver {
    shared: Arc<Shared>,
    parser: Arc<Mutex<StreamParser>>,
    registry: Arc<StreamRegistry>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UdpReceiver {
    /// Create a receiver from configuration. Binds the socket (and joins
    /// the multicast group, if configured) immediately; the receive loop
    /// starts with [`start`](Self::start).
    pub fn new(config: &ReceiverConfig) -> Result<Self> {
        let socket = bind_stream_socket(config.group, config.port, &SocketConfig::default())?;
        let parser = StreamParser::new();
        let registry = parser.registry();

        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                peer: RwLock::new(None),
                command_port: config.command_port,
                running: AtomicBool::new(false),
                recv_timeout: config.recv_timeout,
                stream_listeners: Mutex::new(Vec::new()),
            }),
            parser: Arc::new(Mutex::new(parser)),
            registry,
            handle: Mutex::new(None),
        })
    }

    /// Create a receiver with the default multicast group and ports.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&ReceiverConfig::default())
    }

    /// Begin the receive loop. Idempotent; must be called from within a
    /// tokio runtime.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let parser = Arc::clone(&self.parser);
        *handle = Some(tokio::spawn(receive_loop(shared, parser)));
        info!("receiver started");
    }

    /// Request the receive loop to exit. Best-effort and bounded by the
    /// receive timeout; does not wait for the loop to finish.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!("receiver stop requested");
        }
    }

    /// Wait for the receive loop task to finish, if one was started.
    pub async fn stopped(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// True while the receive loop task is alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Address of the simulator we last received from, if any.
    pub fn peer(&self) -> Option<IpAddr> {
        *self.shared.peer.read()
    }

    /// Local address of the stream socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Register a data listener on the owned parser.
    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.registry.add_data_listener(listener);
    }

    /// Remove a data listener.
    pub fn remove_data_listener(&self, listener: &Arc<dyn DataListener>) {
        self.registry.remove_data_listener(listener);
    }

    /// Register a sync listener on the owned parser.
    pub fn add_sync_listener(&self, listener: Arc<dyn SyncListener>) {
        self.registry.add_sync_listener(listener);
    }

    /// Remove a sync listener.
    pub fn remove_sync_listener(&self, listener: &Arc<dyn SyncListener>) {
        self.registry.remove_sync_listener(listener);
    }

    /// Register a raw-byte stream listener.
    pub fn add_stream_listener(&self, listener: Arc<dyn StreamListener>) {
        let mut listeners = self.shared.stream_listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a stream listener.
    pub fn remove_stream_listener(&self, listener: &Arc<dyn StreamListener>) {
        self.shared
            .stream_listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Parser activity counters.
    pub fn parser_stats(&self) -> ParserStats {
        self.parser.lock().stats()
    }

    /// Send a command datagram to the last-seen simulator address.
    ///
    /// Fire-and-forget: a no-op when no peer has been observed or the
    /// receiver has been stopped; transmit failures are logged and
    /// swallowed, never queued.
    pub fn send_command(&self, command: &[u8]) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        let Some(ip) = *self.shared.peer.read() else {
            return;
        };
        let target = SocketAddr::new(ip, self.shared.command_port);
        match self.shared.socket.try_send_to(command, target) {
            Ok(_) => {}
            Err(e) => debug!(%target, "command send failed: {e}"),
        }
    }

    /// Send a text command to the last-seen simulator address.
    pub fn send_command_str(&self, command: &str) {
        self.send_command(command.as_bytes());
    }
}

impl CommandSink for UdpReceiver {
    fn send_command(&self, command: &[u8]) {
        UdpReceiver::send_command(self, command);
    }
}

async fn receive_loop(shared: Arc<Shared>, parser: Arc<Mutex<StreamParser>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    debug!("entering receive loop");

    while shared.running.load(Ordering::Acquire) {
        match timeout(shared.recv_timeout, shared.socket.recv_from(&mut buf)).await {
            // Timeout is expected; it is what lets a stop request be
            // observed promptly.
            Err(_elapsed) => {}

            Ok(Ok((len, addr))) => {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                *shared.peer.write() = Some(addr.ip());
                parser.lock().process_buffer(&buf[..len]);
                shared.notify_stream(&buf[..len]);
            }

            Ok(Err(e)) => {
                error!("error receiving export datagram, shutting down receiver: {e}");
                shared.running.store(false, Ordering::Release);
                break;
            }
        }
    }

    debug!("exiting receive loop");
}
