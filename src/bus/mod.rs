//! Credit-based serial bus controller protocol.
//!
//! The panel-side bus controller has a receive buffer of only a few dozen
//! bytes, so the export stream cannot simply be written through. Instead
//! the controller grants a single-slot credit: after it reports ready, the
//! bridge may send exactly one framed chunk and must then wait for the next
//! ready notification. Inbound bytes from the device are single-byte status
//! notifications, optionally followed by a size-prefixed command message
//! that is relayed back to the simulator.

mod ring;

pub use ring::ByteRingBuffer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::{BusError, Result};
use crate::protocol::StreamListener;
use crate::receiver::CommandSink;

/// Command byte asking the controller to report its status.
const CMD_REQUEST_STATUS: u8 = b's';

/// Command byte prefixing a chunk of export stream data.
const CMD_LOAD_EXPORT_DATA: u8 = b'e';

/// Controller is ready for the next chunk.
const STATUS_READY: u8 = b'r';

/// Controller's receive buffer is full.
const STATUS_BUFFER_FULL: u8 = b't';

/// Controller acknowledged a chunk.
const STATUS_DATA_RECEIVED: u8 = b'v';

/// Controller failed to load the last chunk.
const STATUS_ERROR_LOADING: u8 = b'x';

/// A device command message follows (size byte, then data).
const STATUS_MESSAGE: u8 = b'm';

/// Largest chunk the controller's receive buffer accepts.
pub const MAX_CHUNK: usize = 64;

/// Expected upper bound on device command messages. The size byte is
/// authoritative for classification, so larger messages are still consumed
/// whole, just flagged.
const MAX_MESSAGE: usize = 64;

/// Default ring buffer capacity; generous relative to the export stream's
/// burst size (one frame per simulator tick, at most a couple of datagrams).
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Opaque byte-duplex endpoint for the serial device.
///
/// The physical driver is deliberately outside this crate; implementations
/// wrap whatever serial library the host application uses (the controller
/// expects 250000 baud, 8 data bits, 1 stop bit, no parity, no hardware
/// flow control) and call
/// [`BusController::process_serial_input`] from their data-available
/// callback.
pub trait SerialLink: Send + Sync {
    /// Write the full buffer to the device.
    fn write(&self, data: &[u8]) -> Result<()>;
}

/// Inbound byte classification, orthogonal to the credit flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundState {
    AwaitingNotification,
    MessageSize,
    MessageData,
}

/// State shared between the ingest path and the serial notification path.
/// One lock guards all of it; both paths read-modify the credit flag and
/// the buffer.
struct BusState {
    ring: ByteRingBuffer,
    device_ready: bool,
    status_request_pending: bool,
    inbound: InboundState,
    message_size: usize,
    message: Vec<u8>,
}

/// Snapshot of bus controller activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    /// Chunks flushed to the device.
    pub chunks_flushed: u64,
    /// Stream bytes flushed (excludes framing).
    pub bytes_flushed: u64,
    /// Device command messages relayed to the simulator.
    pub commands_relayed: u64,
    /// Chunk acknowledgments (`v`) seen.
    pub chunks_acked: u64,
    /// Load errors (`x`) reported by the device.
    pub load_errors: u64,
    /// Unrecognized notification bytes.
    pub unknown_notifications: u64,
    /// True once the ring buffer has overflowed; the controller no longer
    /// accepts stream data.
    pub faulted: bool,
}

#[derive(Default)]
struct Counters {
    chunks_flushed: AtomicU64,
    bytes_flushed: AtomicU64,
    commands_relayed: AtomicU64,
    chunks_acked: AtomicU64,
    load_errors: AtomicU64,
    unknown_notifications: AtomicU64,
    faulted: AtomicBool,
}

/// Drives the credit-based handshake between the export stream and a serial
/// bus controller.
///
/// Register it as a [`StreamListener`] on the receiver to feed it the raw
/// export stream; wire the serial driver's receive callback to
/// [`process_serial_input`](Self::process_serial_input).
pub struct BusController {
    link: Arc<dyn SerialLink>,
    sink: Arc<dyn CommandSink>,
    state: Mutex<BusState>,
    counters: Counters,
    max_chunk: usize,
}

impl BusController {
    /// Create a controller with default buffer capacity and chunk size.
    pub fn new(link: Arc<dyn SerialLink>, sink: Arc<dyn CommandSink>) -> Self {
        Self::with_capacity(link, sink, DEFAULT_BUFFER_CAPACITY, MAX_CHUNK)
    }

    /// Create a controller with explicit buffer capacity and chunk size.
    pub fn with_capacity(
        link: Arc<dyn SerialLink>,
        sink: Arc<dyn CommandSink>,
        buffer_capacity: usize,
        max_chunk: usize,
    ) -> Self {
        Self {
            link,
            sink,
            state: Mutex::new(BusState {
                ring: ByteRingBuffer::new(buffer_capacity),
                device_ready: false,
                status_request_pending: false,
                inbound: InboundState::AwaitingNotification,
                message_size: 0,
                message: Vec::with_capacity(MAX_MESSAGE),
            }),
            counters: Counters::default(),
            max_chunk: max_chunk.min(MAX_CHUNK),
        }
    }

    /// Ask the controller to report its status.
    ///
    /// Sent once after opening the serial link; not repeated while a
    /// request is outstanding.
    pub fn request_status(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.status_request_pending {
            self.link.write(&[CMD_REQUEST_STATUS])?;
            state.status_request_pending = true;
            debug!("requested controller status");
        }
        Ok(())
    }

    /// Append export-stream bytes and flush a chunk if the device has
    /// granted a credit.
    ///
    /// Overflow is a fatal configuration error: the controller latches a
    /// fault and refuses further data rather than silently dropping bytes
    /// and desynchronizing its accounting.
    pub fn ingest(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if self.counters.faulted.load(Ordering::Relaxed) {
            return Err(BusError::Faulted.into());
        }
        if let Err(overflow) = state.ring.extend_from_slice(data) {
            self.counters.faulted.store(true, Ordering::Relaxed);
            error!(
                capacity = state.ring.capacity(),
                "ring buffer overflow; bus controller faulted"
            );
            return Err(overflow.into());
        }
        self.flush_locked(&mut state)
    }

    /// Process bytes arriving from the serial device.
    ///
    /// Called from the serial driver's data-available callback; may run
    /// concurrently with [`ingest`](Self::ingest), serialized by the state
    /// lock.
    pub fn process_serial_input(&self, data: &[u8]) {
        // Completed command messages are relayed after the lock is
        // released so the sink never runs under it.
        let mut completed: Vec<Vec<u8>> = Vec::new();

        {
            let mut state = self.state.lock();
            for &byte in data {
                match state.inbound {
                    InboundState::AwaitingNotification => {
                        self.handle_notification(&mut state, byte);
                    }
                    InboundState::MessageSize => {
                        state.message_size = usize::from(byte);
                        state.message.clear();
                        if state.message_size > MAX_MESSAGE {
                            warn!(
                                size = state.message_size,
                                "device message exceeds expected maximum"
                            );
                        }
                        state.inbound = if state.message_size == 0 {
                            InboundState::AwaitingNotification
                        } else {
                            InboundState::MessageData
                        };
                    }
                    InboundState::MessageData => {
                        state.message.push(byte);
                        if state.message.len() == state.message_size {
                            completed.push(std::mem::take(&mut state.message));
                            state.inbound = InboundState::AwaitingNotification;
                        }
                    }
                }
            }
        }

        for command in completed {
            trace!(len = command.len(), "relaying device command");
            self.sink.send_command(&command);
            self.counters.commands_relayed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Activity counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            chunks_flushed: self.counters.chunks_flushed.load(Ordering::Relaxed),
            bytes_flushed: self.counters.bytes_flushed.load(Ordering::Relaxed),
            commands_relayed: self.counters.commands_relayed.load(Ordering::Relaxed),
            chunks_acked: self.counters.chunks_acked.load(Ordering::Relaxed),
            load_errors: self.counters.load_errors.load(Ordering::Relaxed),
            unknown_notifications: self.counters.unknown_notifications.load(Ordering::Relaxed),
            faulted: self.counters.faulted.load(Ordering::Relaxed),
        }
    }

    /// Bytes currently buffered for the device.
    pub fn buffered(&self) -> usize {
        self.state.lock().ring.len()
    }

    fn handle_notification(&self, state: &mut BusState, byte: u8) {
        match byte {
            STATUS_READY => {
                trace!("controller ready for data");
                state.status_request_pending = false;
                state.device_ready = true;
                if let Err(e) = self.flush_locked(state) {
                    warn!("flush after ready notification failed: {e}");
                }
            }
            STATUS_BUFFER_FULL => {
                trace!("controller buffer full");
                state.status_request_pending = false;
                state.device_ready = false;
            }
            STATUS_DATA_RECEIVED => {
                trace!("controller acknowledged chunk");
                self.counters.chunks_acked.fetch_add(1, Ordering::Relaxed);
            }
            STATUS_ERROR_LOADING => {
                warn!("controller reported error loading data");
                self.counters.load_errors.fetch_add(1, Ordering::Relaxed);
                state.device_ready = false;
            }
            STATUS_MESSAGE => {
                state.inbound = InboundState::MessageSize;
            }
            other => {
                warn!(byte = other, "unexpected notification from controller");
                self.counters
                    .unknown_notifications
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Flush one chunk if a credit is held and data is buffered. Consumes
    /// the credit: another flush needs the next ready notification.
    fn flush_locked(&self, state: &mut BusState) -> Result<()> {
        if !state.device_ready || state.ring.is_empty() {
            return Ok(());
        }

        let size = state.ring.len().min(self.max_chunk);
        let mut frame = Vec::with_capacity(size + 3);
        frame.push(CMD_LOAD_EXPORT_DATA);
        frame.push(size as u8);
        let mut checksum = size as u8;
        for _ in 0..size {
            // Accounting guarantees the bytes are present.
            let byte = state.ring.pop().unwrap_or_default();
            checksum = checksum.wrapping_add(byte);
            frame.push(byte);
        }
        frame.push(checksum);

        self.link.write(&frame)?;
        state.device_ready = false;

        self.counters.chunks_flushed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_flushed
            .fetch_add(size as u64, Ordering::Relaxed);
        trace!(size, remaining = state.ring.len(), "flushed chunk");
        Ok(())
    }
}

impl StreamListener for BusController {
    fn stream_data(&self, data: &[u8]) {
        if let Err(e) = self.ingest(data) {
            if self.counters.faulted.load(Ordering::Relaxed) {
                debug!("dropping stream data, controller faulted: {e}");
            } else {
                error!("failed to ingest stream data: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockLink {
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl SerialLink for MockLink {
        fn write(&self, data: &[u8]) -> Result<()> {
            self.writes.lock().push(data.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockSink {
        commands: Mutex<Vec<Vec<u8>>>,
    }

    impl CommandSink for MockSink {
        fn send_command(&self, command: &[u8]) {
            self.commands.lock().push(command.to_vec());
        }
    }

    fn controller() -> (Arc<BusController>, Arc<MockLink>, Arc<MockSink>) {
        let link = Arc::new(MockLink::default());
        let sink = Arc::new(MockSink::default());
        let bus = Arc::new(BusController::new(link.clone(), sink.clone()));
        (bus, link, sink)
    }

    #[test]
    fn no_flush_without_credit() {
        let (bus, link, _) = controller();
        bus.ingest(&[1, 2, 3]).unwrap();
        assert!(link.writes.lock().is_empty());
        assert_eq!(bus.buffered(), 3);
    }

    #[test]
    fn ready_notification_flushes_buffered_data() {
        let (bus, link, _) = controller();
        bus.ingest(&[0x10, 0x20, 0x30]).unwrap();
        bus.process_serial_input(&[STATUS_READY]);

        let writes = link.writes.lock();
        assert_eq!(writes.len(), 1);
        let checksum = 3u8
            .wrapping_add(0x10)
            .wrapping_add(0x20)
            .wrapping_add(0x30);
        assert_eq!(writes[0], vec![CMD_LOAD_EXPORT_DATA, 3, 0x10, 0x20, 0x30, checksum]);
        assert_eq!(bus.stats().chunks_flushed, 1);
    }

    #[test]
    fn one_flush_per_credit() {
        let (bus, link, _) = controller();
        bus.process_serial_input(&[STATUS_READY]);
        // Credit armed with empty buffer: first ingest flushes immediately,
        // the second must wait for another ready.
        bus.ingest(&[1]).unwrap();
        bus.ingest(&[2]).unwrap();
        assert_eq!(link.writes.lock().len(), 1);
        bus.process_serial_input(&[STATUS_READY]);
        assert_eq!(link.writes.lock().len(), 2);
    }

    #[test]
    fn chunk_never_exceeds_device_payload() {
        let (bus, link, _) = controller();
        let data = vec![0xAB; 200];
        bus.ingest(&data).unwrap();
        bus.process_serial_input(&[STATUS_READY]);

        let writes = link.writes.lock();
        assert_eq!(writes[0].len(), MAX_CHUNK + 3);
        assert_eq!(writes[0][1] as usize, MAX_CHUNK);
        drop(writes);
        assert_eq!(bus.buffered(), 200 - MAX_CHUNK);
    }

    #[test]
    fn buffer_full_revokes_credit() {
        let (bus, link, _) = controller();
        bus.process_serial_input(&[STATUS_READY, STATUS_BUFFER_FULL]);
        bus.ingest(&[1, 2]).unwrap();
        assert!(link.writes.lock().is_empty());
    }

    #[test]
    fn load_error_revokes_credit() {
        let (bus, link, _) = controller();
        bus.process_serial_input(&[STATUS_READY, STATUS_ERROR_LOADING]);
        bus.ingest(&[1]).unwrap();
        assert!(link.writes.lock().is_empty());
        assert_eq!(bus.stats().load_errors, 1);
    }

    #[test]
    fn message_notification_relays_command() {
        let (bus, _, sink) = controller();
        let mut bytes = vec![STATUS_MESSAGE, 7];
        bytes.extend_from_slice(b"TEST 1\n");
        bus.process_serial_input(&bytes);

        assert_eq!(*sink.commands.lock(), vec![b"TEST 1\n".to_vec()]);
        assert_eq!(bus.stats().commands_relayed, 1);
    }

    #[test]
    fn message_split_across_callbacks() {
        let (bus, _, sink) = controller();
        bus.process_serial_input(&[STATUS_MESSAGE]);
        bus.process_serial_input(&[4, b'A', b'B']);
        assert!(sink.commands.lock().is_empty());
        bus.process_serial_input(&[b'C', b'D', STATUS_READY]);
        assert_eq!(*sink.commands.lock(), vec![b"ABCD".to_vec()]);
    }

    #[test]
    fn notifications_resume_after_message() {
        let (bus, link, _) = controller();
        bus.ingest(&[9]).unwrap();
        bus.process_serial_input(&[STATUS_MESSAGE, 1, b'Z', STATUS_READY]);
        // The ready byte after the message still granted a credit.
        assert_eq!(link.writes.lock().len(), 1);
    }

    #[test]
    fn long_message_bytes_never_read_as_notifications() {
        let (bus, link, sink) = controller();
        bus.ingest(&[1, 2, 3]).unwrap();

        // Size byte says 100; every payload byte is 'r', which as a
        // notification would grant a credit and flush.
        let mut bytes = vec![STATUS_MESSAGE, 100];
        bytes.extend(std::iter::repeat(STATUS_READY).take(100));
        bus.process_serial_input(&bytes);

        assert_eq!(sink.commands.lock()[0].len(), 100);
        assert!(link.writes.lock().is_empty());
        assert_eq!(bus.buffered(), 3);

        // Classification is back in sync afterward.
        bus.process_serial_input(&[STATUS_READY]);
        assert_eq!(link.writes.lock().len(), 1);
    }

    #[test]
    fn status_request_not_repeated_while_pending() {
        let (bus, link, _) = controller();
        bus.request_status().unwrap();
        bus.request_status().unwrap();
        assert_eq!(link.writes.lock().len(), 1);
        // A status reply clears the latch.
        bus.process_serial_input(&[STATUS_BUFFER_FULL]);
        bus.request_status().unwrap();
        assert_eq!(link.writes.lock().len(), 2);
    }

    #[test]
    fn link_write_failure_propagates_from_flush() {
        struct FailingLink;
        impl SerialLink for FailingLink {
            fn write(&self, _data: &[u8]) -> Result<()> {
                Err(BusError::WriteFailed("port closed".into()).into())
            }
        }

        let bus = BusController::new(Arc::new(FailingLink), Arc::new(MockSink::default()));
        assert!(bus.request_status().is_err());
        bus.process_serial_input(&[STATUS_READY]);
        assert!(matches!(
            bus.ingest(&[1]),
            Err(crate::Error::Bus(BusError::WriteFailed(_)))
        ));
    }

    #[test]
    fn overflow_latches_fault() {
        let link = Arc::new(MockLink::default());
        let sink = Arc::new(MockSink::default());
        let bus = BusController::with_capacity(link, sink, 4, MAX_CHUNK);

        assert!(bus.ingest(&[1, 2, 3, 4, 5]).is_err());
        assert!(bus.stats().faulted);
        // Further ingest is refused outright.
        assert!(matches!(
            bus.ingest(&[6]),
            Err(crate::Error::Bus(BusError::Faulted))
        ));
    }
}
