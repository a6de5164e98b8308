//! Export-stream parser.
//!
//! Decodes the simulator's unbounded byte stream into `(address, value)`
//! writes and frame-sync events. The stream is lossy by design: recovery
//! from truncation or corruption is driven solely by runs of four
//! consecutive sync bytes, after which the parser starts reading a fresh
//! address field.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::{
    DataListener, SyncListener, FRAME_SYNC_ADDRESS, NOOP_ADDRESS, SYNC_BYTE, SYNC_RUN,
};

/// Parser position within the record grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    WaitForSync,
    AddressLow,
    AddressHigh,
    CountLow,
    CountHigh,
    DataLow,
    DataHigh,
}

/// Counters describing parser activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Data events dispatched.
    pub data_events: u64,
    /// Complete frames seen (frame-sync events dispatched).
    pub frames: u64,
    /// Forced resynchronizations from a run of sync bytes.
    pub resyncs: u64,
}

/// Registry of data and sync listeners.
///
/// Insertion-ordered and duplicate-free. A snapshot is taken under the lock
/// before each notification pass, so listeners may add or remove themselves
/// (or each other) from inside a callback, and registration never waits on
/// an active dispatch.
#[derive(Default)]
pub struct StreamRegistry {
    data: Mutex<Vec<Arc<dyn DataListener>>>,
    sync: Mutex<Vec<Arc<dyn SyncListener>>>,
}

impl StreamRegistry {
    /// Register a data listener. Re-adding the same listener is a no-op.
    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        let mut listeners = self.data.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a previously registered data listener.
    pub fn remove_data_listener(&self, listener: &Arc<dyn DataListener>) {
        self.data.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Register a sync listener. Re-adding the same listener is a no-op.
    pub fn add_sync_listener(&self, listener: Arc<dyn SyncListener>) {
        let mut listeners = self.sync.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a previously registered sync listener.
    pub fn remove_sync_listener(&self, listener: &Arc<dyn SyncListener>) {
        self.sync.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn snapshot_data(&self) -> Vec<Arc<dyn DataListener>> {
        self.data.lock().clone()
    }

    fn snapshot_sync(&self) -> Vec<Arc<dyn SyncListener>> {
        self.sync.lock().clone()
    }
}

/// State machine decoding the simulator export protocol byte by byte.
///
/// Byte processing is single-writer: exactly one feeder is expected to call
/// [`process_byte`](Self::process_byte) / [`process_buffer`](Self::process_buffer).
/// Listener registration goes through the shared [`StreamRegistry`] and is
/// safe from any thread at any time.
pub struct StreamParser {
    state: ParserState,
    sync_run: u8,
    address: u16,
    remaining: u16,
    value: u16,
    stats: ParserStats,
    registry: Arc<StreamRegistry>,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Create a parser waiting for its first sync sequence.
    pub fn new() -> Self {
        Self {
            state: ParserState::WaitForSync,
            sync_run: 0,
            address: 0,
            remaining: 0,
            value: 0,
            stats: ParserStats::default(),
            registry: Arc::new(StreamRegistry::default()),
        }
    }

    /// Shared handle to the listener registry.
    pub fn registry(&self) -> Arc<StreamRegistry> {
        Arc::clone(&self.registry)
    }

    /// Register a data listener.
    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.registry.add_data_listener(listener);
    }

    /// Register a sync listener.
    pub fn add_sync_listener(&self, listener: Arc<dyn SyncListener>) {
        self.registry.add_sync_listener(listener);
    }

    /// Activity counters.
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// True when the parser expects the low byte of a record address next.
    /// Diagnostic only; the normal post-record and post-resync position.
    pub fn awaiting_address(&self) -> bool {
        self.state == ParserState::AddressLow
    }

    /// Process a slice of stream data, byte by byte.
    pub fn process_buffer(&mut self, data: &[u8]) {
        for &byte in data {
            self.process_byte(byte);
        }
    }

    /// Process the next byte of the export stream, dispatching any events
    /// it completes.
    pub fn process_byte(&mut self, byte: u8) {
        match self.state {
            // Sync runs are handled below regardless of state.
            ParserState::WaitForSync => {}

            ParserState::AddressLow => {
                self.address = u16::from(byte);
                self.state = ParserState::AddressHigh;
            }

            ParserState::AddressHigh => {
                self.address |= u16::from(byte) << 8;
                if self.address == NOOP_ADDRESS {
                    // "No more data this cycle" marker inside the address
                    // field; emit nothing and wait for the next sync run.
                    self.state = ParserState::WaitForSync;
                } else {
                    self.state = ParserState::CountLow;
                }
            }

            ParserState::CountLow => {
                self.remaining = u16::from(byte);
                self.state = ParserState::CountHigh;
            }

            ParserState::CountHigh => {
                self.remaining |= u16::from(byte) << 8;
                self.state = ParserState::DataLow;
            }

            ParserState::DataLow => {
                self.value = u16::from(byte);
                self.remaining = self.remaining.wrapping_sub(1);
                self.state = ParserState::DataHigh;
            }

            ParserState::DataHigh => {
                self.value |= u16::from(byte) << 8;
                self.remaining = self.remaining.wrapping_sub(1);
                if self.remaining == 0 {
                    self.state = ParserState::AddressLow;
                    if self.address == FRAME_SYNC_ADDRESS {
                        self.notify_sync();
                    } else {
                        self.notify_data();
                    }
                } else {
                    self.notify_data();
                    self.address = self.address.wrapping_add(2);
                    self.state = ParserState::DataLow;
                }
            }
        }

        // Sync markers are tracked outside the state machine so a run can
        // recover the parser from lost data in any state. The transmitter
        // is responsible for keeping the run pattern out of real data.
        if byte == SYNC_BYTE {
            self.sync_run += 1;
            if self.sync_run == SYNC_RUN {
                self.state = ParserState::AddressLow;
                self.sync_run = 0;
                self.stats.resyncs += 1;
            }
        } else {
            self.sync_run = 0;
        }
    }

    fn notify_data(&mut self) {
        let (address, value) = (self.address, self.value);
        for listener in self.registry.snapshot_data() {
            let result = catch_unwind(AssertUnwindSafe(|| listener.data_written(address, value)));
            if result.is_err() {
                warn!(address, "data listener panicked during dispatch");
            }
        }
        self.stats.data_events += 1;
    }

    fn notify_sync(&mut self) {
        for listener in self.registry.snapshot_sync() {
            if catch_unwind(AssertUnwindSafe(|| listener.frame_sync())).is_err() {
                warn!("sync listener panicked during dispatch");
            }
        }
        self.stats.frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(u16, u16)>>,
        syncs: Mutex<u32>,
    }

    impl DataListener for Recorder {
        fn data_written(&self, address: u16, value: u16) {
            self.writes.lock().push((address, value));
        }
    }

    impl SyncListener for Recorder {
        fn frame_sync(&self) {
            *self.syncs.lock() += 1;
        }
    }

    fn parser_with_recorder() -> (StreamParser, Arc<Recorder>) {
        let parser = StreamParser::new();
        let recorder = Arc::new(Recorder::default());
        parser.add_data_listener(recorder.clone());
        parser.add_sync_listener(recorder.clone());
        (parser, recorder)
    }

    #[test]
    fn ignores_bytes_before_first_sync() {
        let (mut parser, recorder) = parser_with_recorder();
        parser.process_buffer(&[0x01, 0x02, 0x03, 0x00, 0x00, 0xff]);
        assert!(recorder.writes.lock().is_empty());
        assert!(!parser.awaiting_address());
    }

    #[test]
    fn decodes_single_record() {
        let (mut parser, recorder) = parser_with_recorder();
        parser.process_buffer(&[0x55, 0x55, 0x55, 0x55, 0x10, 0x20, 0x02, 0x00, 0x34, 0x12]);
        assert_eq!(*recorder.writes.lock(), vec![(0x2010, 0x1234)]);
        assert!(parser.awaiting_address());
    }

    #[test]
    fn multi_word_record_advances_address_by_two() {
        let (mut parser, recorder) = parser_with_recorder();
        parser.process_buffer(&[
            0x55, 0x55, 0x55, 0x55, // sync
            0x00, 0x01, 0x06, 0x00, // address 0x0100, six bytes
            0x01, 0x00, 0x02, 0x00, 0x03, 0x00,
        ]);
        assert_eq!(
            *recorder.writes.lock(),
            vec![(0x0100, 1), (0x0102, 2), (0x0104, 3)]
        );
    }

    #[test]
    fn noop_address_emits_nothing() {
        let (mut parser, recorder) = parser_with_recorder();
        parser.process_buffer(&[0x55, 0x55, 0x55, 0x55]);
        // 0x5555 little-endian in the address field: resync marker.
        parser.process_buffer(&[0x55, 0x55]);
        assert!(recorder.writes.lock().is_empty());
        assert_eq!(*recorder.syncs.lock(), 0);
    }

    #[test]
    fn frame_sync_address_emits_sync_not_data() {
        let (mut parser, recorder) = parser_with_recorder();
        parser.process_buffer(&[
            0x55, 0x55, 0x55, 0x55, 0xfe, 0xff, 0x02, 0x00, 0x00, 0x00,
        ]);
        assert!(recorder.writes.lock().is_empty());
        assert_eq!(*recorder.syncs.lock(), 1);
        assert_eq!(parser.stats().frames, 1);
    }

    #[test]
    fn sync_run_interrupted_by_other_byte_resets() {
        let (mut parser, recorder) = parser_with_recorder();
        parser.process_buffer(&[0x55, 0x55, 0x55, 0x00, 0x55, 0x55, 0x55]);
        // Never four in a row, so still waiting.
        assert!(!parser.awaiting_address());
        parser.process_byte(0x55);
        assert!(parser.awaiting_address());
        assert!(recorder.writes.lock().is_empty());
    }

    #[test]
    fn listener_can_remove_itself_during_dispatch() {
        struct SelfRemover {
            registry: Arc<StreamRegistry>,
            me: Mutex<Option<Arc<dyn DataListener>>>,
        }
        impl DataListener for SelfRemover {
            fn data_written(&self, _address: u16, _value: u16) {
                if let Some(me) = self.me.lock().take() {
                    self.registry.remove_data_listener(&me);
                }
            }
        }

        let mut parser = StreamParser::new();
        let remover = Arc::new(SelfRemover {
            registry: parser.registry(),
            me: Mutex::new(None),
        });
        let handle: Arc<dyn DataListener> = remover.clone();
        *remover.me.lock() = Some(handle.clone());
        parser.add_data_listener(handle);

        parser.process_buffer(&[0x55, 0x55, 0x55, 0x55, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]);
        assert!(parser.registry().snapshot_data().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        struct Panicker;
        impl DataListener for Panicker {
            fn data_written(&self, _address: u16, _value: u16) {
                panic!("listener bug");
            }
        }

        let parser = StreamParser::new();
        let recorder = Arc::new(Recorder::default());
        parser.add_data_listener(Arc::new(Panicker));
        parser.add_data_listener(recorder.clone());

        let mut parser = parser;
        parser.process_buffer(&[0x55, 0x55, 0x55, 0x55, 0x00, 0x00, 0x02, 0x00, 0x07, 0x00]);

        // The recorder registered after the panicker still saw the write,
        // and the parser kept its position.
        assert_eq!(*recorder.writes.lock(), vec![(0x0000, 0x0007)]);
        assert!(parser.awaiting_address());
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let parser = StreamParser::new();
        let recorder = Arc::new(Recorder::default());
        let handle: Arc<dyn DataListener> = recorder.clone();
        parser.add_data_listener(handle.clone());
        parser.add_data_listener(handle);

        let mut parser = parser;
        parser.process_buffer(&[0x55, 0x55, 0x55, 0x55, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]);
        assert_eq!(recorder.writes.lock().len(), 1);
    }
}
