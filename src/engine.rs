//! The stream framer: turns a byte-oriented source into a sequence of decoded records by
//! feeding bytes one at a time to [`crate::eval::decide`] and reacting to the decision.
//!
//! Grounded in the teacher's `rtu` framing/resync flow (`rtu::frame`, `rtu::iterator`), adapted
//! from modbus's fixed address+function+CRC shape to arbitrary pattern-program framing, and in
//! the `ByteSource`/`RecordSink`/`Clock` collaborators named in `SPEC_FULL.md` §6.

use std::thread;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::crc::{self, CrcKind, Verdict};
use crate::error::EngineError;
use crate::eval;
use crate::pattern::{DecodedField, Program};
use crate::state::{Decision, State};

/// Blocking byte source the framer reads from, one byte at a time. Follows the `std::io::Read`
/// contract: `Ok(0)` signals end-of-source.
pub trait ByteSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Whether `err` should be retried after a short backoff rather than stopping the engine.
    /// Conservative by default: nothing is transient unless a source says otherwise.
    fn is_transient(&self, _err: &Self::Error) -> bool {
        false
    }
}

/// Receives decoded records from a running [`Engine`]; also sees trailing partial buffers left
/// over at end-of-source.
pub trait RecordSink {
    fn deliver(&mut self, record: Record);

    /// A buffer that never completed a match before the source ran dry. Default: ignored.
    fn unfinished(&mut self, _buffer: &[u8]) {}
}

/// Supplies the backoff delay used between transient source-error retries.
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

/// [`Clock`] that actually sleeps the calling thread. The default for [`Engine::run`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// One decoded packet delivered to a [`RecordSink`], or an `alternative_matches` sub-find within
/// the same buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub bytes: Vec<u8>,
    pub fields: Vec<DecodedField>,
    pub crc: Verdict,
}

/// How long a transient source error backs off before the next read attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// A compiled [`Program`] plus the knobs governing how its decisions become delivered records.
pub struct Engine {
    program: Program,
    config: EngineConfig,
}

impl Engine {
    pub fn new(program: Program, config: EngineConfig) -> Self {
        Engine { program, config }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the framer loop until `source` reaches end-of-stream, `cancel` reports true, or a
    /// terminal source error occurs. Uses [`SystemClock`] for transient-error backoff.
    pub fn run<S, R>(
        &self,
        source: &mut S,
        sink: &mut R,
        cancel: &dyn Fn() -> bool,
    ) -> Result<(), EngineError>
    where
        S: ByteSource,
        R: RecordSink,
    {
        self.run_with_clock(source, sink, cancel, &SystemClock)
    }

    /// Same as [`Engine::run`] but with an injectable [`Clock`], so tests can avoid real sleeps.
    pub fn run_with_clock<S, R, C>(
        &self,
        source: &mut S,
        sink: &mut R,
        cancel: &dyn Fn() -> bool,
        clock: &C,
    ) -> Result<(), EngineError>
    where
        S: ByteSource,
        R: RecordSink,
        C: Clock,
    {
        let effective_max = self.config.effective_max_length(self.program.max_length);
        let mut state = State::new(effective_max);
        let mut byte_buf = [0u8; 1];

        loop {
            if cancel() {
                tracing::debug!("cancellation observed, stopping framer");
                return Err(EngineError::Cancelled);
            }

            match source.read(&mut byte_buf) {
                Ok(0) => {
                    if !state.is_empty() {
                        tracing::debug!(len = state.len(), "end of source, delivering unfinished buffer");
                        sink.unfinished(state.buffer());
                    }
                    return Ok(());
                }
                Ok(_) => {
                    state.append(byte_buf[0]);
                    self.step(&mut state, sink);
                }
                Err(e) if source.is_transient(&e) => {
                    tracing::warn!(error = %e, "transient source error, retrying");
                    clock.sleep(RETRY_BACKOFF);
                }
                Err(e) => {
                    tracing::error!(error = %e, "terminal source error, stopping framer");
                    return Err(EngineError::Source(Box::new(e)));
                }
            }
        }
    }

    fn step<R: RecordSink>(&self, state: &mut State, sink: &mut R) {
        match eval::decide(state, &self.program) {
            Decision::Continue => {}
            Decision::Emit => self.emit(state, sink),
            Decision::Drop => self.resync(state),
        }
        self.enforce_ceiling(state);
    }

    fn emit<R: RecordSink>(&self, state: &mut State, sink: &mut R) {
        let packet = state.buffer().to_vec();
        let verdict = self.crc_verdict(&packet, state);

        if self.config.strict_crc && verdict.is_invalid() {
            tracing::warn!(?verdict, "strict CRC mismatch, resyncing without emitting");
            // the boundary is already accepted; per SPEC_FULL.md §9(c) the buffer is still
            // consumed rather than resynced from the front.
            state.discard_front(state.len());
            return;
        }

        if verdict.is_invalid() {
            tracing::warn!(?verdict, "CRC mismatch on delivered record");
        }

        if self.config.alternative_matches {
            for alt in self.alternative_matches(&packet) {
                sink.deliver(alt);
            }
        }

        let fields = state.fields().to_vec();
        sink.deliver(Record {
            bytes: packet,
            fields,
            crc: verdict,
        });
        state.discard_front(state.len());
    }

    fn crc_verdict(&self, packet: &[u8], state: &State) -> Verdict {
        match state.fields().last() {
            Some(last) => crc::validate(packet, last.offset, CrcKind::from_field_kind(last.kind)),
            None => Verdict::NotChecked,
        }
    }

    /// After a resync strategy from `SPEC_FULL.md` §9(b): with the start anchor set, discard
    /// front bytes until the buffer is empty or its first byte matches the pattern's first
    /// literal; otherwise discard exactly one byte.
    fn resync(&self, state: &mut State) {
        match self.program.start_anchor.then(|| self.program.first_literal_byte()).flatten() {
            Some(first_byte) => {
                state.discard_front(1);
                while !state.is_empty() && state.buffer()[0] != first_byte {
                    state.discard_front(1);
                }
            }
            None => state.discard_front(1),
        }
    }

    fn enforce_ceiling(&self, state: &mut State) {
        let effective_max = self.config.effective_max_length(self.program.max_length);
        if effective_max > 0 && state.len() > effective_max + 1 {
            let excess = state.len() - (effective_max + 1);
            tracing::warn!(excess, "buffer exceeded ceiling, discarding front bytes");
            state.discard_front(excess);
        }
    }

    /// `alternative_matches` support: probe the just-emitted buffer at every later start offset
    /// for another complete match of the same program, for resynchronization views into streams
    /// that occasionally drift.
    fn alternative_matches(&self, packet: &[u8]) -> Vec<Record> {
        let effective_max = self.config.effective_max_length(self.program.max_length);
        let mut out = Vec::new();
        for start in 1..packet.len() {
            let mut sub_state = State::from_buffer(packet[start..].to_vec(), effective_max);
            if eval::decide(&mut sub_state, &self.program) == Decision::Emit {
                let bytes = sub_state.buffer().to_vec();
                let crc = self.crc_verdict(&bytes, &sub_state);
                out.push(Record {
                    bytes,
                    fields: sub_state.fields().to_vec(),
                    crc,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::compile;
    use std::cell::Cell;
    use std::fmt;

    #[derive(Debug)]
    struct NeverError;
    impl fmt::Display for NeverError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "never")
        }
    }
    impl std::error::Error for NeverError {}

    struct SliceSource<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    impl<'a> ByteSource for SliceSource<'a> {
        type Error = NeverError;

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[derive(Default)]
    struct VecSink {
        records: Vec<Record>,
        unfinished: Vec<Vec<u8>>,
    }

    impl RecordSink for VecSink {
        fn deliver(&mut self, record: Record) {
            self.records.push(record);
        }

        fn unfinished(&mut self, buffer: &[u8]) {
            self.unfinished.push(buffer.to_vec());
        }
    }

    #[test]
    fn emits_one_record_per_complete_packet() {
        let program = compile("^AA%uu$").unwrap();
        let engine = Engine::new(program, EngineConfig::default());
        let mut source = SliceSource {
            bytes: &[0xAA, 0x34, 0x12],
            pos: 0,
        };
        let mut sink = VecSink::default();
        engine.run(&mut source, &mut sink, &|| false).unwrap();
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].bytes, vec![0xAA, 0x34, 0x12]);
    }

    #[test]
    fn drop_resyncs_on_start_anchor_literal() {
        let program = compile("^AA%u$").unwrap();
        let engine = Engine::new(program, EngineConfig::default());
        // 0xFF is noise before the real packet: should resync and still emit once.
        let mut source = SliceSource {
            bytes: &[0xFF, 0xFF, 0xAA, 0x7B],
            pos: 0,
        };
        let mut sink = VecSink::default();
        engine.run(&mut source, &mut sink, &|| false).unwrap();
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].bytes, vec![0xAA, 0x7B]);
    }

    #[test]
    fn strict_crc_drops_invalid_without_delivering() {
        let program = compile("^AA%c$").unwrap();
        let config = EngineConfig::new().with_strict_crc(true);
        let engine = Engine::new(program, config);
        // sum(0xAA) = 0xAA; 0x00 is a wrong CRC8.
        let mut source = SliceSource {
            bytes: &[0xAA, 0x00],
            pos: 0,
        };
        let mut sink = VecSink::default();
        engine.run(&mut source, &mut sink, &|| false).unwrap();
        assert!(sink.records.is_empty());
    }

    #[test]
    fn non_strict_crc_delivers_with_invalid_verdict() {
        let program = compile("^AA%c$").unwrap();
        let engine = Engine::new(program, EngineConfig::default());
        let mut source = SliceSource {
            bytes: &[0xAA, 0x00],
            pos: 0,
        };
        let mut sink = VecSink::default();
        engine.run(&mut source, &mut sink, &|| false).unwrap();
        assert_eq!(sink.records.len(), 1);
        assert!(sink.records[0].crc.is_invalid());
    }

    #[test]
    fn end_of_source_mid_attempt_delivers_unfinished_buffer() {
        let program = compile("^AA%uu$").unwrap();
        let engine = Engine::new(program, EngineConfig::default());
        let mut source = SliceSource {
            bytes: &[0xAA, 0x01],
            pos: 0,
        };
        let mut sink = VecSink::default();
        engine.run(&mut source, &mut sink, &|| false).unwrap();
        assert!(sink.records.is_empty());
        assert_eq!(sink.unfinished, vec![vec![0xAA, 0x01]]);
    }

    #[test]
    fn cancel_stops_the_loop() {
        let program = compile("^AA%uu$").unwrap();
        let engine = Engine::new(program, EngineConfig::default());
        let mut source = SliceSource {
            bytes: &[0xAA, 0x01, 0x02],
            pos: 0,
        };
        let mut sink = VecSink::default();
        let cancelled = Cell::new(false);
        let err = engine
            .run(&mut source, &mut sink, &|| {
                let was = cancelled.get();
                cancelled.set(true);
                was
            })
            .unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[test]
    fn buffer_ceiling_is_enforced_by_discarding_front_bytes() {
        // No anchors, so every byte that fails to extend a match just falls off the front; the
        // ceiling keeps the buffer from growing unbounded on a stream with no valid packets at
        // all.
        let program = compile("AABBCCDD$4").unwrap();
        let engine = Engine::new(program, EngineConfig::default());
        let mut source = SliceSource {
            bytes: &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77],
            pos: 0,
        };
        let mut sink = VecSink::default();
        engine.run(&mut source, &mut sink, &|| false).unwrap();
        assert!(sink.records.is_empty());
    }
}
