//! Tiny worked example: a pattern for a toy "read holding registers" response (address,
//! function, three little-endian register values, CRC8) driven against an in-memory byte
//! source, mirroring the teacher's `device_holding_regs` shape but through the pattern engine
//! instead of hand-rolled modbus framing.

use std::convert::Infallible;

use pattern_frames::compile;
use pattern_frames::engine::{ByteSource, Engine, Record, RecordSink};
use pattern_frames::EngineConfig;

/// Address 0x01, function 0x03 (read holding registers), three registers = 3, 6, 9, then a
/// CRC8 byte-sum over everything before it: 0x01+0x03+0x03+0x00+0x06+0x00+0x09+0x00 = 0x16.
const RESPONSE: [u8; 9] = [0x01, 0x03, 0x03, 0x00, 0x06, 0x00, 0x09, 0x00, 0x16];

struct SliceSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteSource for SliceSource<'a> {
    type Error = Infallible;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.pos >= self.bytes.len() {
            return Ok(0);
        }
        buf[0] = self.bytes[self.pos];
        self.pos += 1;
        Ok(1)
    }
}

struct PrintSink;

impl RecordSink for PrintSink {
    fn deliver(&mut self, record: Record) {
        println!("matched {} bytes, crc {:?}", record.bytes.len(), record.crc);
        for field in &record.fields {
            println!("  {} @ {} = {:?}", field.name, field.offset, field.value);
        }
    }

    fn unfinished(&mut self, buffer: &[u8]) {
        println!("stream ended mid-packet, {} unconsumed bytes", buffer.len());
    }
}

fn main() {
    // address byte, function byte, 3 little-endian u16 registers (stride), CRC8
    let program = compile("^0103%3uu%c$").expect("valid pattern");
    let engine = Engine::new(program, EngineConfig::default());

    let mut source = SliceSource {
        bytes: &RESPONSE,
        pos: 0,
    };
    let mut sink = PrintSink;

    engine
        .run(&mut source, &mut sink, &|| false)
        .expect("in-memory source never errors");
}
