//! Time-synchronization exchange.
//!
//! Two-packet NTP-style round trip. The client stamps `t0`/`mono0` into a
//! request; the server echoes those and adds its receive (`t1`) and send
//! (`t2`) stamps; the client observes `t3` on arrival and computes:
//!
//! ```text
//! offset     = ((t1 - t0) + (t2 - t3)) / 2
//! round trip = (t3 - t0) - (t2 - t1)
//! ```
//!
//! Monotonic stamps travel alongside the wall-clock ones so either endpoint
//! can correlate the exchange with its own tick source. One outstanding
//! sequence per client is sufficient for correctness.

use bytes::{BufMut, BytesMut};

use crate::clock;
use crate::error::ProtocolError;
use crate::packet::{magic, PacketBody};
use crate::pool::Poolable;
use crate::wire;

/// Opcode of the time-sync exchange.
pub const OP_TIME_SYNC: u16 = 0xA002;

/// Time-sync packet; a request leaves the server stamps at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSyncPacket {
    pub opcode: u16,
    pub sequence: u32,
    pub t0_client_send: i64,
    pub mono_client_send: i64,
    pub t1_server_recv: i64,
    pub t2_server_send: i64,
    pub mono_server_recv: i64,
    pub mono_server_send: i64,
}

impl TimeSyncPacket {
    /// Builds a request stamped with the local clocks.
    pub fn request(sequence: u32) -> Self {
        TimeSyncPacket {
            opcode: OP_TIME_SYNC,
            sequence,
            t0_client_send: clock::unix_millis_now(),
            mono_client_send: clock::mono_ticks_now(),
            ..TimeSyncPacket::default()
        }
    }

    /// Builds the response for `request`.
    ///
    /// `t1`/`mono1` are the stamps taken when the request was read; `t2` and
    /// `mono2` are stamped here, so call this immediately before handing the
    /// response to the send path.
    pub fn respond(request: &TimeSyncPacket, t1_server_recv: i64, mono_server_recv: i64) -> Self {
        TimeSyncPacket {
            opcode: OP_TIME_SYNC,
            sequence: request.sequence,
            t0_client_send: request.t0_client_send,
            mono_client_send: request.mono_client_send,
            t1_server_recv,
            t2_server_send: clock::unix_millis_now(),
            mono_server_recv,
            mono_server_send: clock::mono_ticks_now(),
        }
    }
}

impl PacketBody for TimeSyncPacket {
    const MAGIC: u32 = magic::TIME_SYNC;
    const NAME: &'static str = "TimeSync";

    fn opcode(&self) -> u16 {
        self.opcode
    }

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.put_u32_le(self.sequence);
        dst.put_i64_le(self.t0_client_send);
        dst.put_i64_le(self.mono_client_send);
        dst.put_i64_le(self.t1_server_recv);
        dst.put_i64_le(self.t2_server_send);
        dst.put_i64_le(self.mono_server_recv);
        dst.put_i64_le(self.mono_server_send);
        Ok(())
    }

    fn decode_payload(opcode: u16, mut src: &[u8]) -> Result<Self, ProtocolError> {
        Ok(TimeSyncPacket {
            opcode,
            sequence: wire::read_u32(&mut src)?,
            t0_client_send: wire::read_i64(&mut src)?,
            mono_client_send: wire::read_i64(&mut src)?,
            t1_server_recv: wire::read_i64(&mut src)?,
            t2_server_send: wire::read_i64(&mut src)?,
            mono_server_recv: wire::read_i64(&mut src)?,
            mono_server_send: wire::read_i64(&mut src)?,
        })
    }

    fn payload_size_hint(&self) -> usize {
        4 + 6 * 8
    }
}

impl Poolable for TimeSyncPacket {
    fn reset_for_pool(&mut self) {
        *self = TimeSyncPacket::default();
    }
}

/// Result of one completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Estimated server-clock minus client-clock, milliseconds.
    pub offset_ms: i64,
    /// Network round-trip with server processing removed, milliseconds.
    pub round_trip_ms: i64,
}

impl ClockSample {
    /// Computes offset and delay from a response and the local receive stamp.
    pub fn from_exchange(response: &TimeSyncPacket, t3_client_recv: i64) -> Self {
        let t0 = response.t0_client_send;
        let t1 = response.t1_server_recv;
        let t2 = response.t2_server_send;
        let t3 = t3_client_recv;
        ClockSample {
            offset_ms: ((t1 - t0) + (t2 - t3)) / 2,
            round_trip_ms: (t3 - t0) - (t2 - t1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let request = TimeSyncPacket::request(7);
        let response = TimeSyncPacket::respond(&request, 1234, 5678);
        let raw = response.into_raw().unwrap();
        assert_eq!(TimeSyncPacket::decode(&raw).unwrap(), response);
    }

    #[test]
    fn response_preserves_client_stamps() {
        let request = TimeSyncPacket::request(3);
        let response = TimeSyncPacket::respond(&request, 10, 20);
        assert_eq!(response.sequence, 3);
        assert_eq!(response.t0_client_send, request.t0_client_send);
        assert_eq!(response.mono_client_send, request.mono_client_send);
        assert_eq!(response.t1_server_recv, 10);
    }

    #[test]
    fn offset_and_delay_match_worked_example() {
        // Client sends at 1000, server receives at 1010 and replies at 1011,
        // client observes arrival at 1025.
        let response = TimeSyncPacket {
            opcode: OP_TIME_SYNC,
            sequence: 1,
            t0_client_send: 1000,
            t1_server_recv: 1010,
            t2_server_send: 1011,
            ..TimeSyncPacket::default()
        };
        let sample = ClockSample::from_exchange(&response, 1025);
        assert_eq!(sample.offset_ms, -2);
        assert_eq!(sample.round_trip_ms, 24);
    }

    #[test]
    fn truncated_payload_fails() {
        let raw = TimeSyncPacket::request(1).into_raw().unwrap();
        let bytes = raw.encode();
        assert!(TimeSyncPacket::decode_payload(OP_TIME_SYNC, &bytes[12..30]).is_err());
    }
}
