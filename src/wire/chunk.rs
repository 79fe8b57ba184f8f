//! Fixed-size chunking for transfers larger than the endpoint packet size.
//!
//! Some devices want a logical buffer (command or whole CAN message) handed
//! over as a train of fixed-size chunks, each prefixed with a
//! `{seq_no: u16, len: u16}` header in device byte order. The sequence
//! number lets the reader detect dropped or reordered chunks. The header
//! width is pinned to u16 for this protocol.

use crate::error::{Error, Result};

use super::ByteOrder;

/// Chunk header: sequence number followed by payload length.
pub const CHUNK_HDR_LEN: usize = 4;

/// Splits written bytes into chunks of a fixed wire size.
///
/// Every chunk except the last occupies exactly `chunk_size` bytes; the
/// last is truncated after its payload. Sequence numbers increment per
/// chunk and wrap.
pub struct ChunkWriter {
    chunk_size: usize,
    order: ByteOrder,
    seq_no: u16,
    out: Vec<u8>,
    // offset of the current open chunk's header, or none between chunks
    chunk_start: Option<usize>,
}

impl ChunkWriter {
    pub fn new(chunk_size: u16, order: ByteOrder) -> Result<Self> {
        if (chunk_size as usize) <= CHUNK_HDR_LEN {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            chunk_size: chunk_size as usize,
            order,
            seq_no: 0,
            out: Vec::new(),
            chunk_start: None,
        })
    }

    fn payload_capacity(&self) -> usize {
        self.chunk_size - CHUNK_HDR_LEN
    }

    fn open_chunk(&mut self) {
        let start = self.out.len();
        self.out.resize(start + CHUNK_HDR_LEN, 0);
        self.order.write_u16(&mut self.out[start..], self.seq_no);
        self.seq_no = self.seq_no.wrapping_add(1);
        self.chunk_start = Some(start);
    }

    fn close_chunk(&mut self) {
        if let Some(start) = self.chunk_start.take() {
            let len = (self.out.len() - start - CHUNK_HDR_LEN) as u16;
            let order = self.order;
            order.write_u16(&mut self.out[start + 2..], len);
        }
    }

    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.chunk_start.is_none() {
                self.open_chunk();
            }
            let start = self.chunk_start.unwrap();
            let used = self.out.len() - start - CHUNK_HDR_LEN;
            let room = self.payload_capacity() - used;
            let take = room.min(data.len());
            self.out.extend_from_slice(&data[..take]);
            data = &data[take..];

            if take == room {
                self.close_chunk();
            }
        }
    }

    /// Close the open chunk and hand back the wire buffer.
    pub fn finish(mut self) -> Vec<u8> {
        self.close_chunk();
        self.out
    }
}

/// Reassembles the payload from a train of chunks, checking sequence order.
pub struct ChunkReader {
    chunk_size: usize,
    order: ByteOrder,
    seq_no: u16,
}

impl ChunkReader {
    pub fn new(chunk_size: u16, order: ByteOrder) -> Result<Self> {
        if (chunk_size as usize) <= CHUNK_HDR_LEN {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            chunk_size: chunk_size as usize,
            order,
            seq_no: 0,
        })
    }

    /// Forget sequence state, e.g. after the producer restarted.
    pub fn reset(&mut self) {
        self.seq_no = 0;
    }

    /// Append the payload bytes of `buf`'s chunks to `out`.
    ///
    /// `buf` may hold any number of consecutive chunks; a partial trailing
    /// chunk header is a protocol violation, a sequence gap is a
    /// [`Error::SequenceViolation`].
    pub fn read(&mut self, buf: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut pos = 0usize;

        while pos < buf.len() {
            if buf.len() - pos < CHUNK_HDR_LEN {
                return Err(Error::ProtocolViolation("truncated chunk header"));
            }

            let seq = self.order.read_u16(&buf[pos..]);
            let len = self.order.read_u16(&buf[pos + 2..]) as usize;

            if seq != self.seq_no {
                return Err(Error::SequenceViolation {
                    expected: self.seq_no,
                    actual: seq,
                });
            }

            if len > self.chunk_size - CHUNK_HDR_LEN {
                return Err(Error::ProtocolViolation("chunk length exceeds chunk size"));
            }

            if buf.len() - pos < CHUNK_HDR_LEN + len {
                return Err(Error::ProtocolViolation("truncated chunk payload"));
            }

            out.extend_from_slice(&buf[pos + CHUNK_HDR_LEN..pos + CHUNK_HDR_LEN + len]);
            self.seq_no = self.seq_no.wrapping_add(1);

            // full chunks occupy the fixed stride, the final short one ends
            // right after its payload
            if len == self.chunk_size - CHUNK_HDR_LEN {
                pos += self.chunk_size;
            } else {
                pos += CHUNK_HDR_LEN + len;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(chunk_size: u16, payload: &[u8]) -> Vec<u8> {
        let mut writer = ChunkWriter::new(chunk_size, ByteOrder::Native).unwrap();
        writer.write(payload);
        let wire = writer.finish();

        let mut reader = ChunkReader::new(chunk_size, ByteOrder::Native).unwrap();
        let mut out = Vec::new();
        reader.read(&wire, &mut out).unwrap();
        out
    }

    #[test]
    fn single_short_chunk() {
        let payload = b"hello";
        assert_eq!(round_trip(64, payload), payload);
    }

    #[test]
    fn multi_chunk_split_and_join() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        assert_eq!(round_trip(64, &payload), payload);
        assert_eq!(round_trip(8, &payload), payload);
    }

    #[test]
    fn exact_multiple_of_payload_capacity() {
        // 60 payload bytes per 64-byte chunk; two completely full chunks
        let payload = vec![0xab; 120];
        let mut writer = ChunkWriter::new(64, ByteOrder::Native).unwrap();
        writer.write(&payload);
        let wire = writer.finish();
        assert_eq!(wire.len(), 128);

        let mut reader = ChunkReader::new(64, ByteOrder::Native).unwrap();
        let mut out = Vec::new();
        reader.read(&wire, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn incremental_writes_match_one_shot() {
        let mut writer = ChunkWriter::new(16, ByteOrder::Native).unwrap();
        writer.write(b"abc");
        writer.write(b"defghij");
        writer.write(b"klmnopqrstuvwxyz");
        let wire = writer.finish();

        let mut reader = ChunkReader::new(16, ByteOrder::Native).unwrap();
        let mut out = Vec::new();
        reader.read(&wire, &mut out).unwrap();
        assert_eq!(out, b"abcdefghijklmnopqrstuvwxyz");
    }

    #[test]
    fn sequence_gap_is_detected() {
        let mut writer = ChunkWriter::new(8, ByteOrder::Native).unwrap();
        writer.write(&[1u8; 12]); // 3 chunks of 4 payload bytes
        let mut wire = writer.finish();

        // corrupt the second chunk's sequence number
        wire[8] = 9;

        let mut reader = ChunkReader::new(8, ByteOrder::Native).unwrap();
        let mut out = Vec::new();
        match reader.read(&wire, &mut out) {
            Err(Error::SequenceViolation { expected: 1, actual: 9 }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chunks_arriving_in_separate_reads() {
        let mut writer = ChunkWriter::new(8, ByteOrder::Native).unwrap();
        writer.write(&[7u8; 10]);
        let wire = writer.finish();

        let mut reader = ChunkReader::new(8, ByteOrder::Native).unwrap();
        let mut out = Vec::new();
        reader.read(&wire[..8], &mut out).unwrap();
        reader.read(&wire[8..], &mut out).unwrap();
        assert_eq!(out, vec![7u8; 10]);
    }

    #[test]
    fn byte_swapped_headers() {
        let mut writer = ChunkWriter::new(8, ByteOrder::Swapped).unwrap();
        writer.write(&[3u8; 6]);
        let wire = writer.finish();

        let mut reader = ChunkReader::new(8, ByteOrder::Swapped).unwrap();
        let mut out = Vec::new();
        reader.read(&wire, &mut out).unwrap();
        assert_eq!(out, vec![3u8; 6]);

        // a native reader sees a wrong sequence number immediately
        let mut native = ChunkReader::new(8, ByteOrder::Native).unwrap();
        let mut junk = Vec::new();
        // seq 0 swaps to 0 so the first chunk passes; corrupt it to force
        // the mismatch path instead
        let mut bad = wire.clone();
        bad[0] = 1;
        assert!(native.read(&bad, &mut junk).is_err());
    }

    #[test]
    fn tiny_chunk_size_is_rejected() {
        assert!(ChunkWriter::new(4, ByteOrder::Native).is_err());
        assert!(ChunkReader::new(3, ByteOrder::Native).is_err());
    }
}
