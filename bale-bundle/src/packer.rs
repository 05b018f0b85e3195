//! Packet packing policy.
//!
//! Node encodings are appended in export order and grouped into compressed
//! packets:
//!
//! - a node at least `min_packet_size` long gets a packet of its own (after
//!   flushing any pending shared block), avoiding an extra copy;
//! - smaller nodes accumulate in a shared block, flushed whenever it reaches
//!   `min_packet_size`.
//!
//! Either way a node's bytes land entirely inside one packet, so readers
//! can decompress a single packet to recover any node.

use crate::format::Packet;
use bale_core::Result;

pub struct PacketPacker {
    min_packet_size: usize,
    level: i32,
    shared: Vec<u8>,
    packets: Vec<Packet>,
    payload: Vec<u8>,
    decoded_total: u64,
}

impl PacketPacker {
    pub fn new(min_packet_size: usize, level: i32) -> Self {
        Self {
            min_packet_size,
            level,
            shared: Vec::new(),
            packets: Vec::new(),
            payload: Vec::new(),
            decoded_total: 0,
        }
    }

    /// Append one node's encoded bytes.
    pub fn add_node(&mut self, encoded: &[u8]) -> Result<()> {
        if encoded.len() >= self.min_packet_size {
            self.flush_shared()?;
            self.write_packet(encoded)?;
            return Ok(());
        }
        self.shared.extend_from_slice(encoded);
        if self.shared.len() >= self.min_packet_size {
            self.flush_shared()?;
        }
        Ok(())
    }

    fn flush_shared(&mut self) -> Result<()> {
        if self.shared.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut self.shared);
        self.write_packet(&block)
    }

    fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let compressed = zstd::bulk::compress(data, self.level)?;
        self.packets.push(Packet {
            encoded_len: compressed.len() as u64,
            decoded_len: data.len() as u64,
        });
        self.decoded_total += data.len() as u64;
        self.payload.extend_from_slice(&compressed);
        Ok(())
    }

    /// Flush the trailing shared block and return the packet table, the
    /// compressed payload, and the total decoded byte count.
    pub fn finish(mut self) -> Result<(Vec<Packet>, Vec<u8>, u64)> {
        self.flush_shared()?;
        Ok((self.packets, self.payload, self.decoded_total))
    }
}

/// Decompress one packet's payload slice.
pub fn decompress_packet(encoded: &[u8], decoded_len: usize) -> Result<Vec<u8>> {
    let decoded = zstd::bulk::decompress(encoded, decoded_len)?;
    if decoded.len() != decoded_len {
        return Err(bale_core::Error::decode(format!(
            "packet decompressed to {} bytes, expected {decoded_len}",
            decoded.len()
        )));
    }
    Ok(decoded)
}
