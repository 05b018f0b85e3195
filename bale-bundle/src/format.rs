//! Bundle container wire format.
//!
//! A bundle packs many nodes into one blob:
//!
//! ```text
//! [BundleHeader][varint payloadLength][payload]
//!
//! BundleHeader = [varint version][imports][exports][packets]
//! Import  = [varint idLen][blobId][varint exportCount]
//!           [varint refCount]{varint localIndex, hash}*
//! Export  = [hash][varint encodedLength][varint refCount]{varint refIndex}*
//! Packet  = [varint encodedLength][varint decodedLength]
//! ```
//!
//! The payload is the concatenation of independently compressed packets;
//! decoded, the packets concatenate to the exports' encodings in export
//! order, and no export spans a packet boundary.
//!
//! Reference indices address a combined table: every imported entry in
//! declaration order, then every export in declaration order. Exports are
//! written in dependency order, so an export's references always point at
//! imports or at earlier exports; the decoder enforces this.

use bale_core::{varint, BlobId, ContentHash, Error, Result, HASH_SIZE};

/// Current bundle format version.
pub const BUNDLE_VERSION: u64 = 1;

/// One referenced entry of an imported bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    /// Export index inside the imported bundle.
    pub local_index: u32,
    /// Hash of the referenced node.
    pub hash: ContentHash,
}

/// A bundle referenced by this one, listing only the entries actually used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Blob holding the imported bundle.
    pub blob: BlobId,
    /// Total export count of the imported bundle, so locators for its
    /// entries can be built without reading it.
    pub export_count: u32,
    /// Referenced entries, in first-use order.
    pub entries: Vec<ImportEntry>,
}

/// A node defined by this bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Content hash of the node's canonical encoding.
    pub hash: ContentHash,
    /// Length of the node's encoding inside the decoded payload.
    pub length: u64,
    /// Outgoing references as combined-table indices.
    pub refs: Vec<u32>,
}

/// One compressed block of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Compressed length inside the payload.
    pub encoded_len: u64,
    /// Decompressed length.
    pub decoded_len: u64,
}

/// Parsed bundle metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHeader {
    pub version: u64,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    pub packets: Vec<Packet>,
}

impl BundleHeader {
    /// Number of imported entries across all imports; exports' combined-table
    /// indices start here.
    pub fn import_entry_count(&self) -> usize {
        self.imports.iter().map(|i| i.entries.len()).sum()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        varint::encode_varint(self.version, buf);

        varint::encode_varint(self.imports.len() as u64, buf);
        for import in &self.imports {
            varint::encode_bytes(import.blob.as_str().as_bytes(), buf);
            varint::encode_varint(import.export_count as u64, buf);
            varint::encode_varint(import.entries.len() as u64, buf);
            for entry in &import.entries {
                varint::encode_varint(entry.local_index as u64, buf);
                buf.extend_from_slice(entry.hash.as_bytes());
            }
        }

        varint::encode_varint(self.exports.len() as u64, buf);
        for export in &self.exports {
            buf.extend_from_slice(export.hash.as_bytes());
            varint::encode_varint(export.length, buf);
            varint::encode_varint(export.refs.len() as u64, buf);
            for &idx in &export.refs {
                varint::encode_varint(idx as u64, buf);
            }
        }

        varint::encode_varint(self.packets.len() as u64, buf);
        for packet in &self.packets {
            varint::encode_varint(packet.encoded_len, buf);
            varint::encode_varint(packet.decoded_len, buf);
        }
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let version = varint::decode_varint(buf, pos)?;
        if version != BUNDLE_VERSION {
            return Err(Error::decode(format!("unsupported bundle version {version}")));
        }

        let import_count = varint::decode_count(buf, pos, buf.len() - *pos)?;
        let mut imports = Vec::with_capacity(import_count);
        for _ in 0..import_count {
            let id = varint::decode_bytes(buf, pos)?;
            let id = std::str::from_utf8(id)
                .map_err(|e| Error::decode(format!("import blob id is not UTF-8: {e}")))?;
            let export_count = varint::decode_varint(buf, pos)? as u32;
            let entry_count = varint::decode_count(buf, pos, buf.len() - *pos)?;
            let mut entries = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                let local_index = varint::decode_varint(buf, pos)? as u32;
                if local_index >= export_count {
                    return Err(Error::decode(format!(
                        "import entry index {local_index} out of range (bundle has {export_count} exports)"
                    )));
                }
                entries.push(ImportEntry {
                    local_index,
                    hash: take_hash(buf, pos)?,
                });
            }
            imports.push(Import {
                blob: BlobId::new(id),
                export_count,
                entries,
            });
        }
        let import_entries: usize = imports.iter().map(|i| i.entries.len()).sum();

        let export_count = varint::decode_count(buf, pos, buf.len() - *pos)?;
        let mut exports = Vec::with_capacity(export_count);
        for i in 0..export_count {
            let hash = take_hash(buf, pos)?;
            let length = varint::decode_varint(buf, pos)?;
            let ref_count = varint::decode_count(buf, pos, buf.len() - *pos)?;
            let mut refs = Vec::with_capacity(ref_count);
            for _ in 0..ref_count {
                let idx = varint::decode_varint(buf, pos)? as u32;
                // Dependency order: references may only point at imports or
                // at exports already declared.
                if idx as usize >= import_entries + i {
                    return Err(Error::decode(format!(
                        "export {i} reference index {idx} breaks dependency order"
                    )));
                }
                refs.push(idx);
            }
            exports.push(Export { hash, length, refs });
        }

        let packet_count = varint::decode_count(buf, pos, buf.len() - *pos)?;
        let mut packets = Vec::with_capacity(packet_count);
        for _ in 0..packet_count {
            let encoded_len = varint::decode_varint(buf, pos)?;
            let decoded_len = varint::decode_varint(buf, pos)?;
            packets.push(Packet {
                encoded_len,
                decoded_len,
            });
        }

        let header = Self {
            version,
            imports,
            exports,
            packets,
        };
        let decoded_total: u64 = header.packets.iter().map(|p| p.decoded_len).sum();
        let export_total: u64 = header.exports.iter().map(|e| e.length).sum();
        if decoded_total != export_total {
            return Err(Error::decode(format!(
                "packets decode to {decoded_total} bytes but exports total {export_total}"
            )));
        }
        Ok(header)
    }
}

fn take_hash(buf: &[u8], pos: &mut usize) -> Result<ContentHash> {
    if buf.len() - *pos < HASH_SIZE {
        return Err(Error::decode("truncated hash"));
    }
    let hash = ContentHash::try_from_slice(&buf[*pos..*pos + HASH_SIZE])?;
    *pos += HASH_SIZE;
    Ok(hash)
}

/// Serialize a complete bundle blob.
pub fn encode_bundle(header: &BundleHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 256);
    header.encode_into(&mut buf);
    varint::encode_varint(payload.len() as u64, &mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Parse a bundle blob into its header and the payload's byte range.
pub fn decode_bundle(bytes: &[u8]) -> Result<(BundleHeader, std::ops::Range<usize>)> {
    let mut pos = 0;
    let header = BundleHeader::decode(bytes, &mut pos)?;
    let remaining = bytes.len() - pos;
    let payload_len = varint::decode_count(bytes, &mut pos, remaining)?;
    if bytes.len() - pos != payload_len {
        return Err(Error::decode(format!(
            "payload length {payload_len} disagrees with {} trailing bytes",
            bytes.len() - pos
        )));
    }
    let encoded_total: u64 = header.packets.iter().map(|p| p.encoded_len).sum();
    if encoded_total != payload_len as u64 {
        return Err(Error::decode(format!(
            "packets cover {encoded_total} bytes but payload is {payload_len}"
        )));
    }
    Ok((header, pos..bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BundleHeader {
        BundleHeader {
            version: BUNDLE_VERSION,
            imports: vec![Import {
                blob: BlobId::from("blob-00000001"),
                export_count: 9,
                entries: vec![
                    ImportEntry {
                        local_index: 2,
                        hash: ContentHash::of(b"imported-a"),
                    },
                    ImportEntry {
                        local_index: 7,
                        hash: ContentHash::of(b"imported-b"),
                    },
                ],
            }],
            exports: vec![
                Export {
                    hash: ContentHash::of(b"leaf"),
                    length: 6,
                    refs: vec![],
                },
                Export {
                    hash: ContentHash::of(b"parent"),
                    length: 4,
                    // imports occupy indices 0..2, the leaf export is 2
                    refs: vec![0, 2],
                },
            ],
            packets: vec![Packet {
                encoded_len: 5,
                decoded_len: 10,
            }],
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        let mut pos = 0;
        let parsed = BundleHeader::decode(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        assert_eq!(parsed, header);
        assert_eq!(parsed.import_entry_count(), 2);
    }

    #[test]
    fn test_bundle_roundtrip() {
        let header = sample_header();
        let payload = vec![0xEE; 5];
        let bytes = encode_bundle(&header, &payload);
        let (parsed, range) = decode_bundle(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&bytes[range], &payload[..]);
    }

    #[test]
    fn test_rejects_forward_reference() {
        let mut header = sample_header();
        // Export 0 referencing export 1 (combined index 3) is out of order.
        header.exports[0].refs.push(3);
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        let mut pos = 0;
        let err = BundleHeader::decode(&buf, &mut pos).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_rejects_import_index_out_of_range() {
        let mut header = sample_header();
        header.imports[0].entries[0].local_index = 9;
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        let mut pos = 0;
        assert!(BundleHeader::decode(&buf, &mut pos).is_err());
    }

    #[test]
    fn test_rejects_payload_length_mismatch() {
        let header = sample_header();
        let mut bytes = encode_bundle(&header, &[0xEE; 5]);
        bytes.push(0);
        assert!(decode_bundle(&bytes).is_err());
    }

    #[test]
    fn test_rejects_decoded_total_mismatch() {
        let mut header = sample_header();
        header.packets[0].decoded_len = 11;
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        let mut pos = 0;
        assert!(BundleHeader::decode(&buf, &mut pos).is_err());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut buf = Vec::new();
        varint::encode_varint(99, &mut buf);
        let mut pos = 0;
        assert!(BundleHeader::decode(&buf, &mut pos).is_err());
    }
}
