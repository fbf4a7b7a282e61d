mod element;
mod header;
mod ids;
mod value;

pub use element::ElementType;
pub use header::{CHUNK_ALIGN, ChunkHeader, ChunkKind, Color, HEADER_SIZE, align_chunk};
pub use ids::{ClassId, MethodId};
pub use value::{REF_SIZE, Ref};

#[cfg(test)]
mod tests {
    use super::*;

    // ── References ─────────────────────────────────────────────────

    #[test]
    fn null_ref_is_zero() {
        assert!(Ref::NULL.is_null());
        assert_eq!(Ref::NULL.addr(), 0);
        assert_eq!(Ref::default(), Ref::NULL);
        assert_eq!(Ref::NULL.non_null(), None);
    }

    #[test]
    fn ref_bytes_are_little_endian() {
        let r = Ref::from_addr(0x1234_5678);
        assert_eq!(r.to_le_bytes(), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(Ref::from_le_bytes([0x78, 0x56, 0x34, 0x12]), r);
        assert_eq!(r.non_null(), Some(r));
    }

    #[test]
    fn ref_debug_output() {
        assert_eq!(format!("{:?}", Ref::NULL), "Ref(null)");
        assert_eq!(format!("{:?}", Ref::from_addr(0x100c)), "Ref(0x100c)");
    }

    // ── Chunk headers ──────────────────────────────────────────────

    #[test]
    fn header_layout() {
        let mut header = ChunkHeader::new(ChunkKind::Frame, 40);
        header.shift = 16;
        header.color = Color::Black;
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &40u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &16u32.to_le_bytes());
        assert_eq!(bytes[8], ChunkKind::Frame as u8);
        assert_eq!(bytes[9], Color::Black as u8);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(ChunkHeader::decode(&bytes), Some(header));
        assert_eq!(header.payload_size(), 28);
    }

    #[test]
    fn new_header_is_white_and_unshifted() {
        let header = ChunkHeader::new(ChunkKind::Object, 24);
        assert_eq!(header.color, Color::White);
        assert_eq!(header.shift, 0);
    }

    #[test]
    fn decode_rejects_garbage() {
        let mut bytes = ChunkHeader::new(ChunkKind::Thread, 40).encode();
        bytes[8] = ChunkKind::COUNT as u8;
        assert_eq!(ChunkHeader::decode(&bytes), None);

        let mut bytes = ChunkHeader::new(ChunkKind::Thread, 40).encode();
        bytes[9] = 7;
        assert_eq!(ChunkHeader::decode(&bytes), None);

        let bytes = ChunkHeader::new(ChunkKind::Thread, 4).encode();
        assert_eq!(ChunkHeader::decode(&bytes), None);

        assert_eq!(ChunkHeader::decode(&[0u8; 6]), None);
    }

    #[test]
    fn chunk_alignment() {
        assert_eq!(align_chunk(0), 0);
        assert_eq!(align_chunk(1), 4);
        assert_eq!(align_chunk(12), 12);
        assert_eq!(align_chunk(13), 16);
        assert_eq!(HEADER_SIZE % CHUNK_ALIGN, 0);
    }

    #[test]
    fn array_kinds() {
        assert!(ChunkKind::IntArray.is_array());
        assert!(ChunkKind::RefArray.is_array());
        assert!(!ChunkKind::Object.is_array());
        assert!(!ChunkKind::Frame.is_array());
    }

    // ── Element types ──────────────────────────────────────────────

    #[test]
    fn element_widths() {
        assert_eq!(ElementType::Boolean.width(), 1);
        assert_eq!(ElementType::Char.width(), 1);
        assert_eq!(ElementType::Byte.width(), 1);
        assert_eq!(ElementType::Short.width(), 2);
        assert_eq!(ElementType::Int.width(), 4);
        assert_eq!(ElementType::Float.width(), 4);
        assert_eq!(ElementType::Long.width(), 8);
        assert_eq!(ElementType::Double.width(), 8);
    }

    #[test]
    fn element_codes() {
        assert_eq!(ElementType::from_code(10), Some(ElementType::Int));
        assert_eq!(ElementType::from_code(3), None);
        assert_eq!(ElementType::from_code(12), None);
        assert!(!ElementType::Char.is_signed());
        assert!(ElementType::Byte.is_signed());
    }

    // ── Identifiers ────────────────────────────────────────────────

    #[test]
    fn method_id_packing() {
        let id = MethodId::new(ClassId(7), 3);
        assert_eq!(id.to_bits(), 7 | (3 << 16));
        assert_eq!(MethodId::from_bits(id.to_bits()), id);
    }
}
