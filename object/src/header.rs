/// Bytes occupied by a chunk header. The payload starts right after it.
pub const HEADER_SIZE: usize = 12;

/// Every chunk size (header included) is a multiple of this.
pub const CHUNK_ALIGN: usize = 4;

/// Round `size` up to the chunk alignment.
#[inline(always)]
pub const fn align_chunk(size: usize) -> usize {
    (size + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1)
}

/// What a chunk holds. The heap only needs the kind to pick the right
/// layout when tracing and relocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkKind {
    Object = 0,
    IntArray,
    RefArray,
    Thread,
    Frame,
    MonitorBlock,
}

impl ChunkKind {
    pub const COUNT: usize = Self::MonitorBlock as usize + 1;

    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Object,
            1 => Self::IntArray,
            2 => Self::RefArray,
            3 => Self::Thread,
            4 => Self::Frame,
            5 => Self::MonitorBlock,
            _ => return None,
        })
    }

    #[inline(always)]
    pub const fn is_array(self) -> bool {
        matches!(self, Self::IntArray | Self::RefArray)
    }
}

/// Tri-color mark state.
///
/// White: not yet proven reachable. Gray: reachable, children still pending.
/// Black: reachable, children queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Color {
    #[default]
    White = 0,
    Gray,
    Black,
}

impl Color {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::White,
            1 => Self::Gray,
            2 => Self::Black,
            _ => return None,
        })
    }
}

/// The 12-byte header in front of every chunk payload.
///
/// ```text
/// bytes 0..4:   size   (u32 LE, header included, multiple of CHUNK_ALIGN)
/// bytes 4..8:   shift  (u32 LE, bytes the chunk moves down at compaction)
/// byte  8:      kind
/// byte  9:      color
/// bytes 10..12: reserved (zero)
/// ```
///
/// The shift is only meaningful between the shift computation and the
/// sliding step of a collection; outside a collection it is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub size: u32,
    pub shift: u32,
    pub kind: ChunkKind,
    pub color: Color,
}

impl ChunkHeader {
    pub const fn new(kind: ChunkKind, size: u32) -> Self {
        Self {
            size,
            shift: 0,
            kind,
            color: Color::White,
        }
    }

    /// Payload bytes, i.e. the size without the header.
    #[inline(always)]
    pub const fn payload_size(&self) -> u32 {
        self.size - HEADER_SIZE as u32
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.size.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.shift.to_le_bytes());
        bytes[8] = self.kind as u8;
        bytes[9] = self.color as u8;
        bytes
    }

    /// Decode a header. Fails on an unknown kind or color byte, or on a
    /// size that cannot hold a header.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
        let size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let shift = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if (size as usize) < HEADER_SIZE {
            return None;
        }
        Some(Self {
            size,
            shift,
            kind: ChunkKind::from_u8(bytes[8])?,
            color: Color::from_u8(bytes[9])?,
        })
    }
}
