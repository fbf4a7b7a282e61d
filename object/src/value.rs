/// Width in bytes of a reference slot stored inside the arena.
pub const REF_SIZE: usize = 4;

/// An absolute address.
///
/// A `Ref` normally designates the first payload byte of a chunk. Address
/// zero is the null reference. The value itself does not know whether it
/// points into the heap arena or at some native buffer; only the heap can
/// answer that with a range test.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Ref(u32);

impl Ref {
    pub const NULL: Ref = Ref(0);

    #[inline(always)]
    pub const fn from_addr(addr: u32) -> Self {
        Self(addr)
    }

    #[inline(always)]
    pub const fn addr(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `None` for null, the reference otherwise.
    #[inline(always)]
    pub const fn non_null(self) -> Option<Ref> {
        if self.is_null() { None } else { Some(self) }
    }

    #[inline(always)]
    pub const fn to_le_bytes(self) -> [u8; REF_SIZE] {
        self.0.to_le_bytes()
    }

    #[inline(always)]
    pub const fn from_le_bytes(bytes: [u8; REF_SIZE]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl core::fmt::Debug for Ref {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_null() {
            write!(f, "Ref(null)")
        } else {
            write!(f, "Ref(0x{:x})", self.0)
        }
    }
}
