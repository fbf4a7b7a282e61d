/// Identifies a class in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ClassId(pub u16);

/// Identifies a method: the declaring class plus the method's index in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MethodId {
    pub class: ClassId,
    pub index: u16,
}

impl MethodId {
    pub const fn new(class: ClassId, index: u16) -> Self {
        Self { class, index }
    }

    /// Packed form stored in frame headers: class in the low half.
    pub const fn to_bits(self) -> u32 {
        (self.class.0 as u32) | ((self.index as u32) << 16)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self {
            class: ClassId(bits as u16),
            index: (bits >> 16) as u16,
        }
    }
}
