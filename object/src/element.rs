/// Primitive element type of an int array.
///
/// The discriminants are the `newarray` type codes, so they can be stored
/// in the array header as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl ElementType {
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            4 => Self::Boolean,
            5 => Self::Char,
            6 => Self::Float,
            7 => Self::Double,
            8 => Self::Byte,
            9 => Self::Short,
            10 => Self::Int,
            11 => Self::Long,
            _ => return None,
        })
    }

    /// Storage width of one element in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::Boolean | Self::Byte => 1,
            // chars are stored narrow
            Self::Char => 1,
            Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
        }
    }

    /// Whether reads should sign-extend.
    pub const fn is_signed(self) -> bool {
        !matches!(self, Self::Boolean | Self::Char)
    }
}
