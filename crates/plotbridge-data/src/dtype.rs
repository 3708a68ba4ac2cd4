use std::fmt;

/// Element types that can cross the bridge.
///
/// Each variant maps to one type-code character understood by the companion
/// (`struct`/array module convention) and a fixed element size. The table is
/// closed: adding a type means adding a variant here and an [`Element`] impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Character data, one byte per element.
    Char,
}

impl DType {
    /// Every supported element type.
    pub const ALL: [DType; 11] = [
        DType::I8,
        DType::U8,
        DType::I16,
        DType::U16,
        DType::I32,
        DType::U32,
        DType::I64,
        DType::U64,
        DType::F32,
        DType::F64,
        DType::Char,
    ];

    /// The type-code character written into data headers.
    pub const fn code(self) -> char {
        match self {
            DType::I8 => 'b',
            DType::U8 => 'B',
            DType::I16 => 'h',
            DType::U16 => 'H',
            DType::I32 => 'i',
            DType::U32 => 'I',
            DType::I64 => 'q',
            DType::U64 => 'Q',
            DType::F32 => 'f',
            DType::F64 => 'd',
            DType::Char => 'c',
        }
    }

    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DType::I8 | DType::U8 | DType::Char => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    /// Resolve a type-code character back to its element type.
    pub fn from_code(code: char) -> Option<DType> {
        DType::ALL.into_iter().find(|dtype| dtype.code() == code)
    }

    /// Human-readable element type name.
    pub const fn name(self) -> &'static str {
        match self {
            DType::I8 => "int8",
            DType::U8 => "uint8",
            DType::I16 => "int16",
            DType::U16 => "uint16",
            DType::I32 => "int32",
            DType::U32 => "uint32",
            DType::I64 => "int64",
            DType::U64 => "uint64",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::Char => "char",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A plain numeric element type with a fixed [`DType`].
///
/// Sealed: implemented for exactly the ten numeric primitives. Containers of
/// any other element type do not implement [`Container`](crate::Container)
/// and are rejected at compile time.
pub trait Element: bytemuck::Pod + fmt::Debug + PartialEq + sealed::Sealed {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;
            }

            const _: () = assert!(std::mem::size_of::<$ty>() == DType::$dtype.size());
        )*
    };
}

impl_element! {
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}
