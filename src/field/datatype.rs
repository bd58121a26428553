//! Field datatypes.

use serde::{Deserialize, Serialize};

/// Closed set of datatypes a record field may have.
///
/// `Hex` is stored as `u64` and `RecordRef` as the referenced record's name;
/// both are distinct types for type-exactness purposes even though they share
/// storage with `ULong` and `String`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Text.
    String,
    /// Signed 8-bit integer.
    Char,
    /// Unsigned 8-bit integer.
    UChar,
    /// Signed 16-bit integer.
    Short,
    /// Unsigned 16-bit integer.
    UShort,
    /// Signed 32-bit integer.
    Int,
    /// Unsigned 32-bit integer.
    UInt,
    /// Signed 64-bit integer.
    Long,
    /// Unsigned 64-bit integer.
    ULong,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Boolean.
    Bool,
    /// Unsigned 64-bit integer shown in hexadecimal.
    Hex,
    /// Name of another record.
    RecordRef,
}

/// In-memory storage class used by [`crate::field::Elements`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// `i8`
    Char,
    /// `u8`
    UChar,
    /// `i16`
    Short,
    /// `u16`
    UShort,
    /// `i32`
    Int,
    /// `u32`
    UInt,
    /// `i64`
    Long,
    /// `u64`
    ULong,
    /// `f32`
    Float,
    /// `f64`
    Double,
    /// `bool`
    Bool,
    /// `String`
    String,
}

impl FieldType {
    const ALL: [FieldType; 14] = [
        FieldType::String,
        FieldType::Char,
        FieldType::UChar,
        FieldType::Short,
        FieldType::UShort,
        FieldType::Int,
        FieldType::UInt,
        FieldType::Long,
        FieldType::ULong,
        FieldType::Float,
        FieldType::Double,
        FieldType::Bool,
        FieldType::Hex,
        FieldType::RecordRef,
    ];

    /// Storage class of values of this type.
    pub fn element_kind(&self) -> ElementKind {
        match self {
            FieldType::String | FieldType::RecordRef => ElementKind::String,
            FieldType::Char => ElementKind::Char,
            FieldType::UChar => ElementKind::UChar,
            FieldType::Short => ElementKind::Short,
            FieldType::UShort => ElementKind::UShort,
            FieldType::Int => ElementKind::Int,
            FieldType::UInt => ElementKind::UInt,
            FieldType::Long => ElementKind::Long,
            FieldType::ULong | FieldType::Hex => ElementKind::ULong,
            FieldType::Float => ElementKind::Float,
            FieldType::Double => ElementKind::Double,
            FieldType::Bool => ElementKind::Bool,
        }
    }

    /// Wire code. Stable across releases.
    pub fn code(&self) -> u32 {
        match self {
            FieldType::String => 1,
            FieldType::Char => 2,
            FieldType::UChar => 3,
            FieldType::Short => 4,
            FieldType::UShort => 5,
            FieldType::Int => 6,
            FieldType::UInt => 7,
            FieldType::Long => 8,
            FieldType::ULong => 9,
            FieldType::Float => 10,
            FieldType::Double => 11,
            FieldType::Bool => 12,
            FieldType::Hex => 13,
            FieldType::RecordRef => 14,
        }
    }

    /// Inverse of [`FieldType::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Name used in record descriptions and messages.
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Char => "char",
            FieldType::UChar => "uchar",
            FieldType::Short => "short",
            FieldType::UShort => "ushort",
            FieldType::Int => "int",
            FieldType::UInt => "uint",
            FieldType::Long => "long",
            FieldType::ULong => "ulong",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Bool => "bool",
            FieldType::Hex => "hex",
            FieldType::RecordRef => "record",
        }
    }

    /// Integer or floating point.
    pub fn is_numeric(&self) -> bool {
        !matches!(
            self.element_kind(),
            ElementKind::String | ElementKind::Bool
        )
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_unique_and_reversible() {
        for ty in FieldType::ALL {
            assert_eq!(FieldType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(FieldType::from_code(0), None);
    }

    #[test]
    fn hex_and_record_share_storage_but_not_identity() {
        assert_eq!(FieldType::Hex.element_kind(), FieldType::ULong.element_kind());
        assert_ne!(FieldType::Hex, FieldType::ULong);
        assert_eq!(FieldType::RecordRef.element_kind(), ElementKind::String);
        assert!(!FieldType::RecordRef.is_numeric());
    }
}
