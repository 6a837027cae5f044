use super::types::{Encoding, TypeDescriptor, TypeId, UNKNOWN_TYPE};

pub const INT8: TypeId = 0;
pub const INT16: TypeId = 1;
pub const INT32: TypeId = 2;
pub const INT64: TypeId = 3;
pub const HALF: TypeId = 4;
pub const FLOAT: TypeId = 5;
pub const DOUBLE: TypeId = 6;
pub const FLOAT128: TypeId = 7;
pub const X86_FLOAT80: TypeId = 8;
pub const PPC_FLOAT128: TypeId = 9;
pub const POINTER: TypeId = 10;

/// Number of builtin ids, all of which are `< NUM_BUILTINS`.
pub const NUM_BUILTINS: TypeId = 11;

/// `(name, encoding, size in bytes)` for every builtin id, indexed by id.
const BUILTINS: [(&str, Encoding, u64); NUM_BUILTINS as usize] = [
    ("int8", Encoding::Signed, 1),
    ("int16", Encoding::Signed, 2),
    ("int32", Encoding::Signed, 4),
    ("int64", Encoding::Signed, 8),
    ("half", Encoding::Float, 2),
    ("float", Encoding::Float, 4),
    ("double", Encoding::Float, 8),
    ("float128", Encoding::Float, 16),
    ("x86_float80", Encoding::Float, 16),
    ("ppc_float128", Encoding::Float, 16),
    ("pointer", Encoding::Address, 8),
];

pub const UNKNOWN_NAME: &str = "alloctype_unknown_struct";

pub fn is_builtin(id: TypeId) -> bool {
    id < NUM_BUILTINS
}

pub fn name(id: TypeId) -> Option<&'static str> {
    if id == UNKNOWN_TYPE {
        return Some(UNKNOWN_NAME);
    }
    BUILTINS.get(id as usize).map(|(name, _, _)| *name)
}

pub fn size(id: TypeId) -> Option<u64> {
    BUILTINS.get(id as usize).map(|(_, _, size)| *size)
}

/// Descriptors for every builtin, in id order.
pub fn descriptors() -> impl Iterator<Item = (TypeId, TypeDescriptor)> {
    BUILTINS
        .iter()
        .enumerate()
        .map(|(id, (name, encoding, size))| {
            (
                id as TypeId,
                TypeDescriptor::Basic {
                    name: (*name).to_owned(),
                    encoding: *encoding,
                    size_bits: size * 8,
                },
            )
        })
}

/// Map a basic type onto the builtin with the same object representation.
/// Integer encodings only differ in signedness, which the builtin table does
/// not distinguish. All 16 byte floats share [`FLOAT128`].
pub fn for_basic(encoding: Encoding, size_bits: u64) -> Option<TypeId> {
    let id = match (encoding, size_bits) {
        (
            Encoding::Signed
            | Encoding::Unsigned
            | Encoding::SignedChar
            | Encoding::UnsignedChar
            | Encoding::Boolean,
            bits,
        ) => match bits {
            8 => INT8,
            16 => INT16,
            32 => INT32,
            64 => INT64,
            _ => return None,
        },
        (Encoding::Float, 16) => HALF,
        (Encoding::Float, 32) => FLOAT,
        (Encoding::Float, 64) => DOUBLE,
        (Encoding::Float, 80 | 128) => FLOAT128,
        (Encoding::Address, 64) => POINTER,
        _ => return None,
    };
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_is_consistent() {
        assert_eq!(name(DOUBLE), Some("double"));
        assert_eq!(size(DOUBLE), Some(8));
        assert_eq!(size(X86_FLOAT80), Some(16));
        assert_eq!(size(POINTER), Some(8));
        assert_eq!(name(UNKNOWN_TYPE), Some(UNKNOWN_NAME));
        assert_eq!(size(UNKNOWN_TYPE), None);
        assert_eq!(descriptors().count(), NUM_BUILTINS as usize);
    }

    #[test]
    fn basics_map_to_builtins() {
        assert_eq!(for_basic(Encoding::Unsigned, 32), Some(INT32));
        assert_eq!(for_basic(Encoding::Float, 64), Some(DOUBLE));
        assert_eq!(for_basic(Encoding::Float, 128), Some(FLOAT128));
        assert_eq!(for_basic(Encoding::Float, 80), Some(FLOAT128));
        assert_eq!(for_basic(Encoding::Float, 24), None);
    }
}
