//! Message datatype descriptions: the combiner tree a wire datatype was
//! built from, as the message passing library reports it.

use std::{
    fmt,
    mem::size_of,
    os::raw::{c_int, c_long, c_longlong, c_short},
};

use crate::db::{builtin, TypeId};

/// Predefined datatypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedType {
    Char,
    SignedChar,
    UnsignedChar,
    Short,
    UnsignedShort,
    Int,
    Unsigned,
    Long,
    UnsignedLong,
    LongLong,
    UnsignedLongLong,
    Float,
    Double,
    LongDouble,
    /// Raw bytes, matching any buffer type
    Byte,
}

/// Size of `long double` in memory.
const LONG_DOUBLE_SIZE: usize = if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
    16
} else {
    size_of::<f64>()
};

impl NamedType {
    pub const fn name(self) -> &'static str {
        match self {
            NamedType::Char => "MPI_CHAR",
            NamedType::SignedChar => "MPI_SIGNED_CHAR",
            NamedType::UnsignedChar => "MPI_UNSIGNED_CHAR",
            NamedType::Short => "MPI_SHORT",
            NamedType::UnsignedShort => "MPI_UNSIGNED_SHORT",
            NamedType::Int => "MPI_INT",
            NamedType::Unsigned => "MPI_UNSIGNED",
            NamedType::Long => "MPI_LONG",
            NamedType::UnsignedLong => "MPI_UNSIGNED_LONG",
            NamedType::LongLong => "MPI_LONG_LONG",
            NamedType::UnsignedLongLong => "MPI_UNSIGNED_LONG_LONG",
            NamedType::Float => "MPI_FLOAT",
            NamedType::Double => "MPI_DOUBLE",
            NamedType::LongDouble => "MPI_LONG_DOUBLE",
            NamedType::Byte => "MPI_BYTE",
        }
    }

    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            NamedType::Char | NamedType::SignedChar | NamedType::UnsignedChar | NamedType::Byte => 1,
            NamedType::Short | NamedType::UnsignedShort => size_of::<c_short>(),
            NamedType::Int | NamedType::Unsigned => size_of::<c_int>(),
            NamedType::Long | NamedType::UnsignedLong => size_of::<c_long>(),
            NamedType::LongLong | NamedType::UnsignedLongLong => size_of::<c_longlong>(),
            NamedType::Float => size_of::<f32>(),
            NamedType::Double => size_of::<f64>(),
            NamedType::LongDouble => LONG_DOUBLE_SIZE,
        }
    }

    /// The builtin type a buffer element must canonicalise to; `None` for
    /// [`NamedType::Byte`]. Integers map by size, signedness is not part of
    /// the builtin table.
    pub const fn builtin(self) -> Option<TypeId> {
        Some(match self {
            NamedType::Byte => return None,
            NamedType::Float => builtin::FLOAT,
            NamedType::Double => builtin::DOUBLE,
            NamedType::LongDouble if LONG_DOUBLE_SIZE == 16 => builtin::FLOAT128,
            NamedType::LongDouble => builtin::DOUBLE,
            _ => match self.size() {
                1 => builtin::INT8,
                2 => builtin::INT16,
                4 => builtin::INT32,
                8 => builtin::INT64,
                _ => return None,
            },
        })
    }
}

impl fmt::Display for NamedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Combiner {
    Named(NamedType),
    Dup,
    Contiguous,
    Vector,
    IndexedBlock,
    Struct,
    Subarray,
    /// Any combiner without a type check, by name
    Other(String),
}

impl Combiner {
    pub fn name(&self) -> &str {
        match self {
            Combiner::Named(_) => "MPI predefined datatype",
            Combiner::Dup => "MPI_Type_dup",
            Combiner::Contiguous => "MPI_Type_contiguous",
            Combiner::Vector => "MPI_Type_vector",
            Combiner::IndexedBlock => "MPI_Type_create_indexed_block",
            Combiner::Struct => "MPI_Type_struct",
            Combiner::Subarray => "MPI_Type_create_subarray",
            Combiner::Other(name) => name,
        }
    }
}

/// A datatype together with the arguments of the combiner that built it,
/// laid out like the library's envelope/contents queries return them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datatype {
    pub combiner: Combiner,
    pub integer_args: Vec<i64>,
    /// Byte displacements
    pub address_args: Vec<i64>,
    pub type_args: Vec<Datatype>,
}

impl Datatype {
    fn derived(combiner: Combiner, integer_args: Vec<i64>, address_args: Vec<i64>, type_args: Vec<Datatype>) -> Self {
        Self {
            combiner,
            integer_args,
            address_args,
            type_args,
        }
    }

    pub fn named(named: NamedType) -> Self {
        Self::derived(Combiner::Named(named), Vec::new(), Vec::new(), Vec::new())
    }

    pub fn dup(oldtype: Datatype) -> Self {
        Self::derived(Combiner::Dup, Vec::new(), Vec::new(), vec![oldtype])
    }

    pub fn contiguous(count: i64, oldtype: Datatype) -> Self {
        Self::derived(Combiner::Contiguous, vec![count], Vec::new(), vec![oldtype])
    }

    pub fn vector(count: i64, blocklength: i64, stride: i64, oldtype: Datatype) -> Self {
        Self::derived(Combiner::Vector, vec![count, blocklength, stride], Vec::new(), vec![oldtype])
    }

    pub fn indexed_block(blocklength: i64, displacements: &[i64], oldtype: Datatype) -> Self {
        let mut args = vec![displacements.len() as i64, blocklength];
        args.extend_from_slice(displacements);
        Self::derived(Combiner::IndexedBlock, args, Vec::new(), vec![oldtype])
    }

    /// `blocklengths`, `displacements` and `types` pair up by index.
    pub fn structure(blocklengths: &[i64], displacements: &[i64], types: Vec<Datatype>) -> Self {
        let mut args = vec![blocklengths.len() as i64];
        args.extend_from_slice(blocklengths);
        Self::derived(Combiner::Struct, args, displacements.to_vec(), types)
    }

    pub fn subarray(sizes: &[i64], subsizes: &[i64], starts: &[i64], order: i64, oldtype: Datatype) -> Self {
        let mut args = vec![sizes.len() as i64];
        args.extend_from_slice(sizes);
        args.extend_from_slice(subsizes);
        args.extend_from_slice(starts);
        args.push(order);
        Self::derived(Combiner::Subarray, args, Vec::new(), vec![oldtype])
    }

    pub fn other(name: impl Into<String>, integer_args: Vec<i64>, address_args: Vec<i64>, type_args: Vec<Datatype>) -> Self {
        Self::derived(Combiner::Other(name.into()), integer_args, address_args, type_args)
    }

    /// Name used in diagnostics: the predefined name, or the combiner.
    pub fn name(&self) -> &str {
        match &self.combiner {
            Combiner::Named(named) => named.name(),
            other => other.name(),
        }
    }
}

impl From<NamedType> for Datatype {
    fn from(named: NamedType) -> Self {
        Datatype::named(named)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_types_match_c() {
        assert_eq!(NamedType::Int.size(), 4);
        assert_eq!(NamedType::Double.size(), 8);
        assert_eq!(NamedType::Byte.builtin(), None);
        assert_eq!(NamedType::Char.builtin(), Some(builtin::INT8));
        assert_eq!(NamedType::UnsignedChar.builtin(), Some(builtin::INT8));
        assert_eq!(NamedType::Unsigned.builtin(), Some(builtin::INT32));
        assert_eq!(NamedType::LongLong.builtin(), Some(builtin::INT64));
        assert_eq!(NamedType::Float.builtin(), Some(builtin::FLOAT));
    }

    #[test]
    fn constructors_lay_out_arguments() {
        let block = Datatype::indexed_block(2, &[0, 6, 3], NamedType::Float.into());
        assert_eq!(block.integer_args, [3, 2, 0, 6, 3]);

        let sub = Datatype::subarray(&[4, 5], &[2, 2], &[1, 1], 0, NamedType::Int.into());
        assert_eq!(sub.integer_args, [2, 4, 5, 2, 2, 1, 1, 0]);

        let st = Datatype::structure(&[1, 3], &[0, 8], vec![NamedType::Int.into(), NamedType::Double.into()]);
        assert_eq!(st.integer_args, [2, 1, 3]);
        assert_eq!(st.address_args, [0, 8]);
        assert_eq!(st.name(), "MPI_Type_struct");
        assert_eq!(Datatype::named(NamedType::Double).name(), "MPI_DOUBLE");
    }
}
