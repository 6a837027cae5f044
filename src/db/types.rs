use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Identifies a [`TypeDescriptor`]. Ids below [`NUM_RESERVED`] are reserved
/// for builtins.
pub type TypeId = u32;

/// Identifies an [`AllocationDescriptor`], embedded in instrumented calls.
pub type AllocId = u32;

/// Number of type ids reserved for builtins.
pub const NUM_RESERVED: TypeId = 256;

/// Id used for allocations whose type could not be determined.
pub const UNKNOWN_TYPE: TypeId = 255;

/// The first id handed out to user-registered types.
pub const FIRST_USER_TYPE: TypeId = NUM_RESERVED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    Unspecified,
    Address,
    Boolean,
    Float,
    Signed,
    Unsigned,
    SignedChar,
    UnsignedChar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DerivedKind {
    Typedef,
    Pointer,
    Reference,
    RvalueReference,
    Const,
    Restrict,
    Volatile,
    PtrToMember,
}

impl DerivedKind {
    /// Typedefs and qualifiers name the same object representation as their
    /// base type; pointers and references do not.
    pub const fn is_transparent(self) -> bool {
        matches!(
            self,
            DerivedKind::Typedef | DerivedKind::Const | DerivedKind::Restrict | DerivedKind::Volatile
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct StructFlags: u32 {
        /// Declared in user code (as opposed to synthesized)
        const USER_DEFINED = 1 << 0;
        /// A compiler vector type laid out like a struct of lanes
        const VECTOR = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub type_id: TypeId,
    pub offset_bits: u64,
    pub size_bits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inheritance {
    pub base: TypeId,
    pub offset_bits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TypeDescriptor {
    Void,
    Basic {
        name: String,
        encoding: Encoding,
        size_bits: u64,
    },
    Struct {
        name: String,
        size_bits: u64,
        #[serde(default)]
        members: Vec<Member>,
        #[serde(default)]
        bases: Vec<Inheritance>,
        #[serde(default)]
        flags: StructFlags,
    },
    Union {
        name: String,
        size_bits: u64,
        #[serde(default)]
        members: Vec<Member>,
    },
    Array {
        base_type: TypeId,
        size_bits: u64,
        dim_counts: Vec<u64>,
    },
    Enumeration {
        name: String,
        size_bits: u64,
    },
    Derived {
        kind: DerivedKind,
        #[serde(default)]
        name: String,
        base_type: TypeId,
        size_bits: u64,
    },
    Subroutine,
}

impl TypeDescriptor {
    pub fn size_bits(&self) -> u64 {
        match self {
            TypeDescriptor::Void | TypeDescriptor::Subroutine => 0,
            TypeDescriptor::Basic { size_bits, .. }
            | TypeDescriptor::Struct { size_bits, .. }
            | TypeDescriptor::Union { size_bits, .. }
            | TypeDescriptor::Array { size_bits, .. }
            | TypeDescriptor::Enumeration { size_bits, .. }
            | TypeDescriptor::Derived { size_bits, .. } => *size_bits,
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, TypeDescriptor::Struct { .. })
    }

    /// Product of all dimensions, i.e. the number of base elements in an
    /// array. `1` for everything that is not an array.
    pub fn flat_count(&self) -> u64 {
        match self {
            TypeDescriptor::Array { dim_counts, .. } => dim_counts.iter().product(),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocKind {
    Stack,
    Heap,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub function: String,
    pub line: u32,
}

/// Everything known statically about one allocation site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDescriptor {
    pub type_id: TypeId,
    /// Element count fixed at compile time; `None` for VLAs and dynamic
    /// allocations, whose count is recorded at runtime.
    #[serde(default)]
    pub static_count: Option<usize>,
    pub kind: AllocKind,
    #[serde(default)]
    pub location: Option<SourceLocation>,
    /// Distance from the region slot start to the user data, for sites
    /// instrumented for the region allocator.
    #[serde(default)]
    pub base_ptr_offset: Option<usize>,
}

impl AllocationDescriptor {
    pub fn new(type_id: TypeId, kind: AllocKind) -> Self {
        Self {
            type_id,
            static_count: None,
            kind,
            location: None,
            base_ptr_offset: None,
        }
    }

    pub fn with_static_count(mut self, count: usize) -> Self {
        self.static_count = Some(count);
        self
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_base_ptr_offset(mut self, offset: usize) -> Self {
        self.base_ptr_offset = Some(offset);
        self
    }
}
