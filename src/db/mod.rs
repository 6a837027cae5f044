//! The type database: every type and allocation site the instrumented
//! program knows about, keyed by small integer ids.
//!
//! The database is built once (either through the `register_*` methods or by
//! [`TypeDb::load`]) and is read-only afterwards, so it is shared between
//! threads as an `Arc<TypeDb>` without any locking. Lazily derived data
//! (struct layouts, printable names) is cached in [`OnceCell`]s.

use std::ffi::{CStr, CString};

use hashbrown::HashMap;
use log::warn;
use once_cell::sync::OnceCell;

use crate::error::Status;

pub mod builtin;
pub mod io;
pub mod layout;
pub mod types;

pub use layout::{LayoutMember, StructLayout};
pub use types::*;

/// Typedef chains longer than this are treated as malformed.
const MAX_TYPE_DEPTH: usize = 64;

#[derive(Debug)]
struct TypeEntry {
    descriptor: TypeDescriptor,
    name: OnceCell<CString>,
    layout: OnceCell<Result<StructLayout, Status>>,
}

impl TypeEntry {
    fn new(descriptor: TypeDescriptor) -> Self {
        Self {
            descriptor,
            name: OnceCell::new(),
            layout: OnceCell::new(),
        }
    }
}

#[derive(Debug)]
pub struct TypeDb {
    types: HashMap<TypeId, TypeEntry>,
    allocations: HashMap<AllocId, AllocationDescriptor>,
    next_type_id: TypeId,
    next_alloc_id: AllocId,
}

impl Default for TypeDb {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeDb {
    /// A database holding only the builtin types.
    pub fn new() -> Self {
        let mut types = HashMap::new();
        for (id, descriptor) in builtin::descriptors() {
            types.insert(id, TypeEntry::new(descriptor));
        }
        Self {
            types,
            allocations: HashMap::new(),
            next_type_id: FIRST_USER_TYPE,
            next_alloc_id: 0,
        }
    }

    /// Register a user type under a fresh id.
    pub fn register_struct(&mut self, descriptor: TypeDescriptor) -> TypeId {
        let id = self.next_type_id;
        self.types.insert(id, TypeEntry::new(descriptor));
        self.next_type_id += 1;
        id
    }

    /// Register a user type under a known id, as done when loading a
    /// persisted database. Reserved and already taken ids are rejected.
    pub fn register_type_at(&mut self, id: TypeId, descriptor: TypeDescriptor) -> Result<(), Status> {
        if id < NUM_RESERVED || self.types.contains_key(&id) {
            warn!("Refusing to register type {id}: id is reserved or already taken");
            return Err(Status::InvalidTypeId);
        }
        self.types.insert(id, TypeEntry::new(descriptor));
        self.next_type_id = self.next_type_id.max(id + 1);
        Ok(())
    }

    pub fn register_allocation(&mut self, descriptor: AllocationDescriptor) -> AllocId {
        let id = self.next_alloc_id;
        self.allocations.insert(id, descriptor);
        self.next_alloc_id += 1;
        id
    }

    pub fn register_allocation_at(
        &mut self,
        id: AllocId,
        descriptor: AllocationDescriptor,
    ) -> Result<(), Status> {
        if self.allocations.contains_key(&id) {
            warn!("Refusing to register allocation {id}: id is already taken");
            return Err(Status::InvalidAllocId);
        }
        self.allocations.insert(id, descriptor);
        self.next_alloc_id = self.next_alloc_id.max(id + 1);
        Ok(())
    }

    pub fn get_type(&self, id: TypeId) -> Result<&TypeDescriptor, Status> {
        self.types
            .get(&id)
            .map(|e| &e.descriptor)
            .ok_or(Status::InvalidTypeId)
    }

    pub fn get_allocation(&self, id: AllocId) -> Result<&AllocationDescriptor, Status> {
        self.allocations.get(&id).ok_or(Status::InvalidAllocId)
    }

    /// User types, in id order.
    pub fn user_types(&self) -> impl Iterator<Item = (TypeId, &TypeDescriptor)> {
        let mut ids: Vec<_> = self.types.keys().copied().filter(|id| *id >= NUM_RESERVED).collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| (id, &self.types[&id].descriptor))
    }

    /// Allocation sites, in id order.
    pub fn allocations(&self) -> impl Iterator<Item = (AllocId, &AllocationDescriptor)> {
        let mut ids: Vec<_> = self.allocations.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| (id, &self.allocations[&id]))
    }

    pub fn type_size_bits(&self, id: TypeId) -> Result<u64, Status> {
        Ok(self.get_type(id)?.size_bits())
    }

    /// Size of `id` in bytes.
    pub fn type_size(&self, id: TypeId) -> Result<usize, Status> {
        Ok((self.type_size_bits(id)? / 8) as usize)
    }

    pub fn is_valid(&self, id: TypeId) -> bool {
        self.types.contains_key(&id)
    }

    pub fn is_builtin(&self, id: TypeId) -> bool {
        builtin::is_builtin(id)
    }

    pub fn is_reserved(&self, id: TypeId) -> bool {
        id < NUM_RESERVED
    }

    pub fn is_unknown(&self, id: TypeId) -> bool {
        id == UNKNOWN_TYPE
    }

    pub fn is_struct(&self, id: TypeId) -> bool {
        self.get_type(id).map_or(false, TypeDescriptor::is_struct)
    }

    pub fn is_user_defined(&self, id: TypeId) -> bool {
        self.struct_flags(id).contains(StructFlags::USER_DEFINED)
    }

    pub fn is_vector(&self, id: TypeId) -> bool {
        self.struct_flags(id).contains(StructFlags::VECTOR)
    }

    fn struct_flags(&self, id: TypeId) -> StructFlags {
        match self.get_type(id) {
            Ok(TypeDescriptor::Struct { flags, .. }) => *flags,
            _ => StructFlags::empty(),
        }
    }

    /// Follow typedefs and `const`/`restrict`/`volatile` qualifiers down to
    /// the type that determines the object representation. Pointers and
    /// references are left alone.
    pub fn strip_typedefs_and_qualifiers(&self, mut id: TypeId) -> Result<TypeId, Status> {
        for _ in 0..MAX_TYPE_DEPTH {
            match self.get_type(id)? {
                TypeDescriptor::Derived {
                    kind, base_type, ..
                } if kind.is_transparent() => id = *base_type,
                _ => return Ok(id),
            }
        }
        warn!("Typedef chain starting at type {id} is too deep");
        Err(Status::Error)
    }

    /// Strip qualifiers and arrays: returns the innermost element type and
    /// the number of such elements in one `id`.
    pub fn strip_arrays(&self, mut id: TypeId) -> Result<(TypeId, usize), Status> {
        let mut count = 1usize;
        for _ in 0..MAX_TYPE_DEPTH {
            id = self.strip_typedefs_and_qualifiers(id)?;
            match self.get_type(id)? {
                array @ TypeDescriptor::Array { base_type, .. } => {
                    count = count.saturating_mul(array.flat_count() as usize);
                    id = *base_type;
                }
                _ => return Ok((id, count)),
            }
        }
        warn!("Array nesting starting at type {id} is too deep");
        Err(Status::Error)
    }

    /// The builtin id with the same object representation as `id`, if `id`
    /// is (a typedef of) a basic type.
    pub fn canonical_builtin(&self, id: TypeId) -> Option<TypeId> {
        let id = self.strip_typedefs_and_qualifiers(id).ok()?;
        if builtin::is_builtin(id) {
            return Some(id);
        }
        match self.get_type(id).ok()? {
            TypeDescriptor::Basic {
                encoding,
                size_bits,
                ..
            } => builtin::for_basic(*encoding, *size_bits),
            _ => None,
        }
    }

    pub fn type_name(&self, id: TypeId) -> String {
        self.c_type_name(id).to_string_lossy().into_owned()
    }

    /// Printable name of `id`, cached for the lifetime of the database.
    pub fn c_type_name(&self, id: TypeId) -> &CStr {
        match self.types.get(&id) {
            Some(entry) => entry
                .name
                .get_or_init(|| CString::new(self.format_name(id, 0)).unwrap_or_default()),
            None if id == UNKNOWN_TYPE => c"alloctype_unknown_struct",
            None => c"<invalid>",
        }
    }

    fn format_name(&self, id: TypeId, depth: usize) -> String {
        if depth >= MAX_TYPE_DEPTH {
            return "<...>".to_owned();
        }
        let Ok(descriptor) = self.get_type(id) else {
            return builtin::name(id).unwrap_or("<invalid>").to_owned();
        };
        let name = match descriptor {
            TypeDescriptor::Void => "void".to_owned(),
            TypeDescriptor::Subroutine => "<subroutine>".to_owned(),
            TypeDescriptor::Basic { name, .. }
            | TypeDescriptor::Struct { name, .. }
            | TypeDescriptor::Union { name, .. }
            | TypeDescriptor::Enumeration { name, .. } => name.clone(),
            TypeDescriptor::Array {
                base_type,
                dim_counts,
                ..
            } => {
                let mut name = self.format_name(*base_type, depth + 1);
                for dim in dim_counts {
                    name.push_str(&format!("[{dim}]"));
                }
                name
            }
            TypeDescriptor::Derived {
                kind,
                name,
                base_type,
                ..
            } => {
                let base = self.format_name(*base_type, depth + 1);
                match kind {
                    DerivedKind::Typedef if !name.is_empty() => name.clone(),
                    DerivedKind::Typedef => base,
                    DerivedKind::Pointer => format!("{base}*"),
                    DerivedKind::Reference => format!("{base}&"),
                    DerivedKind::RvalueReference => format!("{base}&&"),
                    DerivedKind::Const => format!("const {base}"),
                    DerivedKind::Volatile => format!("volatile {base}"),
                    DerivedKind::Restrict => format!("{base} restrict"),
                    DerivedKind::PtrToMember => format!("{base}::*"),
                }
            }
        };
        if name.is_empty() {
            format!("<anonymous {id}>")
        } else {
            name
        }
    }

    /// The flattened first-level layout of a struct type.
    pub fn struct_layout(&self, id: TypeId) -> Result<&StructLayout, Status> {
        let entry = self.types.get(&id).ok_or(Status::InvalidTypeId)?;
        entry
            .layout
            .get_or_init(|| self.build_layout(id, &entry.descriptor))
            .as_ref()
            .map_err(|status| *status)
    }

    fn build_layout(&self, id: TypeId, descriptor: &TypeDescriptor) -> Result<StructLayout, Status> {
        let TypeDescriptor::Struct {
            name,
            size_bits,
            members,
            bases,
            ..
        } = descriptor
        else {
            return Err(Status::WrongKind);
        };

        let mut flat = Vec::with_capacity(bases.len() + members.len());
        for base in bases {
            let size = self.type_size(base.base)?;
            if size == 0 {
                continue;
            }
            flat.push(LayoutMember {
                name: self.type_name(base.base),
                offset: (base.offset_bits / 8) as usize,
                type_id: base.base,
                count: 1,
                size,
                is_base: true,
            });
        }
        for member in members {
            let (type_id, count) = self.strip_arrays(member.type_id)?;
            let (type_id, count) = if count == 1 && type_id != member.type_id {
                // keep typedef names for scalars
                (member.type_id, 1)
            } else {
                (type_id, count)
            };
            flat.push(LayoutMember {
                name: member.name.clone(),
                offset: (member.offset_bits / 8) as usize,
                type_id,
                count,
                size: (member.size_bits / 8) as usize,
                is_base: false,
            });
        }

        Ok(StructLayout::new(id, name.clone(), (*size_bits / 8) as usize, flat))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn basic_member(name: &str, type_id: TypeId, offset: u64, size: u64) -> Member {
        Member {
            name: name.to_owned(),
            type_id,
            offset_bits: offset * 8,
            size_bits: size * 8,
        }
    }

    pub fn plain_struct(name: &str, size: u64, members: Vec<Member>) -> TypeDescriptor {
        TypeDescriptor::Struct {
            name: name.to_owned(),
            size_bits: size * 8,
            members,
            bases: Vec::new(),
            flags: StructFlags::USER_DEFINED,
        }
    }

    pub fn array_of(base_type: TypeId, elem_size: u64, dims: &[u64]) -> TypeDescriptor {
        TypeDescriptor::Array {
            base_type,
            size_bits: elem_size * 8 * dims.iter().product::<u64>(),
            dim_counts: dims.to_vec(),
        }
    }

    #[test]
    fn builtins_are_preloaded() {
        let db = TypeDb::new();
        assert!(db.is_valid(builtin::DOUBLE));
        assert!(db.is_builtin(builtin::POINTER));
        assert!(!db.is_struct(builtin::INT32));
        assert_eq!(db.type_size(builtin::DOUBLE), Ok(8));
        assert_eq!(db.type_name(builtin::INT64), "int64");
        assert_eq!(db.get_type(NUM_RESERVED), Err(Status::InvalidTypeId));
        assert_eq!(db.get_allocation(0).err(), Some(Status::InvalidAllocId));
        assert!(!db.is_valid(UNKNOWN_TYPE));
        assert_eq!(db.type_name(UNKNOWN_TYPE), builtin::UNKNOWN_NAME);
    }

    #[test]
    fn registration_hands_out_user_ids() {
        let mut db = TypeDb::new();
        let a = db.register_struct(plain_struct("A", 4, vec![basic_member("x", builtin::INT32, 0, 4)]));
        let b = db.register_struct(plain_struct("B", 8, vec![basic_member("y", builtin::DOUBLE, 0, 8)]));
        assert_eq!(a, FIRST_USER_TYPE);
        assert_eq!(b, FIRST_USER_TYPE + 1);
        assert!(db.is_struct(a));
        assert!(db.is_user_defined(a));
        assert!(!db.is_vector(a));
        assert!(!db.is_reserved(a));
        assert_eq!(db.register_type_at(a, TypeDescriptor::Void), Err(Status::InvalidTypeId));
        assert_eq!(db.register_type_at(3, TypeDescriptor::Void), Err(Status::InvalidTypeId));
        assert_eq!(db.register_type_at(400, TypeDescriptor::Void), Ok(()));
        assert_eq!(db.register_struct(TypeDescriptor::Void), 401);

        let alloc = db.register_allocation(AllocationDescriptor::new(a, AllocKind::Heap));
        assert_eq!(db.get_allocation(alloc).map(|d| d.type_id), Ok(a));
        assert_eq!(
            db.register_allocation_at(alloc, AllocationDescriptor::new(b, AllocKind::Heap)),
            Err(Status::InvalidAllocId)
        );
    }

    #[test]
    fn strip_keeps_pointers() {
        let mut db = TypeDb::new();
        let typedef = db.register_struct(TypeDescriptor::Derived {
            kind: DerivedKind::Typedef,
            name: "real".into(),
            base_type: builtin::DOUBLE,
            size_bits: 64,
        });
        let konst = db.register_struct(TypeDescriptor::Derived {
            kind: DerivedKind::Const,
            name: String::new(),
            base_type: typedef,
            size_bits: 64,
        });
        let ptr = db.register_struct(TypeDescriptor::Derived {
            kind: DerivedKind::Pointer,
            name: String::new(),
            base_type: konst,
            size_bits: 64,
        });
        assert_eq!(db.strip_typedefs_and_qualifiers(konst), Ok(builtin::DOUBLE));
        assert_eq!(db.strip_typedefs_and_qualifiers(ptr), Ok(ptr));
        assert_eq!(db.canonical_builtin(konst), Some(builtin::DOUBLE));
        assert_eq!(db.canonical_builtin(ptr), None);
        assert_eq!(db.type_name(konst), "const real");
        assert_eq!(db.type_name(ptr), "const real*");
    }

    #[test]
    fn self_referential_typedef_is_an_error() {
        let mut db = TypeDb::new();
        db.register_type_at(
            300,
            TypeDescriptor::Derived {
                kind: DerivedKind::Typedef,
                name: String::new(),
                base_type: 300,
                size_bits: 0,
            },
        )
        .unwrap();
        assert_eq!(db.strip_typedefs_and_qualifiers(300), Err(Status::Error));
        assert_eq!(db.type_name(300), "<...>");
    }

    #[test]
    fn layout_flattens_bases_and_arrays() {
        let mut db = TypeDb::new();
        let base = db.register_struct(plain_struct("Base", 8, vec![basic_member("id", builtin::INT64, 0, 8)]));
        let empty = db.register_struct(plain_struct("Empty", 0, vec![]));
        let arr = db.register_struct(array_of(builtin::FLOAT, 4, &[2, 3]));
        let derived = db.register_struct(TypeDescriptor::Struct {
            name: "Derived".into(),
            size_bits: 40 * 8,
            members: vec![
                basic_member("values", arr, 8, 24),
                basic_member("tail", builtin::INT32, 32, 4),
            ],
            bases: vec![
                Inheritance {
                    base: empty,
                    offset_bits: 0,
                },
                Inheritance {
                    base,
                    offset_bits: 0,
                },
            ],
            flags: StructFlags::USER_DEFINED,
        });

        let layout = db.struct_layout(derived).unwrap();
        assert_eq!(layout.extent, 40);
        assert_eq!(layout.num_members(), 3);
        assert_eq!(layout.offsets(), &[0, 8, 32]);
        assert_eq!(layout.member_types(), &[base as i32, builtin::FLOAT as i32, builtin::INT32 as i32]);
        assert_eq!(layout.counts(), &[1, 6, 1]);
        assert!(layout.members[0].is_base);
        assert_eq!(layout.members[0].name, "Base");
        assert_eq!(db.struct_layout(builtin::INT32).err(), Some(Status::WrongKind));
        assert_eq!(db.struct_layout(9999).err(), Some(Status::InvalidTypeId));
        assert_eq!(db.type_name(arr), "float[2][3]");
    }
}
