//! Pointer resolution: from a live allocation and an address inside it to
//! the exact subobject type and remaining element count at that address.
//!
//! Resolution never touches the memory it describes; it only does
//! arithmetic on addresses against the [`TypeDb`].

use log::{trace, warn};

use crate::{
    db::{AllocId, StructLayout, TypeDb, TypeDescriptor, TypeId},
    error::Status,
};

/// What is known about the memory at `base_addr`: `count` consecutive
/// elements of `type_id`, belonging to the allocation site `alloc_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerInfo {
    pub base_addr: usize,
    pub alloc_id: AllocId,
    pub type_id: TypeId,
    pub count: usize,
    /// Return address of the instrumented allocation call, 0 if unknown
    pub return_addr: usize,
}

impl PointerInfo {
    /// Narrow to `count` elements of `type_id` at `base_addr`, keeping the
    /// allocation provenance.
    pub fn narrowed(&self, base_addr: usize, type_id: TypeId, count: usize) -> Self {
        Self {
            base_addr,
            type_id,
            count,
            ..*self
        }
    }
}

/// One step into a struct, as returned by [`Resolver::subtype_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtypeInfo {
    /// Address of the element of the member that contains the offset
    pub base_addr: usize,
    pub type_id: TypeId,
    /// Elements of `type_id` left in the member, starting at `base_addr`
    pub count: usize,
}

pub struct Resolver<'db> {
    db: &'db TypeDb,
}

impl<'db> Resolver<'db> {
    pub fn new(db: &'db TypeDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &'db TypeDb {
        self.db
    }

    /// Resolve `addr` against the allocation described by `info`, descending
    /// into structs and arrays until `addr` sits on an element boundary.
    pub fn resolve(&self, info: PointerInfo, addr: usize) -> Result<PointerInfo, Status> {
        if addr == info.base_addr {
            return Ok(info);
        }
        let (elem, offset) = self.containing_info(info, addr)?;
        if offset == 0 {
            return Ok(elem);
        }
        self.resolve_within(elem, offset).map_err(|status| match status {
            Status::BadOffset => Status::BadAlignment,
            other => other,
        })
    }

    /// Find the element of `info` that `addr` falls into. Returns that
    /// element (with the count of the remaining subrange) and the byte offset
    /// of `addr` inside it.
    pub fn containing_info(&self, info: PointerInfo, addr: usize) -> Result<(PointerInfo, usize), Status> {
        let size = self.db.type_size(info.type_id)?;
        let Some(dif) = addr.checked_sub(info.base_addr) else {
            warn!(
                "Address {addr:#x} lies {} bytes before allocation {:#x}",
                info.base_addr - addr,
                info.base_addr
            );
            return Err(Status::UnknownAddress);
        };
        if size == 0 {
            return if dif == 0 {
                Ok((info, 0))
            } else {
                Err(Status::UnknownAddress)
            };
        }

        let index = dif / size;
        if index >= info.count {
            warn!(
                "Out of bounds for the lookup: ({addr:#x}) [{} x {}] @ {:#x}, {} element(s) past the end",
                info.count,
                self.db.type_name(info.type_id),
                info.base_addr,
                index - info.count + 1
            );
            return Err(Status::UnknownAddress);
        }

        let elem = info.narrowed(info.base_addr + index * size, info.type_id, info.count - index);
        Ok((elem, dif % size))
    }

    /// One step into a struct: which member contains `offset`, and where
    /// inside (an element of) that member it lies.
    pub fn subtype_info(
        &self,
        base_addr: usize,
        offset: usize,
        layout: &StructLayout,
    ) -> Result<(SubtypeInfo, usize), Status> {
        if offset >= layout.extent {
            return Err(Status::BadOffset);
        }
        let Some(idx) = layout.member_at(offset) else {
            trace!("Offset {offset} of {} is padding", layout.name);
            return Err(Status::BadAlignment);
        };
        let member = &layout.members[idx];
        let elem_size = self.db.type_size(member.type_id)?;
        if elem_size == 0 {
            return Err(Status::BadAlignment);
        }
        let internal = offset - member.offset;
        let index = internal / elem_size;
        let residual = internal % elem_size;
        if index >= member.count {
            // trailing padding inside the member
            return Err(Status::BadAlignment);
        }
        if residual != 0 && self.db.is_reserved(member.type_id) {
            return Err(Status::BadAlignment);
        }
        let sub = SubtypeInfo {
            base_addr: base_addr + member.offset + index * elem_size,
            type_id: member.type_id,
            count: member.count - index,
        };
        Ok((sub, residual))
    }

    /// Descend from an element boundary `elem` to byte `offset` inside it.
    pub fn resolve_within(&self, mut elem: PointerInfo, mut offset: usize) -> Result<PointerInfo, Status> {
        while offset != 0 {
            let canonical = self.db.strip_typedefs_and_qualifiers(elem.type_id)?;
            match self.db.get_type(canonical)? {
                TypeDescriptor::Struct { .. } => {
                    let layout = self.db.struct_layout(canonical)?;
                    let (sub, residual) = self.subtype_info(elem.base_addr, offset, layout)?;
                    elem = elem.narrowed(sub.base_addr, sub.type_id, sub.count);
                    offset = residual;
                }
                TypeDescriptor::Array { .. } => {
                    let (elem_type, len) = self.db.strip_arrays(canonical)?;
                    let elem_size = self.db.type_size(elem_type)?;
                    if elem_size == 0 {
                        return Err(Status::BadAlignment);
                    }
                    let index = offset / elem_size;
                    if index >= len {
                        return Err(Status::BadOffset);
                    }
                    elem = elem.narrowed(elem.base_addr + index * elem_size, elem_type, len - index);
                    offset %= elem_size;
                }
                TypeDescriptor::Union { name, .. } => {
                    warn!("Cannot resolve offset {offset} inside union {name}");
                    return Err(Status::UnsupportedType);
                }
                TypeDescriptor::Void
                | TypeDescriptor::Basic { .. }
                | TypeDescriptor::Enumeration { .. }
                | TypeDescriptor::Derived { .. }
                | TypeDescriptor::Subroutine => return Err(Status::BadAlignment),
            }
        }
        Ok(elem)
    }

    /// Replace (typedefs of) array types by their innermost element type,
    /// scaling the count accordingly.
    pub fn flatten_arrays(&self, info: PointerInfo) -> Result<PointerInfo, Status> {
        let canonical = self.db.strip_typedefs_and_qualifiers(info.type_id)?;
        if !matches!(self.db.get_type(canonical)?, TypeDescriptor::Array { .. }) {
            return Ok(info);
        }
        let (elem_type, len) = self.db.strip_arrays(canonical)?;
        Ok(info.narrowed(info.base_addr, elem_type, info.count.saturating_mul(len)))
    }

    /// The subobject at offset 0 of a struct, or the elements of an array.
    /// If the first member spans the whole struct, consecutive structs form
    /// one run of members and the outer count carries over.
    pub fn first_member(&self, info: PointerInfo) -> Result<PointerInfo, Status> {
        let canonical = self.db.strip_typedefs_and_qualifiers(info.type_id)?;
        match self.db.get_type(canonical)? {
            TypeDescriptor::Struct { .. } => {
                let layout = self.db.struct_layout(canonical)?;
                let member = layout
                    .members
                    .first()
                    .filter(|m| m.offset == 0)
                    .ok_or(Status::WrongKind)?;
                let count = if member.size == layout.extent {
                    info.count.saturating_mul(member.count)
                } else {
                    member.count
                };
                Ok(info.narrowed(info.base_addr, member.type_id, count))
            }
            TypeDescriptor::Array { .. } => self.flatten_arrays(info.narrowed(info.base_addr, canonical, info.count)),
            _ => Err(Status::WrongKind),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::db::{
        builtin,
        tests::{array_of, basic_member, plain_struct},
        DerivedKind, Inheritance, Member, StructFlags,
    };

    const BASE: usize = 0x10_0000;

    fn info(type_id: TypeId, count: usize) -> PointerInfo {
        PointerInfo {
            base_addr: BASE,
            alloc_id: 7,
            type_id,
            count,
            return_addr: 0,
        }
    }

    #[test]
    fn array_of_doubles() {
        let db = TypeDb::new();
        let r = Resolver::new(&db);
        let a = info(builtin::DOUBLE, 16);

        assert_eq!(r.resolve(a, BASE), Ok(a));
        let third = r.resolve(a, BASE + 3 * 8).unwrap();
        assert_eq!(third.type_id, builtin::DOUBLE);
        assert_eq!(third.count, 13);
        assert_eq!(third.base_addr, BASE + 24);
        assert_eq!(third.alloc_id, 7);
        assert_eq!(r.resolve(a, BASE + 3 * 8 + 3), Err(Status::BadAlignment));
        assert_eq!(r.resolve(a, BASE + 16 * 8), Err(Status::UnknownAddress));
        assert_eq!(r.resolve(a, BASE - 8), Err(Status::UnknownAddress));
    }

    #[test]
    fn containing_info_reports_offset() {
        let db = TypeDb::new();
        let r = Resolver::new(&db);
        let (elem, offset) = r.containing_info(info(builtin::INT32, 4), BASE + 6).unwrap();
        assert_eq!(elem.base_addr, BASE + 4);
        assert_eq!(elem.count, 3);
        assert_eq!(offset, 2);
    }

    fn nested_db() -> (TypeDb, TypeId, TypeId) {
        let mut db = TypeDb::new();
        // struct Inner { int32 a; double b[2]; }  size 24
        let arr = db.register_struct(array_of(builtin::DOUBLE, 8, &[2]));
        let inner = db.register_struct(plain_struct(
            "Inner",
            24,
            vec![
                basic_member("a", builtin::INT32, 0, 4),
                basic_member("b", arr, 8, 16),
            ],
        ));
        // struct Outer { int8 tag; Inner inner; }  size 32
        let outer = db.register_struct(plain_struct(
            "Outer",
            32,
            vec![
                basic_member("tag", builtin::INT8, 0, 1),
                basic_member("inner", inner, 8, 24),
            ],
        ));
        (db, inner, outer)
    }

    #[test]
    fn descends_into_nested_structs() {
        let (db, inner, outer) = nested_db();
        let r = Resolver::new(&db);
        let o = info(outer, 2);

        let second_outer = r.resolve(o, BASE + 32).unwrap();
        assert_eq!((second_outer.type_id, second_outer.count), (outer, 1));

        let inner_info = r.resolve(o, BASE + 8).unwrap();
        assert_eq!((inner_info.type_id, inner_info.count), (inner, 1));

        let b1 = r.resolve(o, BASE + 8 + 16).unwrap();
        assert_eq!((b1.base_addr, b1.type_id, b1.count), (BASE + 24, builtin::DOUBLE, 1));

        let b0_in_second = r.resolve(o, BASE + 32 + 8 + 8).unwrap();
        assert_eq!((b0_in_second.type_id, b0_in_second.count), (builtin::DOUBLE, 2));

        // padding after `tag` and after `a`
        assert_eq!(r.resolve(o, BASE + 1), Err(Status::BadAlignment));
        assert_eq!(r.resolve(o, BASE + 8 + 4), Err(Status::BadAlignment));
        // inside a scalar
        assert_eq!(r.resolve(o, BASE + 8 + 9), Err(Status::BadAlignment));
    }

    #[test]
    fn subtype_info_matches_layout() {
        let (db, inner, outer) = nested_db();
        let r = Resolver::new(&db);
        let layout = db.struct_layout(outer).unwrap();

        let (sub, residual) = r.subtype_info(BASE, 8 + 16, layout).unwrap();
        assert_eq!(sub, SubtypeInfo { base_addr: BASE + 8, type_id: inner, count: 1 });
        assert_eq!(residual, 16);

        assert_eq!(r.subtype_info(BASE, 32, layout), Err(Status::BadOffset));
        assert_eq!(r.subtype_info(BASE, 3, layout), Err(Status::BadAlignment));

        let inner_layout = db.struct_layout(inner).unwrap();
        let (sub, residual) = r.subtype_info(BASE, 16, inner_layout).unwrap();
        assert_eq!(sub, SubtypeInfo { base_addr: BASE + 16, type_id: builtin::DOUBLE, count: 1 });
        assert_eq!(residual, 0);
        assert_eq!(r.subtype_info(BASE, 2, inner_layout), Err(Status::BadAlignment));
    }

    #[test]
    fn unions_are_unsupported() {
        let mut db = TypeDb::new();
        let u = db.register_struct(TypeDescriptor::Union {
            name: "U".into(),
            size_bits: 64,
            members: vec![
                basic_member("i", builtin::INT64, 0, 8),
                basic_member("d", builtin::DOUBLE, 0, 8),
            ],
        });
        let r = Resolver::new(&db);
        assert_eq!(r.resolve(info(u, 2), BASE + 4), Err(Status::UnsupportedType));
        assert_eq!(r.resolve(info(u, 2), BASE + 8).map(|i| i.count), Ok(1));
    }

    #[test]
    fn typedefs_are_looked_through() {
        let (mut db, _, outer) = nested_db();
        let alias = db.register_struct(TypeDescriptor::Derived {
            kind: DerivedKind::Typedef,
            name: "outer_t".into(),
            base_type: outer,
            size_bits: 256,
        });
        let r = Resolver::new(&db);
        let tag = r.resolve(info(alias, 1), BASE + 8 + 8).unwrap();
        assert_eq!((tag.type_id, tag.count), (builtin::DOUBLE, 2));
    }

    #[test]
    fn inherited_members_are_found() {
        let mut db = TypeDb::new();
        let base = db.register_struct(plain_struct("Base", 8, vec![basic_member("x", builtin::INT64, 0, 8)]));
        let derived = db.register_struct(TypeDescriptor::Struct {
            name: "Derived".into(),
            size_bits: 16 * 8,
            members: vec![Member {
                name: "y".into(),
                type_id: builtin::FLOAT,
                offset_bits: 64,
                size_bits: 32,
            }],
            bases: vec![Inheritance { base, offset_bits: 0 }],
            flags: StructFlags::USER_DEFINED,
        });
        let r = Resolver::new(&db);
        let d = info(derived, 1);
        let y = r.resolve(d, BASE + 8).unwrap();
        assert_eq!(y.type_id, builtin::FLOAT);
        let first = r.first_member(d).unwrap();
        assert_eq!((first.type_id, first.count), (base, 1));
    }

    #[test]
    fn flatten_and_first_member() {
        let mut db = TypeDb::new();
        let matrix = db.register_struct(array_of(builtin::FLOAT, 4, &[3, 4]));
        let wrapper = db.register_struct(plain_struct("W", 8, vec![basic_member("d", builtin::DOUBLE, 0, 8)]));
        let r = Resolver::new(&db);

        let flat = r.flatten_arrays(info(matrix, 2)).unwrap();
        assert_eq!((flat.type_id, flat.count), (builtin::FLOAT, 24));
        assert_eq!(r.flatten_arrays(info(wrapper, 3)), Ok(info(wrapper, 3)));

        let member = r.first_member(info(wrapper, 3)).unwrap();
        assert_eq!((member.type_id, member.count), (builtin::DOUBLE, 3));
        assert_eq!(r.first_member(info(builtin::DOUBLE, 3)), Err(Status::WrongKind));
    }

    /// Natural-alignment layout of `members`, returning the struct size.
    fn lay_out(sizes: &[usize]) -> (Vec<usize>, usize) {
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut end = 0;
        for &size in sizes {
            let offset = crate::util::num::round_up(end, size);
            offsets.push(offset);
            end = offset + size;
        }
        let align = sizes.iter().copied().max().unwrap_or(1);
        (offsets, crate::util::num::round_up(end.max(1), align))
    }

    proptest! {
        #[test]
        fn every_byte_of_a_struct_resolves_like_a_field_walk(
            kinds in prop::collection::vec(
                prop::sample::select(vec![builtin::INT8, builtin::INT16, builtin::INT32, builtin::DOUBLE]),
                1..8,
            ),
            count in 1usize..4,
        ) {
            let sizes: Vec<usize> = kinds.iter().map(|k| builtin::size(*k).unwrap() as usize).collect();
            let (offsets, size) = lay_out(&sizes);
            let mut db = TypeDb::new();
            let members = kinds
                .iter()
                .zip(&offsets)
                .enumerate()
                .map(|(i, (kind, offset))| {
                    basic_member(&format!("m{i}"), *kind, *offset as u64, sizes[i] as u64)
                })
                .collect();
            let s = db.register_struct(plain_struct("P", size as u64, members));
            let r = Resolver::new(&db);
            let whole = info(s, count);

            for byte in 1..size {
                let expected = offsets
                    .iter()
                    .position(|o| *o == byte)
                    .map(|i| (BASE + byte, kinds[i], 1));
                let actual = r.resolve(whole, BASE + byte).map(|p| (p.base_addr, p.type_id, p.count));
                match expected {
                    Some(expected) => prop_assert_eq!(actual, Ok(expected)),
                    None => prop_assert_eq!(actual, Err(Status::BadAlignment)),
                }
            }
        }
    }
}
