//! Checking message buffers against wire datatypes.
//!
//! A datatype is checked against the buffer type by walking its combiner
//! tree. Every step yields [`Multipliers`]: how many buffer elements
//! (`buffer`) correspond to how many elements of the datatype (`type`).
//! `MPI_Type_contiguous(4, MPI_DOUBLE)` against a `double` buffer gives
//! `{ type: 4, buffer: 1 }`; `MPI_BYTE` against a `double` buffer gives
//! `{ type: 1, buffer: 8 }`.

mod datatype;
mod error;

use log::trace;

pub use datatype::{Combiner, Datatype, NamedType};
pub use error::{CheckError, CheckErrorKind, InternalError, StructSubtypeMismatch, TypeError};

use crate::{
    db::{builtin, TypeDescriptor, TypeId},
    resolve::{PointerInfo, Resolver},
};

/// Wrapper structs are unwrapped at most this deep.
const MAX_UNWRAP_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Multipliers {
    pub r#type: usize,
    pub buffer: usize,
}

impl Multipliers {
    const ONE: Multipliers = Multipliers { r#type: 1, buffer: 1 };

    fn times(self, factor: usize) -> Self {
        Self {
            r#type: self.r#type.saturating_mul(factor),
            ..self
        }
    }
}

type CheckResult<T> = Result<T, CheckErrorKind>;

/// Check that the buffer described by `info` holds `count` elements of
/// `datatype`. On a type mismatch, the first member of a (nested) wrapper
/// struct is tried in place of the buffer.
pub fn check_buffer(resolver: &Resolver<'_>, info: PointerInfo, datatype: &Datatype, count: usize) -> CheckResult<()> {
    let db = resolver.db();
    let stripped = resolver.flatten_arrays(info)?;
    let primary = match check_type_and_count(resolver, stripped, datatype, count) {
        Err(CheckErrorKind::Type(err)) => err,
        other => return other,
    };

    let mut subtypes = Vec::new();
    let mut outer = stripped;
    let mut next = resolver.first_member(stripped);
    while let Ok(member) = next {
        if subtypes.len() >= MAX_UNWRAP_DEPTH {
            break;
        }
        let member = member.narrowed(
            member.base_addr,
            db.strip_typedefs_and_qualifiers(member.type_id)?,
            member.count,
        );
        trace!(
            "Retrying with the first member [{} x {}] of \"{}\"",
            member.count,
            db.type_name(member.type_id),
            db.type_name(outer.type_id)
        );
        match check_type_and_count(resolver, member, datatype, count) {
            Err(CheckErrorKind::Type(err)) => subtypes.push(StructSubtypeMismatch {
                outer,
                outer_name: db.type_name(outer.type_id),
                member,
                member_name: db.type_name(member.type_id),
                error: Box::new(err),
            }),
            other => return other,
        }
        outer = member;
        next = resolver.flatten_arrays(member).and_then(|m| resolver.first_member(m));
    }

    if subtypes.is_empty() {
        return Err(primary.into());
    }
    Err(TypeError::StructSubtypeErrors {
        primary: Box::new(primary),
        subtypes,
    }
    .into())
}

/// Check the type, then that `count` elements of `datatype` fit.
pub fn check_type_and_count(
    resolver: &Resolver<'_>,
    info: PointerInfo,
    datatype: &Datatype,
    count: usize,
) -> CheckResult<()> {
    let m = check_type(resolver, info, datatype)?;
    let required = count.saturating_mul(m.r#type);
    let actual = resolver.flatten_arrays(info)?.count.saturating_mul(m.buffer);
    if required > actual {
        return Err(TypeError::InsufficientBufferSize { actual, required }.into());
    }
    Ok(())
}

/// Match the type of the buffer against `datatype`, ignoring counts.
pub fn check_type(resolver: &Resolver<'_>, info: PointerInfo, datatype: &Datatype) -> CheckResult<Multipliers> {
    match &datatype.combiner {
        Combiner::Named(named) => check_named(resolver, info, *named),
        Combiner::Dup => check_type(resolver, info, type_arg(datatype, 0)?),
        Combiner::Contiguous => {
            let count = non_negative(int_arg(datatype, 0)?, "negative counts for MPI_Type_contiguous")?;
            Ok(check_type(resolver, info, type_arg(datatype, 0)?)?.times(count))
        }
        Combiner::Vector => check_vector(resolver, info, datatype),
        Combiner::IndexedBlock => check_indexed_block(resolver, info, datatype),
        Combiner::Struct => check_struct(resolver, info, datatype),
        Combiner::Subarray => {
            let ndims = non_negative(int_arg(datatype, 0)?, "negative dimensions for MPI_Type_create_subarray")?;
            let mut elements = 1usize;
            for i in 0..ndims {
                let size = non_negative(int_arg(datatype, 1 + i)?, "negative sizes for MPI_Type_create_subarray")?;
                elements = elements.saturating_mul(size);
            }
            Ok(check_type(resolver, info, type_arg(datatype, 0)?)?.times(elements))
        }
        Combiner::Other(name) => Err(InternalError::UnsupportedCombiner(name.clone()).into()),
    }
}

fn int_arg(datatype: &Datatype, i: usize) -> CheckResult<i64> {
    datatype.integer_args.get(i).copied().ok_or_else(|| {
        InternalError::InvalidArgument(format!("{} is missing integer argument {i}", datatype.name())).into()
    })
}

fn type_arg(datatype: &Datatype, i: usize) -> CheckResult<&Datatype> {
    datatype.type_args.get(i).ok_or_else(|| {
        InternalError::InvalidArgument(format!("{} is missing type argument {i}", datatype.name())).into()
    })
}

fn non_negative(value: i64, what: &str) -> CheckResult<usize> {
    usize::try_from(value)
        .map_err(|_| InternalError::UnsupportedCombinerArgs(format!("{what} are currently not supported")).into())
}

fn check_named(resolver: &Resolver<'_>, info: PointerInfo, named: NamedType) -> CheckResult<Multipliers> {
    let db = resolver.db();
    let flat = resolver.flatten_arrays(info)?;
    let Some(expected) = named.builtin() else {
        // raw bytes: one element of the buffer is `type_size` bytes
        return Ok(Multipliers {
            r#type: 1,
            buffer: db.type_size(flat.type_id)?,
        });
    };
    match db.canonical_builtin(flat.type_id) {
        Some(found) if same_builtin(found, expected) => Ok(Multipliers::ONE),
        _ => Err(TypeError::BuiltinTypeMismatch {
            buffer: info,
            type_name: db.type_name(info.type_id),
            mpi_type: named.name().to_owned(),
        }
        .into()),
    }
}

/// Builtin ids name the same wire type; all 16 byte float formats count
/// as one.
fn same_builtin(a: TypeId, b: TypeId) -> bool {
    let wide_float = |id| matches!(id, builtin::FLOAT128 | builtin::X86_FLOAT80 | builtin::PPC_FLOAT128);
    a == b || (wide_float(a) && wide_float(b))
}

fn check_vector(resolver: &Resolver<'_>, info: PointerInfo, datatype: &Datatype) -> CheckResult<Multipliers> {
    let count = int_arg(datatype, 0)?;
    let blocklength = int_arg(datatype, 1)?;
    let stride = int_arg(datatype, 2)?;
    if stride < 0 {
        return Err(InternalError::UnsupportedCombinerArgs(
            "negative strides for MPI_Type_vector are currently not supported".into(),
        )
        .into());
    }
    let span = count.saturating_sub(1).saturating_mul(stride).saturating_add(blocklength);
    let m = check_type(resolver, info, type_arg(datatype, 0)?)?;
    Ok(m.times(usize::try_from(span).unwrap_or(0)))
}

fn check_indexed_block(resolver: &Resolver<'_>, info: PointerInfo, datatype: &Datatype) -> CheckResult<Multipliers> {
    let count = non_negative(int_arg(datatype, 0)?, "negative counts for MPI_Type_create_indexed_block")?;
    let blocklength = int_arg(datatype, 1)?;
    let displacements = datatype.integer_args.get(2..2 + count).ok_or_else(|| {
        CheckErrorKind::from(InternalError::InvalidArgument(format!(
            "{} is missing displacements",
            datatype.name()
        )))
    })?;
    if displacements.iter().any(|d| *d < 0) {
        return Err(InternalError::UnsupportedCombinerArgs(
            "negative displacements for MPI_Type_create_indexed_block are currently not supported".into(),
        )
        .into());
    }
    let span = displacements.iter().max().map_or(0, |max| max.saturating_add(blocklength));
    let m = check_type(resolver, info, type_arg(datatype, 0)?)?;
    Ok(m.times(usize::try_from(span).unwrap_or(0)))
}

/// A member of a struct, with bases flattened into their members.
struct FlatMember {
    name: String,
    type_id: TypeId,
    offset: usize,
}

fn collect_members(resolver: &Resolver<'_>, type_id: TypeId, inherited: usize, out: &mut Vec<FlatMember>) -> CheckResult<()> {
    let db = resolver.db();
    let canonical = db.strip_typedefs_and_qualifiers(type_id)?;
    let TypeDescriptor::Struct { members, bases, .. } = db.get_type(canonical)? else {
        return Ok(());
    };
    for base in bases {
        collect_members(resolver, base.base, inherited + (base.offset_bits / 8) as usize, out)?;
    }
    out.extend(members.iter().map(|member| FlatMember {
        name: member.name.clone(),
        type_id: member.type_id,
        offset: inherited + (member.offset_bits / 8) as usize,
    }));
    Ok(())
}

fn check_struct(resolver: &Resolver<'_>, info: PointerInfo, datatype: &Datatype) -> CheckResult<Multipliers> {
    let db = resolver.db();
    let count = non_negative(int_arg(datatype, 0)?, "negative counts for MPI_Type_struct")?;
    let canonical = db.strip_typedefs_and_qualifiers(info.type_id)?;
    if !db.get_type(canonical)?.is_struct() {
        return Err(TypeError::BufferNotOfStructType {
            buffer: info,
            type_name: db.type_name(info.type_id),
        }
        .into());
    }

    let mut members = Vec::new();
    collect_members(resolver, canonical, 0, &mut members)?;
    if members.len() != count {
        return Err(TypeError::MemberCountMismatch {
            buffer: info,
            type_name: db.type_name(info.type_id),
            struct_members: members.len(),
            mpi_members: count,
        }
        .into());
    }

    for (i, member) in members.iter().enumerate() {
        let displacement = *datatype.address_args.get(i).ok_or_else(|| {
            CheckErrorKind::from(InternalError::InvalidArgument(format!(
                "{} is missing displacement {i}",
                datatype.name()
            )))
        })?;
        if i64::try_from(member.offset).ok() != Some(displacement) {
            return Err(TypeError::MemberOffsetMismatch {
                buffer: info,
                type_name: db.type_name(info.type_id),
                member: member.name.clone(),
                struct_offset: member.offset,
                mpi_offset: displacement,
            }
            .into());
        }
    }

    for (i, member) in members.iter().enumerate() {
        let member_info = info.narrowed(info.base_addr + member.offset, member.type_id, 1);
        let m = match check_type(resolver, member_info, type_arg(datatype, i)?) {
            Ok(m) => m,
            Err(CheckErrorKind::Type(err)) => {
                return Err(TypeError::MemberTypeMismatch {
                    buffer: info,
                    member: member.name.clone(),
                    error: Box::new(err),
                }
                .into())
            }
            Err(internal) => return Err(internal),
        };

        let blocklength = non_negative(int_arg(datatype, 1 + i)?, "negative blocklengths for MPI_Type_struct")?;
        let mpi_count = blocklength.saturating_mul(m.r#type);
        let buffer_count = resolver.flatten_arrays(member_info)?.count.saturating_mul(m.buffer);
        if mpi_count != buffer_count {
            return Err(TypeError::MemberElementCountMismatch {
                buffer: info,
                member: member.name.clone(),
                member_type: db.type_name(member.type_id),
                buffer_count,
                mpi_count,
            }
            .into());
        }
    }

    Ok(Multipliers::ONE)
}
