use std::ffi::CString;

use super::types::TypeId;

/// One first-level subobject of a struct: a non-empty base class or a
/// direct member. Array members are reported by their element type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutMember {
    pub name: String,
    /// Byte offset from the start of the struct
    pub offset: usize,
    /// Element type, i.e. arrays are stripped
    pub type_id: TypeId,
    /// Number of `type_id` elements (the flattened array length, or 1)
    pub count: usize,
    /// Size in bytes of the whole subobject
    pub size: usize,
    pub is_base: bool,
}

impl LayoutMember {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.offset <= offset && offset < self.end()
    }
}

/// Flattened view of a struct type, sorted by ascending offset. Also keeps
/// the contiguous arrays handed out through the C interface.
#[derive(Debug)]
pub struct StructLayout {
    pub type_id: TypeId,
    pub name: String,
    /// Size of the struct in bytes
    pub extent: usize,
    pub members: Vec<LayoutMember>,
    c_name: CString,
    offsets: Box<[usize]>,
    member_types: Box<[i32]>,
    counts: Box<[usize]>,
}

impl StructLayout {
    pub fn new(type_id: TypeId, name: String, extent: usize, mut members: Vec<LayoutMember>) -> Self {
        members.sort_by_key(|m| m.offset);
        let c_name = CString::new(name.replace('\0', "")).unwrap_or_default();
        let offsets = members.iter().map(|m| m.offset).collect();
        let member_types = members.iter().map(|m| m.type_id as i32).collect();
        let counts = members.iter().map(|m| m.count).collect();
        Self {
            type_id,
            name,
            extent,
            members,
            c_name,
            offsets,
            member_types,
            counts,
        }
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Index of the member covering byte `offset`, or `None` if `offset`
    /// lies in padding or past the end.
    pub fn member_at(&self, offset: usize) -> Option<usize> {
        // last member starting at or before `offset`
        let idx = self.members.partition_point(|m| m.offset <= offset);
        let idx = idx.checked_sub(1)?;
        // empty bases share their offset with the next subobject
        self.members[..=idx].iter().rposition(|m| m.contains(offset))
    }

    pub fn c_name(&self) -> &CString {
        &self.c_name
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn member_types(&self) -> &[i32] {
        &self.member_types
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, offset: usize, type_id: TypeId, count: usize, size: usize) -> LayoutMember {
        LayoutMember {
            name: name.to_owned(),
            offset,
            type_id,
            count,
            size,
            is_base: false,
        }
    }

    #[test]
    fn member_at_skips_padding() {
        let layout = StructLayout::new(
            300,
            "S".into(),
            24,
            vec![member("b", 8, 6, 2, 16), member("a", 0, 2, 1, 4)],
        );
        assert_eq!(layout.offsets(), &[0, 8]);
        assert_eq!(layout.member_types(), &[2, 6]);
        assert_eq!(layout.counts(), &[1, 2]);
        assert_eq!(layout.member_at(0), Some(0));
        assert_eq!(layout.member_at(3), Some(0));
        assert_eq!(layout.member_at(4), None);
        assert_eq!(layout.member_at(7), None);
        assert_eq!(layout.member_at(8), Some(1));
        assert_eq!(layout.member_at(23), Some(1));
        assert_eq!(layout.member_at(24), None);
        assert_eq!(layout.c_name().to_str().unwrap(), "S");
    }
}
