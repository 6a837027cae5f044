//! Persisting the type database as JSON.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{AllocId, AllocationDescriptor, TypeDb, TypeDescriptor, TypeId};

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DbFileError {
    #[error("could not access type file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed type file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("inconsistent type file: {0}")]
    Invalid(String),
}

/// On-disk shape of a [`TypeDb`]. Builtins are implied and never stored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DbFile {
    #[serde(default)]
    types: BTreeMap<TypeId, TypeDescriptor>,
    #[serde(default)]
    allocations: BTreeMap<AllocId, AllocationDescriptor>,
}

impl TypeDb {
    pub fn from_json_reader<R: io::Read>(reader: R) -> Result<Self, DbFileError> {
        let file: DbFile = serde_json::from_reader(reader)?;
        let mut db = TypeDb::new();
        for (id, descriptor) in file.types {
            db.register_type_at(id, descriptor)
                .map_err(|_| DbFileError::Invalid(format!("type id {id} is reserved or duplicated")))?;
        }
        for (id, descriptor) in file.allocations {
            if !db.is_valid(descriptor.type_id) && !db.is_unknown(descriptor.type_id) {
                return Err(DbFileError::Invalid(format!(
                    "allocation {id} refers to unknown type {}",
                    descriptor.type_id
                )));
            }
            db.register_allocation_at(id, descriptor)
                .map_err(|_| DbFileError::Invalid(format!("allocation id {id} is duplicated")))?;
        }
        Ok(db)
    }

    pub fn to_json_writer<W: io::Write>(&self, writer: W) -> Result<(), DbFileError> {
        let file = DbFile {
            types: self.user_types().map(|(id, t)| (id, t.clone())).collect(),
            allocations: self.allocations().map(|(id, a)| (id, a.clone())).collect(),
        };
        serde_json::to_writer_pretty(writer, &file)?;
        Ok(())
    }

    /// Load a database written by [`TypeDb::store`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DbFileError> {
        let path = path.as_ref();
        debug!("Loading type database from {}", path.display());
        let db = Self::from_json_reader(BufReader::new(File::open(path)?))?;
        info!(
            "Loaded {} types and {} allocation sites from {}",
            db.user_types().count(),
            db.allocations().count(),
            path.display()
        );
        Ok(db)
    }

    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), DbFileError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.to_json_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::{
        builtin,
        tests::{basic_member, plain_struct},
        AllocKind, SourceLocation,
    };

    #[test]
    fn store_then_load_preserves_contents() {
        let mut db = TypeDb::new();
        let s = db.register_struct(plain_struct(
            "Pair",
            16,
            vec![
                basic_member("a", builtin::INT32, 0, 4),
                basic_member("b", builtin::DOUBLE, 8, 8),
            ],
        ));
        db.register_allocation(
            AllocationDescriptor::new(s, AllocKind::Stack)
                .with_static_count(4)
                .with_location(SourceLocation {
                    file: "pair.c".into(),
                    function: "main".into(),
                    line: 12,
                }),
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("types.json");
        db.store(&path).unwrap();
        let loaded = TypeDb::load(&path).unwrap();

        assert_eq!(loaded.get_type(s), db.get_type(s));
        assert_eq!(loaded.get_allocation(0), db.get_allocation(0));
        assert_eq!(loaded.type_name(s), "Pair");
        assert!(loaded.is_valid(builtin::DOUBLE));
    }

    #[test]
    fn derived_types_load_from_hand_written_json() {
        let json = r#"{
            "types": {
                "256": { "type": "Derived", "kind": "Typedef", "name": "real", "base_type": 6, "size_bits": 64 },
                "257": { "type": "Derived", "kind": "Const", "base_type": 256, "size_bits": 64 }
            },
            "allocations": { "0": { "type_id": 257, "kind": "Global", "static_count": 3 } }
        }"#;
        let db = TypeDb::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(db.strip_typedefs_and_qualifiers(257), Ok(builtin::DOUBLE));
        assert_eq!(db.type_name(256), "real");
        assert_eq!(db.get_allocation(0).map(|a| a.static_count), Ok(Some(3)));

        let mut out = Vec::new();
        db.to_json_writer(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(r#""type": "Derived""#));
        assert!(text.contains(r#""kind": "Typedef""#));
    }

    #[test]
    fn reserved_ids_are_rejected() {
        let json = r#"{ "types": { "6": { "type": "Void" } } }"#;
        let err = TypeDb::from_json_reader(json.as_bytes()).unwrap_err();
        assert!(matches!(err, DbFileError::Invalid(_)));
    }

    #[test]
    fn dangling_allocation_type_is_rejected() {
        let json = r#"{ "allocations": { "0": { "type_id": 999, "kind": "Heap" } } }"#;
        let err = TypeDb::from_json_reader(json.as_bytes()).unwrap_err();
        assert!(matches!(err, DbFileError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TypeDb::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, DbFileError::Io(_)));
    }
}
