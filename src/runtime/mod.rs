//! The runtime context: the loaded type database, the active tracking
//! backend and the configuration, behind one object every entry point goes
//! through.

mod guard;

use std::{io, sync::Arc};

use log::{error, info, log_enabled, warn, Level};
use thiserror::Error;

pub use guard::ScopeGuard;

use crate::{
    config::Config,
    db::{io::DbFileError, AllocId, AllocKind, SourceLocation, StructLayout, TypeDb, TypeId},
    error::Status,
    os::symbol::symbolize,
    resolve::{PointerInfo, Resolver, SubtypeInfo},
    tracker::{AllocState, CountersSnapshot, FreeState, Tracker},
    verify::{self, CheckError, CheckErrorKind, Datatype},
};

/// The backend selected at build time.
#[cfg(not(feature = "region-allocator"))]
pub type ActiveBackend = crate::tracker::MapTracker;
#[cfg(feature = "region-allocator")]
pub type ActiveBackend = crate::region::RegionBackend;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("loading the type database failed: {0}")]
    Db(#[from] DbFileError),
    #[error("setting up the region allocator failed: {0}")]
    Region(#[from] crate::region::RegionError),
}

/// Load the database named by `config`. A missing file is only an error
/// if it was asked for explicitly.
pub fn load_db(config: &Config) -> Result<TypeDb, DbFileError> {
    match TypeDb::load(&config.type_file) {
        Err(DbFileError::Io(err)) if err.kind() == io::ErrorKind::NotFound && !config.type_file_explicit => {
            warn!(
                "No type file at {}, only builtin types are known",
                config.type_file.display()
            );
            Ok(TypeDb::new())
        }
        result => result,
    }
}

pub struct Runtime<B: Tracker = ActiveBackend> {
    db: Arc<TypeDb>,
    backend: B,
    config: Config,
}

impl Runtime<ActiveBackend> {
    /// Load the database and set up the build's backend.
    pub fn from_config(config: Config) -> Result<Self, RuntimeError> {
        let db = Arc::new(load_db(&config)?);
        let backend = Self::create_backend(Arc::clone(&db))?;
        Ok(Self::with_backend(db, backend, config))
    }

    #[cfg(not(feature = "region-allocator"))]
    fn create_backend(db: Arc<TypeDb>) -> Result<ActiveBackend, RuntimeError> {
        Ok(crate::tracker::MapTracker::new(db))
    }

    #[cfg(feature = "region-allocator")]
    fn create_backend(db: Arc<TypeDb>) -> Result<ActiveBackend, RuntimeError> {
        Ok(crate::region::RegionBackend::new(db, crate::region::RegionConfig::default())?)
    }
}

impl<B: Tracker> Runtime<B> {
    pub fn with_backend(db: Arc<TypeDb>, backend: B, config: Config) -> Self {
        Self { db, backend, config }
    }

    pub fn db(&self) -> &TypeDb {
        &self.db
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.backend.counters()
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.db)
    }

    pub fn on_alloc(&self, addr: usize, alloc_id: AllocId, count: usize, kind: AllocKind, return_addr: usize) -> AllocState {
        let Some(_guard) = ScopeGuard::enter() else {
            return AllocState::ADDR_SKIPPED;
        };
        self.backend.on_alloc(addr, alloc_id, count, kind, return_addr)
    }

    pub fn on_free(&self, addr: usize, return_addr: usize) -> FreeState {
        let Some(_guard) = ScopeGuard::enter() else {
            return FreeState::ADDR_SKIPPED;
        };
        self.backend.on_free(addr, return_addr)
    }

    pub fn on_scope_exit(&self, n: usize) {
        if let Some(_guard) = ScopeGuard::enter() {
            self.backend.on_scope_exit(n)
        }
    }

    /// The nearest allocation at or below `addr`, unresolved and without an
    /// extent check. [`Runtime::containing_info`] applies the bounds.
    pub fn allocation_of(&self, addr: usize) -> Result<PointerInfo, Status> {
        if addr == 0 {
            return Err(Status::UnknownAddress);
        }
        self.backend.find(addr).ok_or(Status::UnknownAddress)
    }

    /// Type and remaining count of the object at `addr`.
    pub fn resolve(&self, addr: usize) -> Result<PointerInfo, Status> {
        let info = self.allocation_of(addr)?;
        self.resolver().resolve(info, addr)
    }

    /// The element of its allocation that `addr` falls into, and the offset
    /// of `addr` inside that element.
    pub fn containing_info(&self, addr: usize) -> Result<(PointerInfo, usize), Status> {
        let info = self.allocation_of(addr)?;
        self.resolver().containing_info(info, addr)
    }

    pub fn subtype_info(&self, base_addr: usize, offset: usize, layout: &StructLayout) -> Result<(SubtypeInfo, usize), Status> {
        self.resolver().subtype_info(base_addr, offset, layout)
    }

    pub fn struct_layout(&self, type_id: TypeId) -> Result<&StructLayout, Status> {
        self.db.struct_layout(type_id)
    }

    /// Where the allocation containing `addr` was made, if recorded.
    pub fn source_location(&self, addr: usize) -> Result<Option<&SourceLocation>, Status> {
        let (info, _) = self.containing_info(addr)?;
        Ok(self.db.get_allocation(info.alloc_id)?.location.as_ref())
    }

    /// Check that `count` elements of `datatype` fit the buffer at `addr`.
    pub fn check(&self, addr: usize, count: usize, datatype: &Datatype) -> Result<(), CheckError> {
        let result = self
            .resolve(addr)
            .map_err(CheckErrorKind::from)
            .and_then(|info| verify::check_buffer(&self.resolver(), info, datatype, count));
        result.map_err(|kind| CheckError::new(kind, self.config.stacktrace))
    }

    /// [`Runtime::check`], logging the outcome for the call `name` made at
    /// `called_from`.
    pub fn check_and_report(
        &self,
        name: &str,
        called_from: usize,
        addr: usize,
        count: usize,
        datatype: &Datatype,
    ) -> Result<(), CheckError> {
        let _guard = ScopeGuard::enter();
        let result = self.check(addr, count, datatype);
        match &result {
            Ok(()) if log_enabled!(Level::Info) => info!(
                "{}{name}: successfully checked buffer {addr:#x} against {count} element{} of MPI type \"{}\"",
                self.call_site(Level::Info, called_from),
                if count == 1 { "" } else { "s" },
                datatype.name()
            ),
            Ok(()) => {}
            Err(err) => {
                let site = if err.backtrace.is_some() {
                    String::new()
                } else {
                    self.call_site(Level::Error, called_from)
                };
                error!(
                    "{site}{name}: {}while checking buffer {addr:#x} against {count} element{} of MPI type \"{}\": {err}",
                    err.category(),
                    if count == 1 { "" } else { "s" },
                    datatype.name()
                );
                if let Some(backtrace) = &err.backtrace {
                    error!("{backtrace}");
                }
            }
        }
        result
    }

    /// Prefix naming the call site, resolved to a symbol if the
    /// configuration asks for it at `level`.
    fn call_site(&self, level: Level, called_from: usize) -> String {
        if self.config.source_location.applies_to(level) {
            if let Some(symbol) = symbolize(called_from) {
                return format!("{symbol} [{called_from:#x}]: ");
            }
        }
        format!("at {called_from:#x}: ")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::{
        config::SourceLocationMode,
        db::{
            builtin,
            tests::{basic_member, plain_struct},
            AllocationDescriptor,
        },
        tracker::MapTracker,
        verify::{NamedType, TypeError},
    };

    struct Setup {
        runtime: Runtime<MapTracker>,
        doubles: AllocId,
        pairs: AllocId,
        pair: TypeId,
    }

    fn setup(config: Config) -> Setup {
        let mut db = TypeDb::new();
        let pair = db.register_struct(plain_struct(
            "Pair",
            16,
            vec![
                basic_member("i", builtin::INT32, 0, 4),
                basic_member("d", builtin::DOUBLE, 8, 8),
            ],
        ));
        let doubles = db.register_allocation(
            AllocationDescriptor::new(builtin::DOUBLE, AllocKind::Stack)
                .with_static_count(16)
                .with_location(SourceLocation {
                    file: "solver.c".into(),
                    function: "solve".into(),
                    line: 42,
                }),
        );
        let pairs = db.register_allocation(AllocationDescriptor::new(pair, AllocKind::Heap));
        let db = Arc::new(db);
        Setup {
            runtime: Runtime::with_backend(Arc::clone(&db), MapTracker::new(db), config),
            doubles,
            pairs,
            pair,
        }
    }

    #[test]
    fn stack_array_of_doubles() {
        let Setup { runtime, doubles, .. } = setup(Config::default());
        let p = 0x7000_0000;
        assert_eq!(runtime.on_alloc(p, doubles, 16, AllocKind::Stack, 0), AllocState::OK);

        let third = runtime.resolve(p + 3 * 8).unwrap();
        assert_eq!((third.type_id, third.count), (builtin::DOUBLE, 13));
        assert_eq!(runtime.resolve(p + 3 * 8 + 3), Err(Status::BadAlignment));
        assert_eq!(runtime.resolve(p + 16 * 8), Err(Status::UnknownAddress));
        assert_eq!(runtime.resolve(0), Err(Status::UnknownAddress));

        let (elem, offset) = runtime.containing_info(p + 3 * 8 + 3).unwrap();
        assert_eq!((elem.base_addr, offset), (p + 24, 3));

        runtime.on_scope_exit(1);
        assert_eq!(runtime.resolve(p), Err(Status::UnknownAddress));
    }

    #[test]
    fn free_then_resolve_fails() {
        let Setup { runtime, pairs, pair, .. } = setup(Config::default());
        let p = 0x1000;
        runtime.on_alloc(p, pairs, 2, AllocKind::Heap, 0);
        assert_eq!(runtime.resolve(p + 16).map(|i| (i.type_id, i.count)), Ok((pair, 1)));
        assert_eq!(runtime.resolve(p + 8).map(|i| i.type_id), Ok(builtin::DOUBLE));
        assert_eq!(runtime.on_free(p, 0), FreeState::OK);
        assert_eq!(runtime.resolve(p), Err(Status::UnknownAddress));
        assert!(runtime.on_free(p, 0).contains(FreeState::UNREG_ADDR));
    }

    #[test]
    fn events_inside_the_runtime_are_skipped() {
        let Setup { runtime, doubles, .. } = setup(Config::default());
        let guard = ScopeGuard::enter();
        assert_eq!(runtime.on_alloc(0x1000, doubles, 1, AllocKind::Stack, 0), AllocState::ADDR_SKIPPED);
        drop(guard);
        assert_eq!(runtime.counters().stack_allocs, 0);
    }

    #[test]
    fn checks_resolve_first() {
        let Setup {
            runtime, doubles, pairs, ..
        } = setup(Config::builder().stacktrace(true).build());
        let p = 0x2000;
        runtime.on_alloc(p, doubles, 16, AllocKind::Stack, 0);
        let double = Datatype::named(NamedType::Double);
        assert!(runtime.check(p, 16, &double).is_ok());
        assert!(runtime.check(p + 8, 15, &double).is_ok());

        let err = runtime.check(p + 8, 16, &double).unwrap_err();
        assert_eq!(
            err.kind,
            CheckErrorKind::Type(TypeError::InsufficientBufferSize {
                actual: 15,
                required: 16
            })
        );
        assert!(err.backtrace.is_some());

        let err = runtime.check(0x10, 1, &double).unwrap_err();
        assert!(!err.is_type_error());

        let q = 0x9000;
        runtime.on_alloc(q, pairs, 1, AllocKind::Heap, 0);
        let pair_type = Datatype::structure(&[1, 1], &[0, 8], vec![NamedType::Int.into(), double]);
        assert!(runtime.check_and_report("MPI_Send", 0, q, 1, &pair_type).is_ok());
    }

    #[test]
    fn source_locations_of_allocations() {
        let Setup { runtime, doubles, .. } = setup(Config::builder().source_location(SourceLocationMode::All).build());
        let p = 0x3000;
        runtime.on_alloc(p, doubles, 16, AllocKind::Stack, 0);
        let location = runtime.source_location(p + 8).unwrap().unwrap();
        assert_eq!((location.function.as_str(), location.line), ("solve", 42));
        // one past the 16 doubles
        assert_eq!(runtime.source_location(p + 16 * 8), Err(Status::UnknownAddress));
        assert_eq!(runtime.source_location(0x5555_0000), Err(Status::UnknownAddress));
    }

    #[test]
    fn call_sites_name_code_not_data() {
        let Setup { runtime, doubles, .. } = setup(Config::builder().source_location(SourceLocationMode::All).build());
        let p = 0x3000;
        runtime.on_alloc(p, doubles, 16, AllocKind::Stack, 0);
        assert_eq!(runtime.call_site(Level::Info, p), format!("at {p:#x}: "));
        assert_eq!(runtime.call_site(Level::Info, 0x10), "at 0x10: ");

        let code = libc::free as usize;
        let site = runtime.call_site(Level::Info, code);
        assert!(site.contains("free+0x0 in ") && site.ends_with(&format!(" [{code:#x}]: ")), "{site}");

        let quiet = setup(Config::builder().source_location(SourceLocationMode::Error).build()).runtime;
        assert_eq!(quiet.call_site(Level::Info, code), format!("at {code:#x}: "));
    }

    #[test]
    fn missing_default_type_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("types.json");

        let config = Config {
            type_file: missing.clone(),
            ..Config::default()
        };
        assert_eq!(load_db(&config).map(|db| db.user_types().count()).ok(), Some(0));

        let explicit = Config::builder().type_file(&missing).build();
        assert!(matches!(load_db(&explicit), Err(DbFileError::Io(_))));

        let mut file = std::fs::File::create(&missing).unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(load_db(&config), Err(DbFileError::Json(_))));
    }
}
