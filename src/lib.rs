//! Runtime type tracking for instrumented C and C++ programs.
//!
//! Instrumented code reports every allocation together with a static
//! allocation id; the runtime maps addresses back to the recorded type and
//! answers queries such as "what type lives at this address, and how many
//! elements are left". On top of that, [`verify`] checks message buffers
//! against MPI-style datatype descriptions.
//!
//! Two tracking backends exist: a map from base addresses to allocations
//! ([`tracker::MapTracker`], the default), and a region allocator that keeps
//! the allocation id in memory in front of each object
//! ([`region::RegionBackend`], selected by the `region-allocator` feature).

pub mod arch;
pub mod config;
pub mod db;
pub mod error;
pub mod externc;
pub mod os;
pub mod region;
pub mod resolve;
pub mod runtime;
pub mod tracker;
pub mod util;
pub mod verify;

pub use error::{Status, StatusCode};
pub use runtime::Runtime;
