//! The region allocator backend: allocation ids are stored in memory next
//! to every allocation, so resolving a pointer is a mask and a load instead
//! of a map lookup.

pub mod backend;
pub mod config;
pub mod heap;
pub mod stack;

use std::io;

use thiserror::Error;

pub use backend::RegionBackend;
pub use config::{HeapConfig, RegionConfig, StackConfig};
pub use heap::HeapRegions;
pub use stack::{StackArena, StackSlot};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegionError {
    #[error("free of {addr:#x}, which was never allocated")]
    InvalidFree { addr: usize },
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },
    #[error("stack of {size:#x} bytes does not fit the main stack slot")]
    StackTooLarge { size: usize },
    #[error("stack range {begin:#x}..{end:#x} is empty")]
    EmptyStack { begin: usize, end: usize },
    #[error("all instrumented thread stacks are in use")]
    StacksExhausted,
    #[error("the current thread does not own an instrumented stack")]
    UnknownThread,
    #[error("invalid region configuration: {0}")]
    Config(String),
    #[error("mapping region memory failed: {0}")]
    Io(#[from] io::Error),
}
