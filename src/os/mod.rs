pub mod mem;
pub mod symbol;
