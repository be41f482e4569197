//! Low-level utilities shared by every subsystem.

pub mod fs;
pub mod idmap;
pub mod path;
pub mod proc;
