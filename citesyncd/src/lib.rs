pub mod config;
pub mod entities;
pub mod runtime;
pub mod sync;
