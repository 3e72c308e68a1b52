pub mod summary;
pub mod trace;
