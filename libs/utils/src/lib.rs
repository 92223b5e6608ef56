//! `utils` is a home for small pieces of code that are shared between
//! the crates in this repository and are not specific to any of them.

pub mod logging;
pub mod lsn;
pub mod time;
