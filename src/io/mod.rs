//! Writers for posterior output.

#[cfg(feature = "csv")]
pub mod csv;
