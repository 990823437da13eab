//! On-disk persistence of built indices.

pub mod index_store;
