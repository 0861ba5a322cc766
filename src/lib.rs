#![forbid(unsafe_code)]

//! Public entry point for the videohub crate.
//!
//! The backend binary is a thin axum layer; everything that touches the
//! database or the storage root lives here so it can be exercised directly
//! from tests.

pub mod assets;
pub mod categories;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metadata;
pub mod security;
pub mod storage;
pub mod thumbnail;
