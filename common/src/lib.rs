//! Shared building blocks for the query retry workspace.
//!
//! Configuration, the HTTP-facing error type, data models and the
//! response envelope live here so that every service renders them the same way.

pub mod config;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod response;
