//! # Index Release Core
//!
//! Runtime-agnostic building blocks shared by the Index Release backend:
//! environment and history models, the [`engine::SearchEngine`] and
//! [`catalog::CatalogSource`] traits, and in-memory implementations of both
//! used by tests and local dry runs.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies.

pub mod catalog;
pub mod engine;
pub mod models;
