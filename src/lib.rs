//! # workitem-rs
//!
//! Orchestration for DICOM Unified Procedure Step workitems.
//!
//! A workitem lives in two stores: a metadata index (identity, lifecycle
//! state, queryable tag values) and a blob store holding the full document.
//! The [`engine`] keeps them consistent across add, update, cancel and
//! state changes, compensating partial writes. The index speaks several
//! schema versions; [`versioning`] picks the operations matching the
//! deployed one.

pub mod codec;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod query_tags;
pub mod response;
pub mod store;
pub mod telemetry;
pub mod versioning;
