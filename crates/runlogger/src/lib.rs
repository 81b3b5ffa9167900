#![doc = include_str!("../../../README.md")]
//!

//! This crate re-exports the run logger, sweep assignment and backends from
//! `runlogger-core` under one name.

pub use runlogger_core::*;
