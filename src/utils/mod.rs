//! Shared utilities for the ledger engines and the worker binary.

pub mod bootstrap;
pub mod retry;
