//! Rewards Ledger
//!
//! Mining-accrual and rewards ledger: time-proportional mining sessions,
//! provider webhook reconciliation into a pending balance, promotion of
//! pending rewards after a reversal window, and device/IP fraud rules.
//!
//! Every balance change flows through a single [`storage::LedgerTx`] unit of
//! work so the effect and its ledger entry commit together.

pub mod accrual;
pub mod asset;
pub mod config;
pub mod error;
pub mod fraud;
pub mod model;
pub mod normalize;
pub mod promoter;
pub mod ratelimit;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod utils;
pub mod webhook;

pub use asset::Asset;
pub use error::{LedgerError, Result};
