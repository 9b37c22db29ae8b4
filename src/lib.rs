//! Request-admission and usage-accounting core for an AI image-generation
//! bot.
//!
//! A request travels `RECEIVED -> ADMITTED -> GENERATING -> STORING ->
//! ACCOUNTED -> DELIVERED`: the [`pipeline::RequestPipeline`] consults the
//! [`cooldown::CooldownGate`] and [`ledger::QuotaLedger`] before any
//! expensive work, calls the remote [`provider::ImageProvider`], persists the
//! artifact and its [`records::ImageRecord`] as one unit, and only then
//! charges the usage counters. The chat front end, provider payload shaping,
//! and message formatting live elsewhere and talk to this crate through the
//! pipeline's `generate`/`edit`/`list` operations.

pub mod config; // runtime configuration
pub mod cooldown; // per-user cooldown gate
pub mod error; // error handling
pub mod ledger; // daily/monthly/lifetime usage counters
pub mod pipeline; // request orchestration
pub mod provider; // remote image-generation providers
pub mod records; // image metadata and sequence allocation
pub mod storage; // artifact blob storage
pub mod sweeper; // scheduled artifact retention sweep
