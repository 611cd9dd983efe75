//! Bingo-event simulation core.
//!
//! Two halves:
//!   - the deterministic engine that replays one run of an event from its
//!     frozen snapshot (`engine` and the leaf modules it drives), and
//!   - the batch pipeline that fans runs out to workers and folds their
//!     results back into per-batch aggregates (`pipeline`, `worker`,
//!     `buffer`, `finalize`, `distribution`, `store`).

pub mod assembly;
pub mod buffer;
pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod event;
pub mod finalize;
pub mod metrics;
pub mod modifiers;
pub mod pipeline;
pub mod progress;
pub mod rng;
pub mod schedule;
pub mod seed;
pub mod snapshot;
pub mod store;
pub mod strategy;
pub mod types;
pub mod worker;
