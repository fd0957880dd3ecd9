//! # workq
//!
//! Durable work queue over a shared key-value store.
//!
//! Provides at-least-once delivery with leased polling, automatic retry,
//! dead-lettering and orphan accounting (`queue`), admission control through
//! per-subject rate limiting and priority capacity tracking (`traffic`), a
//! live count of running executions (`monitor`), and OpenTelemetry
//! observability.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod monitor;
pub mod queue;
pub mod telemetry;
pub mod traffic;
pub mod worker;
