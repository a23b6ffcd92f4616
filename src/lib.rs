//! Offline-first sync core for the SIGERD civil-defense field app.
//!
//! Two components do the real work:
//! - [`risk::RiskAreaIndex`] answers point-in-risk-area queries over static
//!   GeoJSON datasets, used to annotate records at capture time;
//! - [`sync::OfflineSyncStore`] is the durable local queue of captured
//!   records, flushed to a Supabase-style remote with at-least-once delivery
//!   over idempotent upserts.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod payload;
pub mod reference;
pub mod remote;
pub mod risk;
pub mod sync;
pub mod trigger;
