#![forbid(unsafe_code)]
#![warn(missing_debug_implementations, rust_2018_idioms)]

//! # Splash Engine
//! Detects abrupt price deviations ("splashes") across polled futures tickers, classifies them
//! against configurable severity tiers, and tracks whether price returns to its pre-splash
//! reference within each tier's time budget.
//!
//! ## Overview
//! * [`SplashEngine`] polls a [`FeedSource`] on a fixed cadence.
//! * The [`StateStore`](store::StateStore) rolls each symbol's reference window and holds the
//!   only shared mutable state.
//! * [`evaluate`](tier::evaluate) decides whether a snapshot opens or progresses an episode.
//! * The [`TriggerController`] persists episodes, estimates a contextual win rate from past
//!   outcomes and spawns one return tracker per episode.
//! * Return trackers resolve episodes as `RETURNED` or `TIMEOUT`.
//!
//! ## Example
//! ```rust,no_run
//! use splash_engine::{
//!     EngineConfig, SplashEngine, feed::mexc::MexcFeed, notify::LogNotifier,
//!     persistence::InMemoryRepository,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = SplashEngine::new(
//!         EngineConfig::default(),
//!         MexcFeed::with_default_url().unwrap(),
//!         Arc::new(InMemoryRepository::new()),
//!         Arc::new(LogNotifier),
//!     );
//!
//!     engine
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//! }
//! ```

/// Engine tunables and the hot-replaceable tier set.
pub mod config;

/// Per-symbol trigger state machine.
pub mod controller;

/// Main polling loop.
pub mod engine;

/// All [`Error`](std::error::Error)s generated in splash-engine.
pub mod error;

/// [`FeedSource`] trait and the MEXC contract ticker feed.
pub mod feed;

/// Snapshots, records and status events.
pub mod model;

/// [`Notifier`](notify::Notifier) trait and implementations.
pub mod notify;

/// [`SplashRepository`](persistence::SplashRepository) trait with SQLite and in-memory implementations.
pub mod persistence;

pub mod state;

/// Historical context query and win-probability estimate.
pub mod stats;

pub mod store;

/// Tier selection and the activation/progression decision.
pub mod tier;

/// Return-back tracking tasks and their supervisor.
pub mod tracker;

pub use config::{EngineConfig, Tier, TierSet};
pub use controller::TriggerController;
pub use engine::SplashEngine;
pub use error::SplashError;
pub use feed::FeedSource;
pub use model::{Direction, RecordId, Snapshot, SplashEvent, SplashRecord, SplashStatus};
