//! Punch reconciliation and result computation for ARDF events.
//!
//! Raw SI-card punches are normalized, matched against each category's
//! course, and aggregated into ranked result rows. A single-writer runtime
//! keeps results current as competitors and readouts change, journaling
//! every mutation to SQLite.
//!
//! # Examples
//!
//! Computing one category with [`engine::ResultEngine`]:
//! ```
//! use ardf_results::{
//!     course::CourseDefinition,
//!     engine::{CompetitorPunches, ResultEngine},
//!     entity::{Category, Competitor, ControlPointSpec},
//!     punch::Punch,
//!     types::{RaceStatus, ScoringMode},
//! };
//!
//! let category = Category {
//!     id: 1,
//!     event_id: 1,
//!     name: "M21".to_string(),
//!     control_points: vec![
//!         ControlPointSpec::control(1, 31),
//!         ControlPointSpec::control(2, 32),
//!     ],
//!     time_limit: None,
//!     scoring: ScoringMode::TimeBased,
//! };
//! let course = CourseDefinition::build(&category).expect("valid course");
//! let competitor = Competitor {
//!     id: 7,
//!     event_id: 1,
//!     category_id: 1,
//!     name: "Jana".to_string(),
//!     si_number: Some(8_000_001),
//!     start_time: None,
//!     manual_status: None,
//! };
//! let punches = vec![
//!     Punch::start(1, 7, 0),
//!     Punch::control(2, 7, 31, 100),
//!     Punch::control(3, 7, 32, 200),
//!     Punch::finish(4, 7, 260),
//! ];
//!
//! let rows = ResultEngine::default()
//!     .compute_category(&course, &[CompetitorPunches { competitor, punches }]);
//! assert_eq!(rows[0].final_status, RaceStatus::Valid);
//! assert_eq!(rows[0].elapsed, Some(260));
//! assert_eq!(rows[0].rank, Some(1));
//! ```
//!
//! Runtime usage with SQLite sink:
//! ```no_run
//! use ardf_results::{
//!     persist::sqlite::SqliteOpSink,
//!     runtime::handle::{spawn_results_service, RuntimeConfig},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteOpSink::open("results.db").expect("open sqlite");
//! let store = sink.load_store().expect("replay journal");
//! let handle = spawn_results_service(store, Some(Box::new(sink)), RuntimeConfig::default());
//! let _rows = handle.results(1).await.expect("results");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![warn(missing_docs)]

/// Core in-memory store and index helpers.
pub mod core;
/// Course definitions built from category control points.
pub mod course;
/// Punch normalization, validation, aggregation and incremental projection.
pub mod engine;
/// Event, category and competitor records.
pub mod entity;
/// Engine and course error types.
pub mod error;
/// Mutation op model and persistence wrapper types.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Punch records and card readouts.
pub mod punch;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
