//! # bloatprobe
//!
//! Client-side traffic-generation and measurement engine for bufferbloat
//! testing: drive a cooperating server to saturation, sample latency under
//! load, and report what the link did.
//!
//! ## Design Philosophy
//!
//! bloatprobe is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Deterministic teardown** - Every stream owns a cancellation token;
//!   termination is bounded by timeouts and escalates to a forced close
//! - **Measurement-honest** - Saturation never self-throttles, payload is
//!   incompressible, and headers defend against middlebox interference
//!
//! ## Quick Start
//!
//! ```no_run
//! use bloatprobe::{Config, Event, SingleUserTest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let test = SingleUserTest::new(Config::default());
//!
//!     // Subscribe to events
//!     let mut events = test.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             match event {
//!                 Event::PhaseChanged { phase } => println!("phase: {phase}"),
//!                 Event::TrafficUpdate(update) => println!("{} bps", update.throughput),
//!                 _ => {}
//!             }
//!         }
//!     });
//!
//!     // The external latency sampler feeds RTTs into the sink
//!     let _sink = test.latency_sink();
//!
//!     let grade_inputs = test.run().await?;
//!     println!("baseline latency: {} ms", grade_inputs.baseline_latency_ms);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Virtual household simulation (workers, profiles, wire formats)
pub mod household;
/// Throughput and latency accounting
pub mod metrics;
/// Pooled pseudo-random payload source
pub mod payload;
/// Single-user phase timetable and controller
pub mod phase;
/// Stream registry and lifecycle management
pub mod registry;
/// Retry logic for transient transport failures
pub mod retry;
/// Saturation drivers (download, upload, warmup)
pub mod saturation;
/// Single-user sequenced saturation test
pub mod single_user;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, GradeThreshold, GradeThresholds, ThresholdTable};
pub use error::{Error, Result, TransportError};
pub use household::HouseholdTest;
pub use household::profile::UserProfile;
pub use payload::PayloadSource;
pub use registry::{StreamCounts, StreamHandle, StreamRegistry};
pub use saturation::OptimalParamsStore;
pub use single_user::{LatencySink, SingleUserTest};
pub use types::{
    ActivityStatus, Direction, Event, GradeInputs, LatencyMeasurement, LifecycleKind,
    OptimalParameters, OverallSummary, Phase, RunSummary, Sentiment, SentimentLevel,
    SentimentTrend, StreamId, TestId, TrafficUpdate, UserId, UserSummary,
};
