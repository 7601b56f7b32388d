//! webmon watches a set of HTTP targets, each on its own schedule, and
//! records what it sees — status code, latency, optional content match —
//! to PostgreSQL.
//!
//! The work happens in a four-stage pipeline (scheduler → fetcher →
//! validator → sink) built on the [`pipeline`] crate. Stages share nothing
//! but their connecting queues; each caps its own admission so overload
//! sheds data deliberately instead of crashing the process.

pub mod args;
pub mod settings;
pub mod stages;
pub mod types;

pub use settings::Settings;
pub use types::{Measurement, Message, Target};
