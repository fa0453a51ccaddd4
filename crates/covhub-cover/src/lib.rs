//! Coverage profile model, merge and diff
//!
//! Everything in this crate is pure and synchronous: profiles are parsed from
//! and serialized to the line-oriented profile text format, merged across
//! agents, folded into per-file summaries, and compared against a baseline.

pub mod coverage;
pub mod diff;
pub mod error;
pub mod merge;
pub mod profile;
pub mod report;

pub use coverage::{percent_str, Coverage, CoverageList};
pub use diff::{diff, DeltaCov, NONE_PERCENTAGE, TOTAL_ROW};
pub use error::CoverError;
pub use merge::merge;
pub use profile::{CoverageBlock, Mode, Profile};
pub use report::render_table;
