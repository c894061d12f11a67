//! Kea configuration review.
//!
//! A review runs every checker against one daemon's stored configuration
//! and replaces the daemon's previous review. Reports that found nothing
//! are stored without content so the full checker run stays visible.

mod checkers;
mod dispatcher;
mod render;

pub use checkers::{CHECKERS, Checker, Issue, ReviewContext};
pub use dispatcher::{ConfigReviewer, ReviewError, checkers_signature};
pub use render::render_report;
