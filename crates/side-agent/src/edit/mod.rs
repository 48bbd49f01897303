//! Edit blocks: parse from model output, match against files, apply,
//! report.
//!
//! A batch of blocks travels as fenced sections in assistant content. Each
//! block carries a sequence number that stays stable for the lifetime of a
//! plan step; the application report cites those numbers, and history
//! retention uses them to keep the originating proposals around.

mod apply;
mod matcher;
mod parser;

pub use apply::{EditReportEntry, apply_edit_blocks, render_report};
pub use matcher::{AcceptableMatch, MatchOutcome, MatchQuality, find_acceptable_match};
pub use parser::{EditBlock, EditType, parse_edit_blocks};
