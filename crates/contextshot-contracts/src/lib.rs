//! Shared data model for the ContextShot generation engine: edit requests and
//! provider outcomes, batch results, the campaign variation catalog, and the
//! JSONL event writer.

pub mod campaigns;
pub mod edits;
pub mod events;
pub mod runs;
