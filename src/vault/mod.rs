//! The vault: staged task documents on disk and the frontmatter protocol
//! they are written in.

pub mod document;
pub mod frontmatter;
pub mod store;

pub use document::{ApprovalDocument, RequestedActions, TaskDocument, archive_name, stem, timestamp};
pub use frontmatter::{Document, FieldValue, Frontmatter, extract_action_section, extract_section};
pub use store::{Stage, StageIndex, TaskStore};
