//! Persistent user records for MediBot.
//!
//! SQLite holds users, their enrolled face embeddings and saved
//! conversations. Per-user JSON documents are supported for export and
//! for importing the legacy file-per-user directory.

pub mod codec;
pub mod document;
pub mod store;

pub use document::{export_user, import_dir, ImportReport, UserDocument};
pub use store::{StoreError, UserStore, UserSummary};
