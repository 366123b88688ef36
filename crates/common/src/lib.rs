//! Error-context helpers and small utilities shared by the jobkit crates.

pub mod error;
pub mod slug;

pub use {error::FromMessage, slug::slugify};
