//! Workspace document - the replicated hierarchical map
//!
//! The workspace is one shared document mapping the chat domain model
//! (users, channels, messages, threads) onto nested Automerge maps with
//! CRDT-based conflict resolution for concurrent edits.

pub mod doc;

pub use doc::WorkspaceDoc;
