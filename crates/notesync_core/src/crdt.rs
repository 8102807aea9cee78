//! Pluggable CRDT capability interface (spec.md §9).
//!
//! No type from an underlying CRDT library leaks into this crate's public
//! surface: documents are manipulated only through opaque update bytes and
//! opaque state bytes, so the storage engine can be tested and used without
//! ever linking a real CRDT implementation.

use crate::error::Result;

/// Opaque CRDT update bytes: produced by a local edit or read off a log/pack
/// file, and consumed by [`CrdtDocument::apply_update`].
pub type UpdateBytes = Vec<u8>;

/// Opaque encoded full-document state, as embedded in snapshots.
pub type StateBytes = Vec<u8>;

/// One in-memory document, owned by a single CRDT backend implementation.
/// This crate only ever calls through this trait; it never inspects the
/// concrete type.
pub trait CrdtDocument: Send {
    /// Apply a remote or replayed update. Implementations must converge
    /// regardless of application order (the CRDT property this engine
    /// relies on to ignore cross-instance interleaving).
    fn apply_update(&mut self, update: &[u8]) -> Result<()>;

    /// Encode the full current state, for writing into a snapshot.
    fn encode_state(&self) -> StateBytes;

    /// Compute an update capturing everything not reflected in
    /// `since_state`. Used to derive the bytes for a local edit, or to diff
    /// a freshly loaded snapshot against a live document.
    fn diff_state(&self, since_state: &[u8]) -> Result<UpdateBytes>;

    /// Register a callback invoked whenever this document's state changes,
    /// whether from `apply_update` or a backend-specific local edit API.
    /// The document manager (C6) uses this to re-broadcast changes to its
    /// own subscribers without depending on the backend's event type.
    fn subscribe_to_updates(&mut self, callback: Box<dyn FnMut(&[u8]) + Send>);
}

/// Factory for documents of one CRDT backend: fresh ones and ones rehydrated
/// from previously encoded state.
pub trait CrdtCapability: Send + Sync {
    /// Concrete document type this backend produces.
    type Document: CrdtDocument;

    /// A fresh, empty document.
    fn new_doc(&self) -> Self::Document;

    /// Rehydrate a document from state written by a prior `encode_state`.
    fn load_doc(&self, state: &[u8]) -> Result<Self::Document>;
}
