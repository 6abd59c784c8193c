//! Context curation: trust-labeled, deterministic context packs.
//!
//! - [`pack`]: the `ContextPack` data model and trust metadata
//! - [`curator`]: the pure pack builder with tiering, conflicts, drift
//! - [`sanitize`]: prompt-injection scanning for retrieved chunks

pub mod curator;
pub mod pack;
pub mod sanitize;

pub use curator::{
    build_pack, detect_policy_conflicts, detect_tier_conflicts, extract_error_excerpt,
    extract_stderr_entities, jaccard, promotable_doc_ids, CuratorConfig, PackInputs,
};
pub use pack::{
    ConflictSeverity, ConflictWarning, ContextChunk, ContextConflict, ContextPack, ExcludedChunk,
    ExclusionReason, Origin, OriginMetadata, SanitizationAction, SanitizeActionKind,
};
pub use sanitize::{redact, sanitize_chunk, scan_text, InjectionAction, ScanReport};
