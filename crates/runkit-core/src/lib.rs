//! Network-facing building blocks for runkit.
//!
//! - Runtime metadata catalog client.
//! - Archive download, checksum verification and extraction.
//! - Version comparison helpers.

mod archive;
mod catalog;
mod version;

/// Archive download/extract service with retry and SHA-256 verification.
pub use archive::{ArchiveError, HttpArchiveService, extract_zip, sha256_file};
/// Per-kind metadata catalog over HTTP (or a local `file://` catalog).
pub use catalog::{CatalogError, HttpMetadataCatalog, parse_catalog};
/// Version comparison used for update discovery.
pub use version::{is_newer_version, update_available};
