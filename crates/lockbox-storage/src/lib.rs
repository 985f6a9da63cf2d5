//! lockbox-storage: where ciphertext and file records live
//!
//! Two capabilities, both object-safe so the transfer layer can hold them as
//! `Arc<dyn ...>`:
//! - [`BlobStore`]: opaque named byte objects (OpenDAL-backed)
//! - [`MetadataStore`]: file records, plus [`UserKeyStore`] for wrapped keys

pub mod blob;
pub mod catalog;
pub mod health;
pub mod json;
pub mod operator;

pub use blob::{BlobStore, ByteStream, OperatorBlobStore};
pub use catalog::{MemoryCatalog, MetadataStore};
pub use health::check_health;
pub use json::JsonCatalog;
pub use lockbox_crypto::UserKeyStore;
pub use operator::{build_operator, S3Credentials};
