//! lockbox-transfer: streaming encrypted file upload and download
//!
//! ```text
//! upload:   chunks ─▶ FrameEncoder ─▶ mpsc(handoff_depth) ─▶ writer task ─▶ BlobStore
//!                                                              │ joined
//!                                                              ▼
//!                                                        MetadataStore
//!
//! download: MetadataStore ─▶ owner check ─▶ BlobStore ─▶ BufReader ─▶ FrameDecoder ─▶ chunks
//! ```

pub mod download;
pub mod service;
pub mod upload;

pub use download::DownloadStream;
pub use service::Transfer;
pub use upload::{UploadHandle, UploadState};
