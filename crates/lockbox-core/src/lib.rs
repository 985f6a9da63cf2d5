pub mod config;
pub mod error;
pub mod types;

pub use error::{ClientError, LockboxError, LockboxResult};
pub use types::{FileId, FileMetadata, UserId, UserRecord};
