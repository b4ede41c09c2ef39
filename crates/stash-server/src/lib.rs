//! stash-server: the server half of the secret-sync protocol
//!
//! The versioning engine and the attachment manager sit behind narrow
//! repository traits; the gRPC layer binds them to the wire.

pub mod auth;
pub mod file;
pub mod grpc;
pub mod memory;
pub mod record;
pub mod repository;

pub use auth::Authenticator;
pub use file::{FileService, Uploader};
pub use grpc::{serve, VaultService};
pub use record::RecordService;
