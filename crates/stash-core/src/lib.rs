pub mod config;
pub mod error;
pub mod types;

pub use error::{VaultError, VaultResult};

/// Generated gRPC types and service traits (from stash.proto)
pub mod proto {
    tonic::include_proto!("stash");
}
