use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

/// Error taxonomy shared by server and client.
///
/// Every failure in the core maps to exactly one of these kinds; nothing is
/// retried internally and conflicts are never reconciled automatically.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("caller identity absent or invalid")]
    Unauthenticated,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("record version absent")]
    VersionAbsent,

    #[error("record version outdated")]
    VersionConflict,

    #[error("record name already in use")]
    NameNotUnique,

    #[error("login already in use")]
    LoginTaken,

    #[error("not found")]
    NotFound,

    #[error("file id does not match the record")]
    BadFileId,

    #[error("uploaded file is empty")]
    EmptyFile,

    #[error("cipher error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<VaultError> for tonic::Status {
    fn from(err: VaultError) -> Self {
        use tonic::Status;

        match err {
            VaultError::Unauthenticated => Status::unauthenticated(err.to_string()),
            VaultError::InvalidArgument(_) | VaultError::VersionAbsent | VaultError::EmptyFile => {
                Status::invalid_argument(err.to_string())
            }
            // Ownership failures are deliberately indistinguishable from absence
            VaultError::NotFound | VaultError::BadFileId => Status::not_found(err.to_string()),
            VaultError::VersionConflict => Status::failed_precondition(err.to_string()),
            VaultError::NameNotUnique | VaultError::LoginTaken => {
                Status::already_exists(err.to_string())
            }
            VaultError::Grpc(status) => status,
            VaultError::Crypto(_)
            | VaultError::Storage(_)
            | VaultError::Io(_)
            | VaultError::Other(_) => Status::internal(err.to_string()),
        }
    }
}
