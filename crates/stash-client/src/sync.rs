//! Sync layer: the user-facing half of the protocol
//!
//! Every non-empty field is sealed before it reaches the wire; attachments
//! are sealed as one blob to a temporary file and streamed from there. The
//! session cache serves repeat reads without a round trip; the server-side
//! version stays authoritative for every mutation.

use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use tonic::transport::Channel;
use tonic::Request;
use tracing::debug;

use stash_core::proto::vault_client::VaultClient;
use stash_core::proto::{
    AuthRequest, DeleteDataRequest, DownloadFileRequest, GetDataListRequest, GetDataRequest,
    Record, SaveDataRequest, UploadFileRequest, UploadFileResponse,
};
use stash_core::types::RecordSummary;
use stash_core::{VaultError, VaultResult};
use stash_crypto::{
    decrypt_blob, decrypt_field, derive_storage_key, encrypt_blob, encrypt_field, KdfParams,
    StorageKey, TransferCipher,
};

use crate::session::{PlainRecord, Session};

/// Upload chunk size, matching the server's download framing.
pub const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// Connect to a stash server endpoint (e.g. `http://127.0.0.1:3200`).
pub async fn connect(endpoint: String) -> VaultResult<Channel> {
    let endpoint = Channel::from_shared(endpoint)
        .map_err(|e| VaultError::InvalidArgument(format!("bad endpoint: {e}")))?;
    Ok(endpoint
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("connecting to server: {e}"))?)
}

pub struct SyncClient {
    vault: VaultClient<Channel>,
    session: Session,
    transfer: TransferCipher,
}

impl SyncClient {
    /// Register a new account and open a session.
    pub async fn register(
        channel: Channel,
        login: &str,
        password: SecretString,
        params: &KdfParams,
    ) -> VaultResult<Self> {
        let mut vault = VaultClient::new(channel);
        let response = vault
            .register(AuthRequest {
                login: login.to_string(),
                password: password.expose_secret().to_string(),
            })
            .await?;
        Self::open(vault, login, &password, params, response.into_inner().token)
    }

    /// Log in to an existing account and open a session.
    pub async fn login(
        channel: Channel,
        login: &str,
        password: SecretString,
        params: &KdfParams,
    ) -> VaultResult<Self> {
        let mut vault = VaultClient::new(channel);
        let response = vault
            .login(AuthRequest {
                login: login.to_string(),
                password: password.expose_secret().to_string(),
            })
            .await?;
        Self::open(vault, login, &password, params, response.into_inner().token)
    }

    fn open(
        vault: VaultClient<Channel>,
        login: &str,
        password: &SecretString,
        params: &KdfParams,
        token: String,
    ) -> VaultResult<Self> {
        // The storage key exists only inside this session
        let key = derive_storage_key(login, password, params)
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        Ok(Self {
            vault,
            session: Session::new(token, key),
            transfer: TransferCipher::passthrough(),
        })
    }

    /// Enable the in-transit layer for attachment payloads; the server must
    /// hold the matching identity.
    pub fn with_transfer(mut self, transfer: TransferCipher) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Save a record: seal the fields, push them, and stream the local file
    /// (if any) through the upload protocol. The cache follows the server's
    /// responses; on any failure it is left untouched so the user can retry.
    pub async fn save_record(&mut self, mut record: PlainRecord) -> VaultResult<PlainRecord> {
        let wire = encrypt_record(self.session.key(), &record)?;
        let response = self
            .vault
            .save_data(self.authed(SaveDataRequest { record: Some(wire) })?)
            .await?
            .into_inner();

        record.id = response.id;
        record.version = response.version;
        // The local path is consumed by this save; the cache must never
        // hold it, or a later re-save would silently re-stream the file.
        let pending_upload = record.file_path.take();
        self.session.remember(record.clone()).await;
        debug!(id = record.id, version = record.version, "record saved");

        if let Some(local_path) = pending_upload {
            let uploaded = self.upload_attachment(&record, &local_path).await?;
            record.file_id = Some(uploaded.file_id);
            record.version = uploaded.version;
            record.file_name = leaf_name(&local_path)?;
            self.session.remember(record.clone()).await;
        }

        Ok(record)
    }

    /// Fetch a record, serving from the session cache when possible.
    pub async fn fetch_record(&mut self, id: u64) -> VaultResult<PlainRecord> {
        if let Some(hit) = self.session.cached(id).await {
            return Ok(hit);
        }

        let response = self
            .vault
            .get_data(self.authed(GetDataRequest { id })?)
            .await?
            .into_inner();
        let wire = response.record.ok_or(VaultError::NotFound)?;

        let record = decrypt_record(self.session.key(), wire)?;
        self.session.remember(record.clone()).await;
        Ok(record)
    }

    /// Name-only inventory of the caller's records.
    pub async fn list(&mut self) -> VaultResult<Vec<RecordSummary>> {
        let response = self
            .vault
            .get_data_list(self.authed(GetDataListRequest {})?)
            .await?
            .into_inner();
        Ok(response
            .items
            .into_iter()
            .map(|item| RecordSummary {
                id: item.id,
                name: item.name,
            })
            .collect())
    }

    /// Delete a record remotely, then evict it from the cache. A failed
    /// delete leaves the cache entry in place.
    pub async fn delete_record(&mut self, id: u64) -> VaultResult<()> {
        self.vault
            .delete_data(self.authed(DeleteDataRequest { id })?)
            .await?;
        self.session.evict(id).await;
        Ok(())
    }

    /// Download and decrypt the record's attachment into `dest_dir`,
    /// returning the written path.
    pub async fn download_file(&mut self, id: u64, dest_dir: &Path) -> VaultResult<PathBuf> {
        let record = self.fetch_record(id).await?;
        let file_id = record.file_id.ok_or(VaultError::NotFound)?;

        let mut stream = self
            .vault
            .download_file(self.authed(DownloadFileRequest {
                record_id: id,
                file_id,
            })?)
            .await?
            .into_inner();

        let mut envelope = Vec::new();
        while let Some(chunk) = stream.message().await? {
            envelope.extend_from_slice(&chunk.chunk);
        }

        let envelope = String::from_utf8(envelope)
            .map_err(|_| VaultError::Crypto("attachment envelope is not valid text".into()))?;
        let plaintext = decrypt_blob(self.session.key(), &envelope)
            .map_err(|e| VaultError::Crypto(e.to_string()))?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let leaf = if record.file_name.is_empty() {
            "attachment".to_string()
        } else {
            record.file_name.clone()
        };
        let dest = dest_dir.join(leaf);
        tokio::fs::write(&dest, plaintext).await?;
        debug!(id, path = %dest.display(), "attachment downloaded");
        Ok(dest)
    }

    /// Seal the file contents to a temporary location, then stream the
    /// sealed bytes. The temporary file is removed when the guard drops.
    async fn upload_attachment(
        &mut self,
        record: &PlainRecord,
        local_path: &Path,
    ) -> VaultResult<UploadFileResponse> {
        let plaintext = tokio::fs::read(local_path).await?;
        let envelope = encrypt_blob(self.session.key(), &plaintext)
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        let payload = self
            .transfer
            .encrypt(envelope.as_bytes())
            .map_err(|e| VaultError::Crypto(e.to_string()))?;

        let temp = tempfile::NamedTempFile::new()?;
        tokio::fs::write(temp.path(), &payload).await?;

        let sealed = tokio::fs::read(temp.path()).await?;
        let messages = chunk_messages(
            record.id,
            record.version,
            record.file_id,
            &leaf_name(local_path)?,
            &sealed,
        );

        let mut request = Request::new(tokio_stream::iter(messages));
        request
            .metadata_mut()
            .insert("authorization", self.auth_value()?);
        let response = self.vault.upload_file(request).await?.into_inner();
        debug!(
            id = record.id,
            file_id = response.file_id,
            size = response.size,
            "attachment uploaded"
        );
        Ok(response)
    }

    fn authed<T>(&self, message: T) -> VaultResult<Request<T>> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert("authorization", self.auth_value()?);
        Ok(request)
    }

    fn auth_value(&self) -> VaultResult<tonic::metadata::MetadataValue<tonic::metadata::Ascii>> {
        self.session
            .token()
            .parse()
            .map_err(|_| VaultError::Unauthenticated)
    }
}

fn leaf_name(path: &Path) -> VaultResult<String> {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| VaultError::InvalidArgument("file path has no name".into()))
}

/// Split a sealed blob into upload messages; the first carries the binding
/// (record id, version token, prior file id, leaf name).
fn chunk_messages(
    record_id: u64,
    version: u64,
    file_id: Option<u64>,
    file_name: &str,
    sealed: &[u8],
) -> Vec<UploadFileRequest> {
    sealed
        .chunks(UPLOAD_CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| UploadFileRequest {
            record_id,
            version,
            file_id,
            file_name: if i == 0 {
                file_name.to_string()
            } else {
                String::new()
            },
            chunk: chunk.to_vec(),
        })
        .collect()
}

fn encrypt_record(key: &StorageKey, record: &PlainRecord) -> VaultResult<Record> {
    let seal = |value: &str| {
        encrypt_field(key, value).map_err(|e| VaultError::Crypto(e.to_string()))
    };
    Ok(Record {
        id: record.id,
        // The name stays plaintext: it is the per-owner unique label the
        // server must compare
        name: record.name.clone(),
        version: record.version,
        login: seal(&record.login)?,
        password: seal(&record.password)?,
        text: seal(&record.text)?,
        card_number: seal(&record.card_number)?,
        metadata: seal(&record.metadata)?,
        file_id: record.file_id,
        file_name: record.file_name.clone(),
    })
}

fn decrypt_record(key: &StorageKey, wire: Record) -> VaultResult<PlainRecord> {
    let open = |value: &str| {
        decrypt_field(key, value).map_err(|e| VaultError::Crypto(e.to_string()))
    };
    Ok(PlainRecord {
        id: wire.id,
        name: wire.name.clone(),
        version: wire.version,
        login: open(&wire.login)?,
        password: open(&wire.password)?,
        text: open(&wire.text)?,
        card_number: open(&wire.card_number)?,
        metadata: open(&wire.metadata)?,
        file_id: wire.file_id,
        file_name: wire.file_name,
        file_path: None,
    })
}
