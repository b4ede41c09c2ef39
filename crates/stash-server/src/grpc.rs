//! tonic gRPC service: the wire surface of the vault
//!
//! Handlers resolve the bearer token to an owner id, map requests into the
//! domain model, and delegate to the versioning engine and the attachment
//! manager. The upload handler is the two-phase state machine: the first
//! stream message binds and authorizes, only then does anything touch disk.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info, warn};

use stash_core::proto::vault_server::{Vault, VaultServer};
use stash_core::proto::{
    AuthRequest, AuthResponse, DeleteDataRequest, DeleteDataResponse, DownloadFileRequest,
    DownloadFileResponse, GetDataListRequest, GetDataListResponse, GetDataRequest,
    GetDataResponse, RecordRef, SaveDataRequest, SaveDataResponse, UploadFileRequest,
    UploadFileResponse,
};
use stash_core::types::{FileAttachment, SecretRecord};
use stash_core::VaultError;
use stash_crypto::TransferCipher;

use crate::auth::Authenticator;
use crate::file::{FileService, Uploader};
use crate::record::RecordService;

/// Download chunk size; large enough to amortize framing overhead.
pub const DOWNLOAD_CHUNK_SIZE: usize = 1024 * 1024;

pub struct VaultService {
    auth: Arc<Authenticator>,
    records: RecordService,
    files: FileService,
    files_root: PathBuf,
    transfer: TransferCipher,
}

impl VaultService {
    pub fn new(
        auth: Arc<Authenticator>,
        records: RecordService,
        files: FileService,
        files_root: PathBuf,
    ) -> Self {
        Self {
            auth,
            records,
            files,
            files_root,
            transfer: TransferCipher::passthrough(),
        }
    }

    /// Install the in-transit layer; uploaded payloads are unwrapped with
    /// the configured identity before they are stored.
    pub fn with_transfer(mut self, transfer: TransferCipher) -> Self {
        self.transfer = transfer;
        self
    }

    async fn owner_of(&self, metadata: &tonic::metadata::MetadataMap) -> Result<u64, Status> {
        Ok(self.auth.resolve(metadata).await?)
    }

    /// Drive one upload stream to completion.
    ///
    /// States: awaiting first chunk → validated/streaming → closed. The
    /// first message must authorize against the record before the
    /// destination file is even created; a stream that never delivers a
    /// byte fails and leaves no file behind.
    pub(crate) async fn run_upload<S>(
        &self,
        owner_id: u64,
        mut stream: S,
    ) -> Result<UploadFileResponse, Status>
    where
        S: futures::Stream<Item = Result<UploadFileRequest, Status>> + Unpin,
    {
        struct Binding {
            record_id: u64,
            caller_version: u64,
            file_id: Option<u64>,
            file_name: String,
        }

        let mut uploader = Uploader::new(&self.files_root);
        let mut binding: Option<Binding> = None;

        while let Some(message) = stream.next().await {
            let req = match message {
                Ok(req) => req,
                Err(status) => {
                    uploader.discard().await?;
                    return Err(status);
                }
            };

            if binding.is_none() {
                if req.record_id == 0 {
                    return Err(VaultError::InvalidArgument("record id is required".into()).into());
                }
                let stored = self
                    .records
                    .check_upload(req.record_id, owner_id, req.file_id)
                    .await?;

                uploader.open(owner_id, stored.id, &req.file_name).await?;
                let leaf = Path::new(&req.file_name)
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();

                // Insert vs. replace follows the record's stored
                // association; the request's file_id has already been
                // validated against it and may legitimately be absent.
                binding = Some(Binding {
                    record_id: stored.id,
                    caller_version: req.version,
                    file_id: stored.file_id,
                    file_name: leaf,
                });
            }

            if let Err(e) = uploader.write(&req.chunk).await {
                error!("chunk write failed: {e}");
                uploader.discard().await?;
                return Err(e.into());
            }
        }

        let Some(binding) = binding else {
            return Err(VaultError::EmptyFile.into());
        };

        if uploader.bytes_written() == 0 {
            uploader.discard().await?;
            return Err(VaultError::EmptyFile.into());
        }

        let (path, size) = uploader.finish().await?;
        let size = if self.transfer.can_decrypt() {
            unwrap_transfer(&self.transfer, &path).await?
        } else {
            size
        };

        let mut attachment = FileAttachment {
            id: binding.file_id.unwrap_or(0),
            name: binding.file_name,
            path,
        };
        self.files.save(&mut attachment).await?;

        let version = match self
            .records
            .attach_file(
                binding.record_id,
                owner_id,
                binding.caller_version,
                attachment.id,
            )
            .await
        {
            Ok(version) => version,
            Err(e) => {
                // The bytes are on disk but the record kept its old version;
                // the caller must re-fetch and retry the whole upload.
                warn!(
                    record = binding.record_id,
                    file = attachment.id,
                    "attachment association failed: {e}"
                );
                return Err(e.into());
            }
        };

        info!(
            record = binding.record_id,
            file = attachment.id,
            version,
            size,
            "upload complete"
        );

        Ok(UploadFileResponse {
            file_id: attachment.id,
            version,
            size,
        })
    }

    /// Open the attachment for a record and stream it out in fixed-size
    /// chunks. The handle lives in the sender task and closes on every exit
    /// path, including a dropped receiver.
    pub(crate) async fn run_download(
        &self,
        owner_id: u64,
        record_id: u64,
        file_id: u64,
    ) -> Result<ReceiverStream<Result<DownloadFileResponse, Status>>, Status> {
        let record = self.records.get(record_id, owner_id).await?;
        if record.file_id != Some(file_id) {
            return Err(VaultError::NotFound.into());
        }

        let file = self.files.get(file_id).await?;
        let mut handle = tokio::fs::File::open(&file.path).await.map_err(|e| {
            error!(path = %file.path.display(), "opening attachment failed: {e}");
            Status::internal("error opening attachment")
        })?;

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
            loop {
                match handle.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = DownloadFileResponse {
                            chunk: buf[..n].to_vec(),
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Receiver gone: client cancelled the stream
                            break;
                        }
                    }
                    Err(e) => {
                        error!("reading attachment failed: {e}");
                        let _ = tx
                            .send(Err(Status::internal("error reading attachment")))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

#[tonic::async_trait]
impl Vault for VaultService {
    async fn register(
        &self,
        request: Request<AuthRequest>,
    ) -> Result<Response<AuthResponse>, Status> {
        let req = request.into_inner();
        let token = self.auth.register(&req.login, &req.password).await?;
        Ok(Response::new(AuthResponse { token }))
    }

    async fn login(
        &self,
        request: Request<AuthRequest>,
    ) -> Result<Response<AuthResponse>, Status> {
        let req = request.into_inner();
        let token = self.auth.login(&req.login, &req.password).await?;
        Ok(Response::new(AuthResponse { token }))
    }

    async fn save_data(
        &self,
        request: Request<SaveDataRequest>,
    ) -> Result<Response<SaveDataResponse>, Status> {
        let owner_id = self.owner_of(request.metadata()).await?;
        let wire = request
            .into_inner()
            .record
            .ok_or_else(|| Status::invalid_argument("record is required"))?;
        if wire.name.is_empty() {
            return Err(Status::invalid_argument("record name is required"));
        }

        let mut record = SecretRecord::from_proto(wire, owner_id);
        self.records.upsert(&mut record).await?;

        Ok(Response::new(SaveDataResponse {
            id: record.id,
            version: record.version,
        }))
    }

    async fn get_data(
        &self,
        request: Request<GetDataRequest>,
    ) -> Result<Response<GetDataResponse>, Status> {
        let owner_id = self.owner_of(request.metadata()).await?;
        let id = request.into_inner().id;

        let record = self.records.get(id, owner_id).await?;
        let file_name = match record.file_id {
            Some(file_id) => self.files.get(file_id).await?.name,
            None => String::new(),
        };

        Ok(Response::new(GetDataResponse {
            record: Some(record.to_proto(&file_name)),
        }))
    }

    async fn get_data_list(
        &self,
        request: Request<GetDataListRequest>,
    ) -> Result<Response<GetDataListResponse>, Status> {
        let owner_id = self.owner_of(request.metadata()).await?;
        let items = self
            .records
            .list(owner_id)
            .await?
            .into_iter()
            .map(|s| RecordRef {
                id: s.id,
                name: s.name,
            })
            .collect();
        Ok(Response::new(GetDataListResponse { items }))
    }

    async fn delete_data(
        &self,
        request: Request<DeleteDataRequest>,
    ) -> Result<Response<DeleteDataResponse>, Status> {
        let owner_id = self.owner_of(request.metadata()).await?;
        let id = request.into_inner().id;
        self.records.delete(id, owner_id).await?;
        Ok(Response::new(DeleteDataResponse {}))
    }

    async fn upload_file(
        &self,
        request: Request<Streaming<UploadFileRequest>>,
    ) -> Result<Response<UploadFileResponse>, Status> {
        let owner_id = self.owner_of(request.metadata()).await?;
        let response = self.run_upload(owner_id, request.into_inner()).await?;
        Ok(Response::new(response))
    }

    type DownloadFileStream = ReceiverStream<Result<DownloadFileResponse, Status>>;

    async fn download_file(
        &self,
        request: Request<DownloadFileRequest>,
    ) -> Result<Response<Self::DownloadFileStream>, Status> {
        let owner_id = self.owner_of(request.metadata()).await?;
        let req = request.into_inner();
        let stream = self
            .run_download(owner_id, req.record_id, req.file_id)
            .await?;
        Ok(Response::new(stream))
    }
}

/// Strip the in-transit age layer from an uploaded payload, leaving the
/// client's storage envelope on disk. Returns the stored size.
async fn unwrap_transfer(transfer: &TransferCipher, path: &Path) -> Result<u64, Status> {
    let sealed = tokio::fs::read(path).await.map_err(VaultError::Io)?;
    match transfer.decrypt(&sealed) {
        Ok(envelope) => {
            tokio::fs::write(path, &envelope).await.map_err(VaultError::Io)?;
            Ok(envelope.len() as u64)
        }
        Err(e) => {
            tokio::fs::remove_file(path).await.map_err(VaultError::Io)?;
            Err(VaultError::Crypto(format!("transfer layer: {e}")).into())
        }
    }
}

/// Start the gRPC server on a TCP address.
pub async fn serve(addr: SocketAddr, service: VaultService) -> anyhow::Result<()> {
    info!(%addr, "gRPC server ready");
    Server::builder()
        .add_service(VaultServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryFileStore, MemoryRecordStore};
    use tempfile::TempDir;
    use tonic::Code;

    struct Harness {
        service: VaultService,
        _files_dir: TempDir,
    }

    fn harness() -> Harness {
        let files_dir = tempfile::tempdir().unwrap();
        let files = FileService::new(Arc::new(MemoryFileStore::new()));
        let records = RecordService::new(Arc::new(MemoryRecordStore::new()), files.clone());
        let service = VaultService::new(
            Arc::new(Authenticator::new()),
            records,
            files,
            files_dir.path().to_path_buf(),
        );
        Harness {
            service,
            _files_dir: files_dir,
        }
    }

    async fn insert_record(service: &VaultService, owner_id: u64, name: &str) -> SecretRecord {
        let mut record = SecretRecord {
            owner_id,
            name: name.into(),
            ..Default::default()
        };
        service.records.upsert(&mut record).await.unwrap();
        record
    }

    fn upload_stream(
        messages: Vec<UploadFileRequest>,
    ) -> impl futures::Stream<Item = Result<UploadFileRequest, Status>> + Unpin {
        tokio_stream::iter(messages.into_iter().map(Ok))
    }

    fn chunked_upload(
        record: &SecretRecord,
        file_name: &str,
        content: &[u8],
        chunk_size: usize,
    ) -> Vec<UploadFileRequest> {
        let mut messages = Vec::new();
        for (i, chunk) in content.chunks(chunk_size).enumerate() {
            messages.push(UploadFileRequest {
                record_id: record.id,
                version: record.version,
                file_id: record.file_id,
                file_name: if i == 0 { file_name.into() } else { String::new() },
                chunk: chunk.to_vec(),
            });
        }
        messages
    }

    async fn collect_download(
        service: &VaultService,
        owner_id: u64,
        record_id: u64,
        file_id: u64,
    ) -> Result<Vec<u8>, Status> {
        let mut stream = service.run_download(owner_id, record_id, file_id).await?;
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?.chunk);
        }
        Ok(bytes)
    }

    #[tokio::test]
    async fn test_upload_then_download_roundtrip() {
        let h = harness();
        let record = insert_record(&h.service, 1, "bank").await;

        // Scenario: three chunks, 1500 bytes total, against version 1
        let content: Vec<u8> = (0..1500u32).map(|i| (i % 256) as u8).collect();
        let messages = chunked_upload(&record, "statement.bin", &content, 500);
        assert_eq!(messages.len(), 3);

        let response = h
            .service
            .run_upload(1, upload_stream(messages))
            .await
            .unwrap();
        assert_ne!(response.file_id, 0);
        assert_eq!(response.version, 2);
        assert_eq!(response.size, 1500);

        let stored = h.service.records.get(record.id, 1).await.unwrap();
        assert_eq!(stored.file_id, Some(response.file_id));
        assert_eq!(stored.version, 2);

        let bytes = collect_download(&h.service, 1, record.id, response.file_id)
            .await
            .unwrap();
        assert_eq!(bytes, content);
    }

    #[tokio::test]
    async fn test_zero_byte_upload_fails_and_leaves_record_unchanged() {
        let h = harness();
        let record = insert_record(&h.service, 1, "bank").await;

        let messages = vec![UploadFileRequest {
            record_id: record.id,
            version: record.version,
            file_id: None,
            file_name: "empty.bin".into(),
            chunk: Vec::new(),
        }];
        let err = h
            .service
            .run_upload(1, upload_stream(messages))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let stored = h.service.records.get(record.id, 1).await.unwrap();
        assert_eq!(stored.file_id, None);
        assert_eq!(stored.version, 1);
        // and the partial file is gone
        let dir = crate::file::attachment_dir(&h.service.files_root, 1, record.id);
        assert!(!dir.join("empty.bin").exists());
    }

    #[tokio::test]
    async fn test_empty_stream_fails() {
        let h = harness();
        let err = h
            .service
            .run_upload(1, upload_stream(Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_upload_against_stale_version_conflicts() {
        let h = harness();
        let record = insert_record(&h.service, 1, "bank").await;

        // Bump the record behind the uploader's back
        let mut update = record.clone();
        update.text = "envelope".into();
        h.service.records.upsert(&mut update).await.unwrap();

        let messages = chunked_upload(&record, "doc.bin", b"payload", 4);
        let err = h
            .service
            .run_upload(1, upload_stream(messages))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        let stored = h.service.records.get(record.id, 1).await.unwrap();
        assert_eq!(stored.file_id, None, "conflict must not associate the file");
    }

    #[tokio::test]
    async fn test_upload_with_wrong_file_id_rejected_before_any_write() {
        let h = harness();
        let record = insert_record(&h.service, 1, "bank").await;

        let messages = vec![UploadFileRequest {
            record_id: record.id,
            version: record.version,
            file_id: Some(99),
            file_name: "doc.bin".into(),
            chunk: b"data".to_vec(),
        }];
        let err = h
            .service
            .run_upload(1, upload_stream(messages))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let dir = crate::file::attachment_dir(&h.service.files_root, 1, record.id);
        assert!(!dir.exists(), "no byte may hit the disk before validation");
    }

    #[tokio::test]
    async fn test_upload_replacement_deletes_superseded_bytes() {
        let h = harness();
        let record = insert_record(&h.service, 1, "bank").await;

        let first = chunked_upload(&record, "v1.bin", b"first version", 64);
        let resp1 = h.service.run_upload(1, upload_stream(first)).await.unwrap();

        let mut current = h.service.records.get(record.id, 1).await.unwrap();
        current.file_id = Some(resp1.file_id);
        let second = chunked_upload(&current, "v2.bin", b"second version!!", 64);
        let resp2 = h
            .service
            .run_upload(1, upload_stream(second))
            .await
            .unwrap();

        // Replacement keeps the row, bumps the version, removes old bytes
        assert_eq!(resp2.file_id, resp1.file_id);
        assert_eq!(resp2.version, 3);
        let dir = crate::file::attachment_dir(&h.service.files_root, 1, record.id);
        assert!(!dir.join("v1.bin").exists());
        assert!(dir.join("v2.bin").exists());

        let bytes = collect_download(&h.service, 1, record.id, resp2.file_id)
            .await
            .unwrap();
        assert_eq!(bytes, b"second version!!");
    }

    #[tokio::test]
    async fn test_reupload_without_file_id_replaces_attachment() {
        let h = harness();
        let record = insert_record(&h.service, 1, "bank").await;

        let first = chunked_upload(&record, "v1.bin", b"first version", 64);
        let resp1 = h.service.run_upload(1, upload_stream(first)).await.unwrap();

        // The client re-uploads without naming the prior attachment; this
        // must still be an in-place replacement, not a second row.
        let mut current = h.service.records.get(record.id, 1).await.unwrap();
        current.file_id = None;
        let second = chunked_upload(&current, "v2.bin", b"second version!!", 64);
        let resp2 = h
            .service
            .run_upload(1, upload_stream(second))
            .await
            .unwrap();

        assert_eq!(resp2.file_id, resp1.file_id);
        let row = h.service.files.get(resp1.file_id).await.unwrap();
        assert_eq!(row.name, "v2.bin");
        assert!(matches!(
            h.service.files.get(resp1.file_id + 1).await.unwrap_err(),
            VaultError::NotFound
        ));

        let dir = crate::file::attachment_dir(&h.service.files_root, 1, record.id);
        assert!(!dir.join("v1.bin").exists(), "superseded bytes must be gone");
        assert!(dir.join("v2.bin").exists());
    }

    #[tokio::test]
    async fn test_upload_unwraps_transfer_layer() {
        let identity = age::x25519::Identity::generate();
        let keys_dir = tempfile::tempdir().unwrap();
        let identity_path = keys_dir.path().join("identity.txt");
        {
            use age::secrecy::ExposeSecret;
            std::fs::write(&identity_path, identity.to_string().expose_secret()).unwrap();
        }
        let recipient_path = keys_dir.path().join("recipient.txt");
        std::fs::write(&recipient_path, identity.to_public().to_string()).unwrap();

        let Harness { service, _files_dir } = harness();
        let service = service
            .with_transfer(TransferCipher::from_files(None, Some(&identity_path)).unwrap());
        let record = insert_record(&service, 1, "bank").await;

        let client_cipher =
            TransferCipher::from_files(Some(&recipient_path), None).unwrap();
        let envelope = b"client-sealed envelope bytes";
        let payload = client_cipher.encrypt(envelope).unwrap();
        assert_ne!(payload, envelope);

        let messages = chunked_upload(&record, "doc.bin", &payload, 64);
        let resp = service.run_upload(1, upload_stream(messages)).await.unwrap();
        assert_eq!(resp.size, envelope.len() as u64);

        // What lands on disk is the storage envelope, armor removed
        let stored = service.files.get(resp.file_id).await.unwrap();
        assert_eq!(tokio::fs::read(&stored.path).await.unwrap(), envelope);

        let bytes = collect_download(&service, 1, record.id, resp.file_id)
            .await
            .unwrap();
        assert_eq!(bytes, envelope);
    }

    #[tokio::test]
    async fn test_download_ownership_isolation() {
        let h = harness();
        let record = insert_record(&h.service, 1, "bank").await;
        let messages = chunked_upload(&record, "doc.bin", b"owned bytes", 64);
        let resp = h
            .service
            .run_upload(1, upload_stream(messages))
            .await
            .unwrap();

        let err = collect_download(&h.service, 2, record.id, resp.file_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_download_with_mismatched_file_id_is_not_found() {
        let h = harness();
        let record = insert_record(&h.service, 1, "bank").await;
        let messages = chunked_upload(&record, "doc.bin", b"bytes", 64);
        let resp = h
            .service
            .run_upload(1, upload_stream(messages))
            .await
            .unwrap();

        let err = collect_download(&h.service, 1, record.id, resp.file_id + 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_save_data_requires_token() {
        let h = harness();
        let request = Request::new(SaveDataRequest { record: None });
        let err = h.service.save_data(request).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_rpc_save_get_delete_with_token() {
        let h = harness();
        let token = h.service.auth.register("alice", "pw").await.unwrap();

        let mut request = Request::new(SaveDataRequest {
            record: Some(stash_core::proto::Record {
                name: "bank".into(),
                login: "envelope".into(),
                ..Default::default()
            }),
        });
        request
            .metadata_mut()
            .insert("authorization", token.parse().unwrap());
        let saved = h.service.save_data(request).await.unwrap().into_inner();
        assert_eq!(saved.version, 1);

        let mut request = Request::new(GetDataRequest { id: saved.id });
        request
            .metadata_mut()
            .insert("authorization", token.parse().unwrap());
        let fetched = h.service.get_data(request).await.unwrap().into_inner();
        let record = fetched.record.unwrap();
        assert_eq!(record.name, "bank");
        assert_eq!(record.login, "envelope");
        assert_eq!(record.file_id, None);

        let mut request = Request::new(DeleteDataRequest { id: saved.id });
        request
            .metadata_mut()
            .insert("authorization", token.parse().unwrap());
        h.service.delete_data(request).await.unwrap();

        let mut request = Request::new(GetDataRequest { id: saved.id });
        request
            .metadata_mut()
            .insert("authorization", token.parse().unwrap());
        let err = h.service.get_data(request).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }
}
