// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use fs::directory::TreeChild;
use fs::{directory, ObjectInfo, ObjectType};
use hashing::{Digest, HashFunction};
use protos::gen::mason::serve as serve_proto;
use remote::byte_store::ByteStore;
use serve_proto::configuration_server::{Configuration, ConfigurationServer};
use serve_proto::source_tree_server::{SourceTree, SourceTreeServer};
use serve_proto::target_server::{Target, TargetServer};
use store::{Storage, TargetCacheKey};

struct ServeState {
    storage: Arc<Storage>,
    remote_cas: Option<Arc<ByteStore>>,
    remote_execution_address: Option<String>,
    /// Commits resolvable by this endpoint, as recorded by the fetcher.
    known_commits: HashMap<String, Digest>,
    /// Archive content blobs resolvable to their unpacked tree.
    known_archives: HashMap<String, Digest>,
}

impl ServeState {
    fn parse_digest(&self, hex: &str) -> Result<Digest, Status> {
        let fingerprint = hashing::Fingerprint::from_hex_string(hex)
            .map_err(|e| Status::invalid_argument(format!("Bad digest {hex:?}: {e}")))?;
        Ok(Digest::new(fingerprint, 0))
    }

    /// Resolve `subdir` within a tree by walking its children segment by segment.
    fn resolve_subdir(&self, root: Digest, subdir: &str) -> Result<Option<Digest>, String> {
        let mut current = root;
        for segment in subdir.split('/').filter(|s| !s.is_empty() && *s != ".") {
            let Some(payload) = self.storage.cas().read_tree(current)? else {
                return Ok(None);
            };
            let children =
                directory::parse_tree_payload(self.storage.hash_function(), &payload)?;
            let child = children.into_iter().find_map(|child| match child {
                TreeChild::Object { name, info }
                    if name == segment && info.object_type.is_tree() =>
                {
                    Some(info.digest)
                }
                _ => None,
            });
            match child {
                Some(digest) => current = digest,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// The closure of an object in local storage, parents before children.
    fn local_closure(&self, root: ObjectInfo) -> Result<Vec<(ObjectInfo, Bytes)>, String> {
        let cas = self.storage.cas();
        let mut closure = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ObjectInfo> = [root].into_iter().collect();
        while let Some(info) = queue.pop_front() {
            if !seen.insert(info.digest.hash) {
                continue;
            }
            let bytes = cas
                .read_object(&info)?
                .ok_or_else(|| format!("Object missing from serve storage: {info}"))?;
            if info.object_type.is_tree() {
                for child in
                    directory::parse_tree_payload(self.storage.hash_function(), &bytes)?
                {
                    if let TreeChild::Object { info, .. } = child {
                        queue.push_back(info);
                    }
                }
            }
            closure.push((info, bytes));
        }
        Ok(closure)
    }

    /// Upload an object closure to the associated remote CAS, children first.
    async fn sync_to_remote(&self, root: ObjectInfo) -> Result<(), String> {
        let Some(remote_cas) = &self.remote_cas else {
            return Err("No remote CAS associated with this serve endpoint".to_string());
        };
        let closure = self.local_closure(root)?;
        let missing = remote_cas
            .find_missing_digests(closure.iter().map(|(info, _)| info.digest))
            .await?;
        let blobs: Vec<(Digest, Bytes)> = closure
            .into_iter()
            .rev()
            .filter(|(info, _)| missing.contains(&info.digest))
            .map(|(info, bytes)| (info.digest, bytes))
            .collect();
        remote_cas.store_blobs(blobs, true).await
    }

    /// Fetch an object closure from the associated remote CAS into local storage.
    async fn fetch_from_remote(&self, root: ObjectInfo) -> Result<bool, String> {
        let Some(remote_cas) = &self.remote_cas else {
            return Err("No remote CAS associated with this serve endpoint".to_string());
        };
        let cas = self.storage.cas();
        let mut queue: VecDeque<ObjectInfo> = [root].into_iter().collect();
        let mut seen = HashSet::new();
        while let Some(info) = queue.pop_front() {
            if !seen.insert(info.digest.hash) {
                continue;
            }
            let bytes = if let Some(bytes) = cas.read_object(&info)? {
                bytes
            } else {
                match remote_cas.load_object(&info).await? {
                    Some(bytes) => {
                        if info.object_type.is_tree() {
                            cas.store_tree(&bytes)?;
                        } else {
                            cas.store_bytes(&bytes, info.object_type.is_executable())?;
                        }
                        bytes
                    }
                    None => return Ok(false),
                }
            };
            if info.object_type.is_tree() {
                for child in
                    directory::parse_tree_payload(self.storage.hash_function(), &bytes)?
                {
                    if let TreeChild::Object { info, .. } = child {
                        queue.push_back(info);
                    }
                }
            }
        }
        Ok(true)
    }
}

fn ok_status() -> i32 {
    serve_proto::ServeStatus::Ok as i32
}

fn not_found_status() -> i32 {
    serve_proto::ServeStatus::NotFound as i32
}

fn sync_error_status() -> i32 {
    serve_proto::ServeStatus::SyncError as i32
}

fn internal_error_status() -> i32 {
    serve_proto::ServeStatus::InternalError as i32
}

///
/// Builder for a serve endpoint over one build root.
///
pub struct ServeServerBuilder {
    storage: Arc<Storage>,
    remote_cas: Option<Arc<ByteStore>>,
    remote_execution_address: Option<String>,
    known_commits: HashMap<String, Digest>,
    known_archives: HashMap<String, Digest>,
}

impl ServeServerBuilder {
    pub fn new(storage: Arc<Storage>) -> ServeServerBuilder {
        ServeServerBuilder {
            storage,
            remote_cas: None,
            remote_execution_address: None,
            known_commits: HashMap::new(),
            known_archives: HashMap::new(),
        }
    }

    pub fn remote_cas(mut self, byte_store: Arc<ByteStore>, address: &str) -> ServeServerBuilder {
        self.remote_cas = Some(byte_store);
        self.remote_execution_address = Some(address.to_string());
        self
    }

    /// Record a commit the fetcher has resolved to a root tree.
    pub fn known_commit(mut self, commit: &str, tree: Digest) -> ServeServerBuilder {
        self.known_commits.insert(commit.to_string(), tree);
        self
    }

    /// Record an archive content blob the fetcher has unpacked to a tree.
    pub fn known_archive(mut self, content: &str, tree: Digest) -> ServeServerBuilder {
        self.known_archives.insert(content.to_string(), tree);
        self
    }

    pub async fn spawn(self) -> Result<ServeServer, String> {
        let state = Arc::new(ServeState {
            storage: self.storage,
            remote_cas: self.remote_cas,
            remote_execution_address: self.remote_execution_address,
            known_commits: self.known_commits,
            known_archives: self.known_archives,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| format!("Failed to bind serve port: {e}"))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to resolve serve address: {e}"))?;
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

        let router = Server::builder()
            .add_service(SourceTreeServer::new(SourceTreeService(state.clone())))
            .add_service(TargetServer::new(TargetService(state.clone())))
            .add_service(ConfigurationServer::new(ConfigurationService(state)));

        tokio::spawn(async move {
            if let Err(e) = router
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_receiver.await;
                })
                .await
            {
                log::error!("serve endpoint terminated: {e}");
            }
        });

        Ok(ServeServer {
            address: format!("http://{local_addr}"),
            _shutdown: shutdown_sender,
        })
    }
}

/// A running serve endpoint; dropping it shuts the server down.
pub struct ServeServer {
    pub address: String,
    _shutdown: oneshot::Sender<()>,
}

struct SourceTreeService(Arc<ServeState>);
struct TargetService(Arc<ServeState>);
struct ConfigurationService(Arc<ServeState>);

#[tonic::async_trait]
impl SourceTree for SourceTreeService {
    async fn serve_commit_tree(
        &self,
        request: Request<serve_proto::ServeCommitTreeRequest>,
    ) -> Result<Response<serve_proto::ServeCommitTreeResponse>, Status> {
        let request = request.into_inner();
        let Some(root) = self.0.known_commits.get(&request.commit).copied() else {
            return Ok(Response::new(serve_proto::ServeCommitTreeResponse {
                tree: String::new(),
                status: not_found_status(),
            }));
        };
        let resolved = match self.0.resolve_subdir(root, &request.subdir) {
            Ok(Some(digest)) => digest,
            Ok(None) => {
                return Ok(Response::new(serve_proto::ServeCommitTreeResponse {
                    tree: String::new(),
                    status: not_found_status(),
                }))
            }
            Err(e) => {
                warn!("ServeCommitTree failed: {e}");
                return Ok(Response::new(serve_proto::ServeCommitTreeResponse {
                    tree: String::new(),
                    status: internal_error_status(),
                }));
            }
        };
        let status = if request.sync_tree {
            match self
                .0
                .sync_to_remote(ObjectInfo::new(resolved, ObjectType::Tree))
                .await
            {
                Ok(()) => ok_status(),
                Err(e) => {
                    warn!("ServeCommitTree failed to sync: {e}");
                    sync_error_status()
                }
            }
        } else {
            ok_status()
        };
        Ok(Response::new(serve_proto::ServeCommitTreeResponse {
            tree: resolved.hash.to_hex(),
            status,
        }))
    }

    async fn serve_archive_tree(
        &self,
        request: Request<serve_proto::ServeArchiveTreeRequest>,
    ) -> Result<Response<serve_proto::ServeArchiveTreeResponse>, Status> {
        let request = request.into_inner();
        let Some(root) = self.0.known_archives.get(&request.content).copied() else {
            return Ok(Response::new(serve_proto::ServeArchiveTreeResponse {
                tree: String::new(),
                status: not_found_status(),
            }));
        };
        let resolved = match self.0.resolve_subdir(root, &request.subdir) {
            Ok(Some(digest)) => digest,
            Ok(None) => {
                return Ok(Response::new(serve_proto::ServeArchiveTreeResponse {
                    tree: String::new(),
                    status: not_found_status(),
                }))
            }
            Err(e) => {
                warn!("ServeArchiveTree failed: {e}");
                return Ok(Response::new(serve_proto::ServeArchiveTreeResponse {
                    tree: String::new(),
                    status: internal_error_status(),
                }));
            }
        };
        let status = if request.sync_tree {
            match self
                .0
                .sync_to_remote(ObjectInfo::new(resolved, ObjectType::Tree))
                .await
            {
                Ok(()) => ok_status(),
                Err(e) => {
                    warn!("ServeArchiveTree failed to sync: {e}");
                    sync_error_status()
                }
            }
        } else {
            ok_status()
        };
        Ok(Response::new(serve_proto::ServeArchiveTreeResponse {
            tree: resolved.hash.to_hex(),
            status,
        }))
    }

    async fn serve_content(
        &self,
        request: Request<serve_proto::ServeContentRequest>,
    ) -> Result<Response<serve_proto::ServeContentResponse>, Status> {
        let digest = self.0.parse_digest(&request.into_inner().content)?;
        let info = ObjectInfo::new(digest, ObjectType::File);
        if !self.0.storage.cas().has(&info) {
            return Ok(Response::new(serve_proto::ServeContentResponse {
                status: not_found_status(),
            }));
        }
        let status = match self.0.sync_to_remote(info).await {
            Ok(()) => ok_status(),
            Err(e) => {
                warn!("ServeContent failed to sync: {e}");
                sync_error_status()
            }
        };
        Ok(Response::new(serve_proto::ServeContentResponse { status }))
    }

    async fn serve_tree(
        &self,
        request: Request<serve_proto::ServeTreeRequest>,
    ) -> Result<Response<serve_proto::ServeTreeResponse>, Status> {
        let digest = self.0.parse_digest(&request.into_inner().tree)?;
        let info = ObjectInfo::new(digest, ObjectType::Tree);
        if self.0.storage.cas().tree_path(digest).is_none() {
            return Ok(Response::new(serve_proto::ServeTreeResponse {
                status: not_found_status(),
            }));
        }
        let status = match self.0.sync_to_remote(info).await {
            Ok(()) => ok_status(),
            Err(e) => {
                warn!("ServeTree failed to sync: {e}");
                sync_error_status()
            }
        };
        Ok(Response::new(serve_proto::ServeTreeResponse { status }))
    }

    async fn check_root_tree(
        &self,
        request: Request<serve_proto::CheckRootTreeRequest>,
    ) -> Result<Response<serve_proto::CheckRootTreeResponse>, Status> {
        let digest = self.0.parse_digest(&request.into_inner().tree)?;
        let status = if self.0.storage.cas().tree_path(digest).is_some() {
            ok_status()
        } else {
            not_found_status()
        };
        Ok(Response::new(serve_proto::CheckRootTreeResponse { status }))
    }

    async fn get_remote_tree(
        &self,
        request: Request<serve_proto::GetRemoteTreeRequest>,
    ) -> Result<Response<serve_proto::GetRemoteTreeResponse>, Status> {
        let digest = self.0.parse_digest(&request.into_inner().tree)?;
        let status = match self
            .0
            .fetch_from_remote(ObjectInfo::new(digest, ObjectType::Tree))
            .await
        {
            Ok(true) => ok_status(),
            Ok(false) => not_found_status(),
            Err(e) => {
                warn!("GetRemoteTree failed: {e}");
                sync_error_status()
            }
        };
        Ok(Response::new(serve_proto::GetRemoteTreeResponse { status }))
    }
}

#[tonic::async_trait]
impl Target for TargetService {
    async fn serve_target(
        &self,
        request: Request<serve_proto::ServeTargetRequest>,
    ) -> Result<Response<serve_proto::ServeTargetResponse>, Status> {
        let key_digest = protos::require_digest(
            request.into_inner().target_cache_key_id.as_ref(),
        )
        .map_err(Status::invalid_argument)?;
        let key = TargetCacheKey(key_digest);

        let entry = match self.0.storage.target_cache().read(key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return Ok(Response::new(serve_proto::ServeTargetResponse {
                    target_value: None,
                    status: not_found_status(),
                    error_message: String::new(),
                }))
            }
            Err(e) => {
                return Ok(Response::new(serve_proto::ServeTargetResponse {
                    target_value: None,
                    status: internal_error_status(),
                    error_message: e,
                }))
            }
        };

        // Readers must be able to resolve the entry without coming back: sync everything the
        // entry references, then the entry blob itself.
        for info in entry.referenced_objects() {
            if let Err(e) = self.0.sync_to_remote(info).await {
                return Ok(Response::new(serve_proto::ServeTargetResponse {
                    target_value: None,
                    status: sync_error_status(),
                    error_message: e,
                }));
            }
        }
        let entry_digest = match self.0.storage.target_cache().read_entry_digest(key) {
            Ok(Some(digest)) => digest,
            _ => {
                return Ok(Response::new(serve_proto::ServeTargetResponse {
                    target_value: None,
                    status: internal_error_status(),
                    error_message: "target cache entry vanished".to_string(),
                }))
            }
        };
        if let Err(e) = self
            .0
            .sync_to_remote(ObjectInfo::new(entry_digest, ObjectType::File))
            .await
        {
            return Ok(Response::new(serve_proto::ServeTargetResponse {
                target_value: None,
                status: sync_error_status(),
                error_message: e,
            }));
        }

        Ok(Response::new(serve_proto::ServeTargetResponse {
            target_value: Some(entry_digest.into()),
            status: ok_status(),
            error_message: String::new(),
        }))
    }

    async fn serve_target_variables(
        &self,
        request: Request<serve_proto::ServeTargetVariablesRequest>,
    ) -> Result<Response<serve_proto::ServeTargetVariablesResponse>, Status> {
        let request = request.into_inner();
        let root = self.0.parse_digest(&request.root_tree)?;

        // Walk to the target file within the root tree, then read the export target's
        // flexible configuration out of its JSON description.
        let respond_not_found = || {
            Ok(Response::new(serve_proto::ServeTargetVariablesResponse {
                flexible_config: vec![],
                status: not_found_status(),
            }))
        };

        let (dir_part, file_name) = match request.target_file.rsplit_once('/') {
            Some((dir, file)) => (dir.to_string(), file.to_string()),
            None => (String::new(), request.target_file.clone()),
        };
        let dir_digest = match self.0.resolve_subdir(root, &dir_part) {
            Ok(Some(digest)) => digest,
            _ => return respond_not_found(),
        };
        let Ok(Some(payload)) = self.0.storage.cas().read_tree(dir_digest) else {
            return respond_not_found();
        };
        let children = directory::parse_tree_payload(self.0.storage.hash_function(), &payload)
            .map_err(Status::internal)?;
        let file_digest = children.into_iter().find_map(|child| match child {
            TreeChild::Object { name, info } if name == file_name => Some(info.digest),
            _ => None,
        });
        let Some(file_digest) = file_digest else {
            return respond_not_found();
        };
        let Ok(Some(content)) = self.0.storage.cas().read_blob(file_digest) else {
            return respond_not_found();
        };

        let parsed: serde_json::Value = match serde_json::from_slice(&content) {
            Ok(value) => value,
            Err(_) => return respond_not_found(),
        };
        let Some(flexible_config) = parsed
            .get(&request.target)
            .and_then(|target| target.get("flexible_config"))
            .and_then(|config| config.as_array())
        else {
            return respond_not_found();
        };
        let flexible_config = flexible_config
            .iter()
            .filter_map(|value| value.as_str().map(|s| s.to_string()))
            .collect();

        Ok(Response::new(serve_proto::ServeTargetVariablesResponse {
            flexible_config,
            status: ok_status(),
        }))
    }
}

#[tonic::async_trait]
impl Configuration for ConfigurationService {
    async fn remote_execution_endpoint(
        &self,
        _request: Request<serve_proto::RemoteExecutionEndpointRequest>,
    ) -> Result<Response<serve_proto::RemoteExecutionEndpointResponse>, Status> {
        Ok(Response::new(serve_proto::RemoteExecutionEndpointResponse {
            address: self
                .0
                .remote_execution_address
                .clone()
                .unwrap_or_default(),
        }))
    }

    async fn compatibility(
        &self,
        _request: Request<serve_proto::CompatibilityRequest>,
    ) -> Result<Response<serve_proto::CompatibilityResponse>, Status> {
        Ok(Response::new(serve_proto::CompatibilityResponse {
            compatible: self.0.storage.hash_function() == HashFunction::Compatible,
        }))
    }
}
