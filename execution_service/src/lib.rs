// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A server for the CAS protocol over one build root: Capabilities, CAS, ActionCache and
//! ByteStream backed by the local store, and an Execution service that runs actions through
//! the local executor. What one invocation can do against a remote cluster, it can do
//! against this server.

mod ac_service;
mod bytestream_service;
mod capabilities_service;
mod cas_service;
mod exec_service;


use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tonic::transport::{Identity, Server, ServerTlsConfig};

use execution::local::LocalApi;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::bytestream::byte_stream_server::ByteStreamServer;
use remexec::action_cache_server::ActionCacheServer;
use remexec::capabilities_server::CapabilitiesServer;
use remexec::content_addressable_storage_server::ContentAddressableStorageServer;
use remexec::execution_server::ExecutionServer as ExecutionGrpcServer;
use store::Storage;

/// State shared by all services of one server instance.
pub(crate) struct ServerState {
    pub(crate) storage: Arc<Storage>,
    pub(crate) local: Arc<LocalApi>,
    /// In-flight byte-stream uploads by resource name, surviving stream interruptions so
    /// clients can resume from the committed offset.
    pub(crate) partial_writes: Mutex<HashMap<String, Vec<u8>>>,
    /// Completed uploads by resource name, for `QueryWriteStatus`.
    pub(crate) completed_writes: Mutex<HashMap<String, i64>>,
    /// Finished operations by name, for `WaitExecution`.
    pub(crate) operations: Mutex<HashMap<String, remexec::ExecuteResponse>>,
}

///
/// A running execution service endpoint. Dropping it shuts the server down.
///
pub struct ExecutionServer {
    pub address: String,
    _shutdown: oneshot::Sender<()>,
}

impl ExecutionServer {
    /// Bind to `127.0.0.1` on an ephemeral port, optionally with server TLS (PEM cert and
    /// key contents).
    pub async fn spawn(
        storage: Arc<Storage>,
        local: Arc<LocalApi>,
        tls: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Result<ExecutionServer, String> {
        let state = Arc::new(ServerState {
            storage,
            local,
            partial_writes: Mutex::new(HashMap::new()),
            completed_writes: Mutex::new(HashMap::new()),
            operations: Mutex::new(HashMap::new()),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| format!("Failed to bind execution service port: {e}"))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to resolve local address: {e}"))?;
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

        let mut builder = Server::builder();
        if let Some((cert, key)) = tls {
            builder = builder
                .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
                .map_err(|e| format!("Invalid server TLS configuration: {e}"))?;
        }

        let router = builder
            .add_service(CapabilitiesServer::new(capabilities_service::CapabilitiesService::new(
                state.clone(),
            )))
            .add_service(ContentAddressableStorageServer::new(
                cas_service::CasService::new(state.clone()),
            ))
            .add_service(ByteStreamServer::new(bytestream_service::ByteStreamService::new(
                state.clone(),
            )))
            .add_service(ActionCacheServer::new(ac_service::AcService::new(state.clone())))
            .add_service(ExecutionGrpcServer::new(exec_service::ExecService::new(state)));

        tokio::spawn(async move {
            if let Err(e) = router
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_receiver.await;
                })
                .await
            {
                log::error!("execution service terminated: {e}");
            }
        });

        Ok(ExecutionServer {
            address: format!("http://{local_addr}"),
            _shutdown: shutdown_sender,
        })
    }
}
