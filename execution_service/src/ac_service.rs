// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use tonic::{Request, Response, Status};

use hashing::Digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use remexec::action_cache_server::ActionCache;

use crate::ServerState;

pub(crate) struct AcService {
    state: Arc<ServerState>,
}

impl AcService {
    pub(crate) fn new(state: Arc<ServerState>) -> AcService {
        AcService { state }
    }
}

#[tonic::async_trait]
impl ActionCache for AcService {
    async fn get_action_result(
        &self,
        request: Request<remexec::GetActionResultRequest>,
    ) -> Result<Response<remexec::ActionResult>, Status> {
        let digest = protos::require_digest(request.into_inner().action_digest.as_ref())
            .map_err(Status::invalid_argument)?;
        self.state
            .storage
            .action_cache()
            .read(digest)
            .map_err(Status::internal)?
            .map(Response::new)
            .ok_or_else(|| Status::not_found(format!("No cached result for {digest:?}")))
    }

    async fn update_action_result(
        &self,
        request: Request<remexec::UpdateActionResultRequest>,
    ) -> Result<Response<remexec::ActionResult>, Status> {
        let request = request.into_inner();
        let digest: Digest = protos::require_digest(request.action_digest.as_ref())
            .map_err(Status::invalid_argument)?;
        let result = request
            .action_result
            .ok_or_else(|| Status::invalid_argument("missing action_result"))?;
        self.state
            .storage
            .action_cache()
            .write(digest, &result)
            .map_err(Status::internal)?;
        Ok(Response::new(result))
    }
}
