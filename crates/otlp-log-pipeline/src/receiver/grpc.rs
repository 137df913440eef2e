// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::logs::v1::{
    logs_service_server::{LogsService, LogsServiceServer},
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::pipeline::Pipeline;
use crate::receiver::ingest;

/// OTLP `LogsService/Export` handler. Undecodable requests are rejected by tonic
/// before this runs, so no record of a corrupt batch reaches the pipeline.
#[derive(Debug, Clone)]
pub struct LogsReceiver {
    pipeline: Arc<Pipeline>,
}

impl LogsReceiver {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl LogsService for LogsReceiver {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let count = ingest(&self.pipeline, request.into_inner());
        debug!("gRPC export processed {count} records");
        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}

pub fn logs_service(
    pipeline: Arc<Pipeline>,
    max_message_size: usize,
) -> LogsServiceServer<LogsReceiver> {
    LogsServiceServer::new(LogsReceiver::new(pipeline)).max_decoding_message_size(max_message_size)
}
