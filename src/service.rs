// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Per-stream gRPC service loop.
//!
//! Binds an [`ExtProcessor`] to the Envoy `ExternalProcessor` service. Each
//! stream gets its own task, a unique stream id and a fresh
//! [`StreamContext`]; within the stream, handling is strictly sequential:
//! one inbound message in, one outbound message out, in order. Peer EOF and
//! cancellation both end the loop cleanly; only genuine transport errors are
//! surfaced on the outbound stream.

use crate::envoy::service::ext_proc::v3::{
    external_processor_server::{ExternalProcessor, ExternalProcessorServer},
    processing_request::Request as ProcessingRequestVariant,
    ProcessingRequest, ProcessingResponse,
};
use crate::processor::{ExtProcessor, StreamContext};
use futures::Stream;
use log::{debug, info, warn};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status};

/// Source of stream-unique identifiers, assigned when Envoy opens a stream.
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

pub struct ExtProcService {
    processor: Arc<dyn ExtProcessor>,
}

impl ExtProcService {
    pub fn new<P: ExtProcessor>(processor: P) -> Self {
        Self {
            processor: Arc::new(processor),
        }
    }

    pub fn into_server(self) -> ExternalProcessorServer<Self> {
        ExternalProcessorServer::new(self)
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream =
        Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

    async fn process(
        &self,
        request: Request<tonic::Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let mut stream = request.into_inner();
        let (tx, rx) = mpsc::channel(32);
        let processor = self.processor.clone();
        let mut ctx = StreamContext::new(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed));

        tokio::spawn(async move {
            debug!("[ExtProcService] stream {} started", ctx.stream_id());

            loop {
                let req = match stream.message().await {
                    Ok(Some(req)) => req,
                    Ok(None) => {
                        debug!("[ExtProcService] stream {} closed by peer", ctx.stream_id());
                        break;
                    }
                    Err(status) if status.code() == Code::Cancelled => {
                        info!(
                            "[ExtProcService] stream {} cancelled, finishing up",
                            ctx.stream_id()
                        );
                        break;
                    }
                    Err(status) => {
                        warn!(
                            "[ExtProcService] stream {} receive error: {}",
                            ctx.stream_id(),
                            status
                        );
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };

                let result = match &req.request {
                    Some(ProcessingRequestVariant::RequestHeaders(_)) => {
                        processor.process_request_headers(&req, &mut ctx).await
                    }
                    Some(ProcessingRequestVariant::ResponseHeaders(_)) => {
                        processor.process_response_headers(&req, &mut ctx).await
                    }
                    Some(ProcessingRequestVariant::RequestBody(_)) => {
                        processor.process_request_body(&req, &mut ctx).await
                    }
                    Some(ProcessingRequestVariant::ResponseBody(_)) => {
                        processor.process_response_body(&req, &mut ctx).await
                    }
                    _ => Ok(ProcessingResponse::default()),
                };

                match result {
                    Ok(resp) => {
                        if tx.send(Ok(resp)).await.is_err() {
                            debug!(
                                "[ExtProcService] stream {} peer went away during send",
                                ctx.stream_id()
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
