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
//! # CalloutServer Module
//!
//! Server infrastructure for running the external processor.
//!
//! The `CalloutServer` is responsible for:
//!
//! - Running the plaintext gRPC server hosting the `ExternalProcessor`
//!   service together with the gRPC health service
//! - Running a simple HTTP health check endpoint for probes that do not
//!   speak gRPC
//!
//! This keeps the processor focused on processing logic rather than listener
//! management. Envoy is the only expected caller; there is no TLS and no
//! caller authentication here.

use crate::config::Config;
use crate::grpc::health::v1::{
    health_check_response::ServingStatus,
    health_server::{Health, HealthServer},
    HealthCheckRequest, HealthCheckResponse,
};
use crate::service::ExtProcService;
use futures::Stream;
use hyper::{Body, Response as HttpResponse, Server as HyperServer};
use log::{error, info};
use std::convert::Infallible;
use std::error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// gRPC health service: always `SERVING` while the process is up. `Watch` is
/// not implemented.
pub struct HealthService;

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        }))
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("watch is not implemented"))
    }
}

/// Server for hosting the external processor.
///
/// Each listener runs in its own task and can be spawned separately.
#[derive(Clone)]
pub struct CalloutServer {
    config: Config,
}

/// Stream adapter for the TcpListener used by the HTTP health check server,
/// making it compatible with hyper's `accept::from_stream`.
struct TcpListenerStream {
    listener: TcpListener,
}

impl Stream for TcpListenerStream {
    type Item = Result<tokio::net::TcpStream, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let listener = &self.listener;
        match listener.poll_accept(cx) {
            Poll::Ready(Ok((socket, _addr))) => Poll::Ready(Some(Ok(socket))),
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl CalloutServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Spawns the gRPC server in a new task.
    pub async fn spawn_grpc(&self, service: ExtProcService) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start_grpc(service).await {
                error!("Failed to start gRPC server: {}", e);
            }
        })
    }

    /// Spawns the HTTP health check server in a new task.
    pub async fn spawn_health_check(&self) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start_health_check().await {
                error!("Failed to start health check server: {}", e);
            }
        })
    }

    /// Starts the gRPC server hosting the external processor and the gRPC
    /// health service on one listener.
    async fn start_grpc(
        &self,
        service: ExtProcService,
    ) -> Result<(), Box<dyn error::Error + Send + Sync>> {
        let addr = format!("0.0.0.0:{}", self.config.port).parse()?;

        info!("Starting ext_proc gRPC server on {}", addr);
        Server::builder()
            .add_service(service.into_server())
            .add_service(HealthServer::new(HealthService))
            .serve(addr)
            .await?;

        Ok(())
    }

    /// Starts a plain-HTTP server answering every request with an empty
    /// 200 OK, for load balancers and probes that do not speak gRPC.
    async fn start_health_check(&self) -> Result<(), Box<dyn error::Error + Send + Sync>> {
        let addr = format!("0.0.0.0:{}", self.config.health_check_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Starting health check server on {}", addr);

        let make_service = hyper::service::make_service_fn(|_| async {
            Ok::<_, Infallible>(hyper::service::service_fn(|_| async {
                Ok::<_, Infallible>(HttpResponse::new(Body::from("")))
            }))
        });

        let tcp_listener_stream = TcpListenerStream { listener };

        let server = HyperServer::builder(hyper::server::accept::from_stream(tcp_listener_stream))
            .serve(make_service);

        server.await?;
        Ok(())
    }
}
