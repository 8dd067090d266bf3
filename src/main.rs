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
use inference_extproc::config::Config;
use inference_extproc::processor::GatewayProcessor;
use inference_extproc::server::CalloutServer;
use inference_extproc::service::ExtProcService;
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env();
    info!("Starting inference ext_proc service on port {}", config.port);

    let processor = GatewayProcessor::new(&config);
    let service = ExtProcService::new(processor);
    let server = CalloutServer::new(config);

    // Start all services
    let grpc = server.spawn_grpc(service).await;
    let health = server.spawn_health_check().await;

    // Wait for all services
    let _ = tokio::try_join!(grpc, health)?;

    Ok(())
}
