//! The driver-facing side of the provider.
//!
//! [`ProviderService`] is the JSON-level interface a provider implements.
//! The private gRPC adapter translates protobuf requests into calls on it,
//! and [`serve`] runs the adapter behind the handshake protocol.
//!
//! # Signal Handling
//!
//! SIGTERM and SIGINT (CTRL+C on other platforms) start a graceful shutdown:
//! the listener closes, in-flight requests get [`ServeOptions::shutdown_timeout`]
//! to finish, and then the provider's `stop()` runs.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ProviderError;
use crate::generated as proto;
use crate::schema::{has_errors, Block, Diagnostic, DiagnosticSeverity, ProviderSchema, Schema};
use crate::types::{
    ImportedResource, PlanResult, ProviderMetadata, HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};

/// Operations a provider exposes to the driver.
///
/// States and configuration are JSON values. Operation failures are returned
/// as [`ProviderError`]s and reach the driver as error diagnostics.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// Schemas for the provider configuration, resources and data sources.
    fn schema(&self) -> ProviderSchema;

    /// Resource and data source names, derived from the schema.
    fn metadata(&self) -> ProviderMetadata {
        let schema = self.schema();
        let mut resources: Vec<String> = schema.resources.into_keys().collect();
        let mut data_sources: Vec<String> = schema.data_sources.into_keys().collect();
        resources.sort();
        data_sources.sort();
        ProviderMetadata {
            resources,
            data_sources,
        }
    }

    /// Check the provider configuration without acting on it.
    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Apply the provider configuration.
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Release resources before the process exits.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Check a resource configuration before planning.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = (resource_type, config);
        Ok(vec![])
    }

    /// Migrate state written under an older schema version.
    ///
    /// The default returns the state unchanged.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        let _ = (resource_type, version);
        Ok(state)
    }

    /// Compute the planned state for a resource.
    ///
    /// `prior_state` is `None` on create; `proposed_state` is `Value::Null`
    /// on destroy.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create a resource from its planned state.
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError>;

    /// Refresh a resource's state.
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError>;

    /// Move a resource from `prior_state` to `planned_state`.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError>;

    /// Delete a resource.
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError>;

    /// Bring an existing remote object under management.
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let _ = id;
        Err(ProviderError::InvalidRequest(format!(
            "import is not supported for {}",
            resource_type
        )))
    }

    /// Check a data source configuration before reading.
    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = (data_source_type, config);
        Ok(vec![])
    }

    /// Read a data source.
    async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let _ = config;
        Err(ProviderError::UnknownResource(data_source_type.to_string()))
    }
}

/// Adapts a [`ProviderService`] to the generated gRPC service.
struct ProviderGrpcService<P: ProviderService> {
    provider: Arc<P>,
}

/// Decode a JSON payload; an empty payload is `null`.
fn decode(bytes: &[u8]) -> Result<Value, Status> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| Status::from(ProviderError::Serialization(e)))
}

fn encode(value: &Value) -> Result<Vec<u8>, Status> {
    serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to encode state: {}", e)))
}

fn diagnostic_to_proto(diagnostic: Diagnostic) -> proto::Diagnostic {
    let severity = match diagnostic.severity {
        DiagnosticSeverity::Error => proto::diagnostic::Severity::Error,
        DiagnosticSeverity::Warning => proto::diagnostic::Severity::Warning,
    };
    proto::Diagnostic {
        severity: severity as i32,
        summary: diagnostic.summary,
        detail: diagnostic.detail.unwrap_or_default(),
        attribute: diagnostic.attribute.unwrap_or_default(),
    }
}

fn diagnostics_to_proto(diagnostics: Vec<Diagnostic>) -> Vec<proto::Diagnostic> {
    diagnostics.into_iter().map(diagnostic_to_proto).collect()
}

fn error_to_proto(err: &ProviderError) -> Vec<proto::Diagnostic> {
    vec![diagnostic_to_proto(Diagnostic::error(err.to_string()))]
}

/// Log the outcome of a diagnostics-only call and convert it.
fn report(
    rpc: &'static str,
    result: Result<Vec<Diagnostic>, ProviderError>,
) -> Vec<proto::Diagnostic> {
    match result {
        Ok(diagnostics) if has_errors(&diagnostics) => {
            warn!(rpc, diagnostics = diagnostics.len(), "Completed with errors");
            diagnostics_to_proto(diagnostics)
        },
        Ok(diagnostics) => {
            debug!(rpc, "Completed successfully");
            diagnostics_to_proto(diagnostics)
        },
        Err(e) => {
            error!(rpc, error = %e, "Failed");
            error_to_proto(&e)
        },
    }
}

/// Convert the outcome of a state-returning call into `(state, diagnostics)`.
fn state_response(
    rpc: &'static str,
    result: Result<Value, ProviderError>,
) -> Result<(Vec<u8>, Vec<proto::Diagnostic>), Status> {
    match result {
        Ok(state) => {
            debug!(rpc, "Completed successfully");
            Ok((encode(&state)?, vec![]))
        },
        Err(e) => {
            error!(rpc, error = %e, "Failed");
            Ok((vec![], error_to_proto(&e)))
        },
    }
}

fn schema_to_proto(schema: &Schema) -> proto::Schema {
    proto::Schema {
        version: i64::try_from(schema.version).unwrap_or(i64::MAX),
        block: Some(block_to_proto(&schema.block)),
    }
}

fn block_to_proto(block: &Block) -> proto::Block {
    let mut attributes: Vec<proto::Attribute> = block
        .attributes
        .iter()
        .map(|(name, attr)| proto::Attribute {
            name: name.clone(),
            r#type: serde_json::to_vec(&attr.attr_type).unwrap_or_default(),
            required: attr.flags.required,
            optional: attr.flags.optional,
            computed: attr.flags.computed,
            sensitive: attr.flags.sensitive,
            description: attr.description.clone().unwrap_or_default(),
            force_new: attr.force_new,
            default_value: vec![],
        })
        .collect();
    attributes.sort_by(|a, b| a.name.cmp(&b.name));

    proto::Block {
        attributes,
        block_types: vec![],
        description: block.description.clone().unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl<P: ProviderService> proto::provider_server::Provider for ProviderGrpcService<P> {
    #[instrument(skip_all, name = "grpc.get_metadata")]
    async fn get_metadata(
        &self,
        _request: Request<proto::GetMetadataRequest>,
    ) -> Result<Response<proto::GetMetadataResponse>, Status> {
        let metadata = self.provider.metadata();
        debug!(
            resources = metadata.resources.len(),
            data_sources = metadata.data_sources.len(),
            "GetMetadata completed"
        );
        Ok(Response::new(proto::GetMetadataResponse {
            server_capabilities: Some(proto::ServerCapabilities { plan_destroy: true }),
            resources: metadata.resources,
            data_sources: metadata.data_sources,
            diagnostics: vec![],
        }))
    }

    #[instrument(skip_all, name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: Request<proto::GetSchemaRequest>,
    ) -> Result<Response<proto::GetSchemaResponse>, Status> {
        let schema = self.provider.schema();
        Ok(Response::new(proto::GetSchemaResponse {
            provider: Some(schema_to_proto(&schema.provider)),
            resources: schema
                .resources
                .iter()
                .map(|(name, s)| (name.clone(), schema_to_proto(s)))
                .collect(),
            data_sources: schema
                .data_sources
                .iter()
                .map(|(name, s)| (name.clone(), schema_to_proto(s)))
                .collect(),
            diagnostics: vec![],
        }))
    }

    #[instrument(skip_all, name = "grpc.validate_provider_config")]
    async fn validate_provider_config(
        &self,
        request: Request<proto::ValidateProviderConfigRequest>,
    ) -> Result<Response<proto::ValidateProviderConfigResponse>, Status> {
        let config = decode(&request.into_inner().config)?;
        let result = self.provider.validate_provider_config(config).await;
        Ok(Response::new(proto::ValidateProviderConfigResponse {
            diagnostics: report("ValidateProviderConfig", result),
        }))
    }

    #[instrument(skip_all, name = "grpc.configure")]
    async fn configure(
        &self,
        request: Request<proto::ConfigureRequest>,
    ) -> Result<Response<proto::ConfigureResponse>, Status> {
        let config = decode(&request.into_inner().config)?;
        let result = self.provider.configure(config).await;
        Ok(Response::new(proto::ConfigureResponse {
            diagnostics: report("Configure", result),
        }))
    }

    #[instrument(skip_all, name = "grpc.stop")]
    async fn stop(
        &self,
        _request: Request<proto::StopRequest>,
    ) -> Result<Response<proto::StopResponse>, Status> {
        info!("Stop requested");
        let error = match self.provider.stop().await {
            Ok(()) => String::new(),
            Err(e) => {
                error!(error = %e, "Stop failed");
                e.to_string()
            },
        };
        Ok(Response::new(proto::StopResponse { error }))
    }

    #[instrument(skip_all, name = "grpc.validate_resource_config", fields(resource_type))]
    async fn validate_resource_config(
        &self,
        request: Request<proto::ValidateResourceConfigRequest>,
    ) -> Result<Response<proto::ValidateResourceConfigResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let config = decode(&req.config)?;
        let result = self
            .provider
            .validate_resource_config(&req.resource_type, config)
            .await;
        Ok(Response::new(proto::ValidateResourceConfigResponse {
            diagnostics: report("ValidateResourceConfig", result),
        }))
    }

    #[instrument(skip_all, name = "grpc.upgrade_resource_state", fields(resource_type))]
    async fn upgrade_resource_state(
        &self,
        request: Request<proto::UpgradeResourceStateRequest>,
    ) -> Result<Response<proto::UpgradeResourceStateResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let state = decode(&req.raw_state)?;
        let result = self
            .provider
            .upgrade_resource_state(&req.resource_type, req.version, state)
            .await;
        let (upgraded_state, diagnostics) = state_response("UpgradeResourceState", result)?;
        Ok(Response::new(proto::UpgradeResourceStateResponse {
            upgraded_state,
            diagnostics,
        }))
    }

    #[instrument(skip_all, name = "grpc.plan", fields(resource_type))]
    async fn plan(
        &self,
        request: Request<proto::PlanRequest>,
    ) -> Result<Response<proto::PlanResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let prior_state = match decode(&req.prior_state)? {
            Value::Null => None,
            state => Some(state),
        };
        let proposed_state = decode(&req.proposed_state)?;
        let config = decode(&req.config)?;

        let response = match self
            .provider
            .plan(&req.resource_type, prior_state, proposed_state, config)
            .await
        {
            Ok(plan) => {
                info!(
                    changes = plan.changes.len(),
                    requires_replace = plan.requires_replace,
                    "Plan completed"
                );
                proto::PlanResponse {
                    planned_state: encode(&plan.planned_state)?,
                    changes: plan.changes.into_iter().map(Into::into).collect(),
                    requires_replace: plan.requires_replace,
                    diagnostics: vec![],
                }
            },
            Err(e) => {
                error!(error = %e, "Plan failed");
                proto::PlanResponse {
                    diagnostics: error_to_proto(&e),
                    ..Default::default()
                }
            },
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all, name = "grpc.create", fields(resource_type))]
    async fn create(
        &self,
        request: Request<proto::CreateRequest>,
    ) -> Result<Response<proto::CreateResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let planned_state = decode(&req.planned_state)?;
        let result = self.provider.create(&req.resource_type, planned_state).await;
        let (state, diagnostics) = state_response("Create", result)?;
        Ok(Response::new(proto::CreateResponse { state, diagnostics }))
    }

    #[instrument(skip_all, name = "grpc.read", fields(resource_type))]
    async fn read(
        &self,
        request: Request<proto::ReadRequest>,
    ) -> Result<Response<proto::ReadResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let current_state = decode(&req.current_state)?;
        let result = self.provider.read(&req.resource_type, current_state).await;
        let (state, diagnostics) = state_response("Read", result)?;
        Ok(Response::new(proto::ReadResponse { state, diagnostics }))
    }

    #[instrument(skip_all, name = "grpc.update", fields(resource_type))]
    async fn update(
        &self,
        request: Request<proto::UpdateRequest>,
    ) -> Result<Response<proto::UpdateResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let prior_state = decode(&req.prior_state)?;
        let planned_state = decode(&req.planned_state)?;
        let result = self
            .provider
            .update(&req.resource_type, prior_state, planned_state)
            .await;
        let (state, diagnostics) = state_response("Update", result)?;
        Ok(Response::new(proto::UpdateResponse { state, diagnostics }))
    }

    #[instrument(skip_all, name = "grpc.delete", fields(resource_type))]
    async fn delete(
        &self,
        request: Request<proto::DeleteRequest>,
    ) -> Result<Response<proto::DeleteResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());
        let current_state = decode(&req.current_state)?;
        let result = self
            .provider
            .delete(&req.resource_type, current_state)
            .await
            .map(|()| vec![]);
        Ok(Response::new(proto::DeleteResponse {
            diagnostics: report("Delete", result),
        }))
    }

    #[instrument(skip_all, name = "grpc.import_resource_state", fields(resource_type))]
    async fn import_resource_state(
        &self,
        request: Request<proto::ImportResourceStateRequest>,
    ) -> Result<Response<proto::ImportResourceStateResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("resource_type", req.resource_type.as_str());

        let response = match self
            .provider
            .import_resource(&req.resource_type, &req.id)
            .await
        {
            Ok(imported) => {
                info!(count = imported.len(), "ImportResourceState completed");
                let imported = imported
                    .into_iter()
                    .map(|r| {
                        Ok(proto::ImportedResource {
                            state: encode(&r.state)?,
                            resource_type: r.resource_type,
                        })
                    })
                    .collect::<Result<Vec<_>, Status>>()?;
                proto::ImportResourceStateResponse {
                    imported,
                    diagnostics: vec![],
                }
            },
            Err(e) => {
                error!(error = %e, "ImportResourceState failed");
                proto::ImportResourceStateResponse {
                    imported: vec![],
                    diagnostics: error_to_proto(&e),
                }
            },
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all, name = "grpc.validate_data_source_config", fields(data_source_type))]
    async fn validate_data_source_config(
        &self,
        request: Request<proto::ValidateDataSourceConfigRequest>,
    ) -> Result<Response<proto::ValidateDataSourceConfigResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("data_source_type", req.data_source_type.as_str());
        let config = decode(&req.config)?;
        let result = self
            .provider
            .validate_data_source_config(&req.data_source_type, config)
            .await;
        Ok(Response::new(proto::ValidateDataSourceConfigResponse {
            diagnostics: report("ValidateDataSourceConfig", result),
        }))
    }

    #[instrument(skip_all, name = "grpc.read_data_source", fields(data_source_type))]
    async fn read_data_source(
        &self,
        request: Request<proto::ReadDataSourceRequest>,
    ) -> Result<Response<proto::ReadDataSourceResponse>, Status> {
        let req = request.into_inner();
        tracing::Span::current().record("data_source_type", req.data_source_type.as_str());
        let config = decode(&req.config)?;
        let result = self
            .provider
            .read_data_source(&req.data_source_type, config)
            .await;
        let (state, diagnostics) = state_response("ReadDataSource", result)?;
        Ok(Response::new(proto::ReadDataSourceResponse { state, diagnostics }))
    }
}

/// Options for the provider server.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// How long in-flight requests may run after a shutdown signal.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServeOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// The line printed to stdout once the server is listening.
pub fn handshake_line(addr: SocketAddr) -> String {
    format!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, addr)
}

/// Wait for SIGTERM or SIGINT (CTRL+C on non-Unix platforms).
///
/// If no handler can be installed the future never completes.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                }
                return;
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers, falling back to CTRL+C");
            },
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received CTRL+C, shutting down"),
        Err(e) => {
            error!(error = %e, "Failed to listen for CTRL+C; shutdown only via Stop");
            std::future::pending::<()>().await;
        },
    }
}

/// Serve a provider on an ephemeral localhost port.
///
/// Prints `HEMMER_PROVIDER|<version>|<address>` to stdout, then serves gRPC
/// until a shutdown signal arrives.
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_options(provider, ServeOptions::default()).await
}

/// Like [`serve`], with custom [`ServeOptions`].
pub async fn serve_with_options<P: ProviderService>(
    provider: P,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    serve_listener(provider, listener, options, wait_for_shutdown_signal()).await
}

/// Serve a provider on a specific address.
pub async fn serve_on<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(provider, listener, ServeOptions::default(), wait_for_shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` completes.
pub async fn serve_listener<P, F>(
    provider: P,
    listener: TcpListener,
    options: ServeOptions,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    P: ProviderService,
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    println!("{}", handshake_line(addr));
    info!(address = %addr, "Provider server starting");

    let provider = Arc::new(provider);
    let service = proto::provider_server::ProviderServer::new(ProviderGrpcService {
        provider: Arc::clone(&provider),
    });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(
        Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::TcpListenerStream::new(listener),
                async {
                    let _ = stop_rx.await;
                },
            ),
    );

    tokio::select! {
        result = &mut server => {
            result??;
            info!("Server exited");
        },
        () = shutdown => {
            let _ = stop_tx.send(());
            match tokio::time::timeout(options.shutdown_timeout, &mut server).await {
                Ok(result) => {
                    result??;
                    info!("Server shutdown complete");
                },
                Err(_) => {
                    warn!(timeout = ?options.shutdown_timeout, "Shutdown timeout exceeded, aborting in-flight requests");
                    server.abort();
                },
            }
        },
    }

    if let Err(e) = provider.stop().await {
        warn!(error = %e, "Provider stop returned an error");
    }
    info!("Provider shutdown complete");
    Ok(())
}
