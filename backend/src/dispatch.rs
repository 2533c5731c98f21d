//! JSON-RPC request dispatch.
//!
//! Protocol methods are matched explicitly; tool and resource lookups go
//! through registration tables built once at startup. Argument
//! validation happens before a handler runs, and handler failures are
//! mapped to JSON-RPC error envelopes at this boundary, never surfaced
//! as transport failures.

use crate::session::Session;
use crate::state::AppState;
use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sluss_types::rpc::code;
use sluss_types::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Future type returned by tool handlers.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A registered tool handler: an async function of (context, arguments).
pub type ToolHandler = Arc<dyn Fn(ToolContext, Value) -> HandlerFuture + Send + Sync>;

/// A registered resource handler, producing text contents.
pub type ResourceHandler =
    Arc<dyn Fn(AppState) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// Everything a tool handler needs, passed explicitly: no ambient
/// context object.
#[derive(Clone)]
pub struct ToolContext {
    pub state: AppState,
    pub session: Session,
    /// Id of the originating request.
    pub request_id: Value,
    /// Token correlating progress updates, from `_meta.progressToken`
    /// with the request id as fallback.
    pub progress_token: Value,
    /// Cooperative cancellation for this request.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Emit a log notification correlated to this request.
    pub async fn log(&self, level: &str, data: impl Into<Value>) -> crate::store::Result<u64> {
        self.session
            .notifier()
            .log(Some(self.request_id.clone()), level, None, data)
            .await
    }

    /// Emit a progress update correlated to this request.
    pub async fn progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> crate::store::Result<u64> {
        self.session
            .notifier()
            .progress(
                Some(self.request_id.clone()),
                &self.progress_token,
                progress,
                total,
                message,
            )
            .await
    }

    /// Emit a resource-updated notification.
    pub async fn resource_updated(&self, uri: &str) -> crate::store::Result<u64> {
        self.session
            .notifier()
            .resource_updated(Some(self.request_id.clone()), uri)
            .await
    }

    /// Whether the client cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A registered tool.
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    validator: jsonschema::Validator,
    handler: ToolHandler,
}

/// Table of tools, built at startup and immutable afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. The input schema is compiled once here; invalid
    /// schemas and duplicate names are startup errors.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: impl Fn(ToolContext, Value) -> HandlerFuture + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        let name = name.into();
        if self.resolve(&name).is_some() {
            return Err(anyhow!("Tool already registered: {}", name));
        }
        let validator = jsonschema::validator_for(&input_schema)
            .map_err(|e| anyhow!("Invalid input schema for {}: {}", name, e))?;
        self.tools.push(ToolSpec {
            name,
            description: description.into(),
            input_schema,
            validator,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Look up a tool by exact name.
    pub fn resolve(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Tool descriptors for `tools/list`, in registration order.
    pub fn descriptors(&self) -> Value {
        Value::Array(
            self.tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect(),
        )
    }
}

/// A registered resource.
pub struct ResourceSpec {
    pub uri: String,
    pub name: String,
    pub description: String,
    handler: ResourceHandler,
}

/// Table of resources, built at startup and immutable afterwards.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: Vec<ResourceSpec>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        uri: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl Fn(AppState) -> BoxFuture<'static, anyhow::Result<String>>
            + Send
            + Sync
            + 'static,
    ) -> anyhow::Result<()> {
        let uri = uri.into();
        if self.resolve(&uri).is_some() {
            return Err(anyhow!("Resource already registered: {}", uri));
        }
        self.resources.push(ResourceSpec {
            uri,
            name: name.into(),
            description: description.into(),
            handler: Arc::new(handler),
        });
        Ok(())
    }

    pub fn resolve(&self, uri: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.uri == uri)
    }

    /// Resource descriptors for `resources/list`.
    pub fn descriptors(&self) -> Value {
        Value::Array(
            self.resources
                .iter()
                .map(|r| {
                    json!({
                        "uri": r.uri,
                        "name": r.name,
                        "description": r.description,
                        "mimeType": "text/plain",
                    })
                })
                .collect(),
        )
    }
}

/// Tool call parameters.
#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(rename = "_meta", default)]
    meta: Option<Value>,
}

/// Resource read parameters.
#[derive(Debug, Deserialize)]
struct ResourceReadParams {
    uri: String,
}

/// Request dispatcher.
pub struct Dispatcher;

impl Dispatcher {
    /// Handle a JSON-RPC request on a session. Returns `None` for client
    /// notifications, which expect no response.
    pub async fn dispatch(
        state: &AppState,
        session: &Session,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        debug!("Dispatching method: {}", request.method);

        if !request.is_valid_version() {
            return Some(JsonRpcResponse::error(
                id,
                code::INVALID_REQUEST,
                format!("Unsupported JSON-RPC version: {}", request.jsonrpc),
            ));
        }

        let response = match request.method.as_str() {
            "initialize" => Some(Self::handle_initialize(id)),
            "notifications/initialized" => None,
            "ping" => Some(JsonRpcResponse::success(id, json!({}))),
            "tools/list" => Some(JsonRpcResponse::success(
                id,
                json!({ "tools": state.tools().descriptors() }),
            )),
            "tools/call" => Some(
                Self::handle_call_tool(state, session, id, request.params.unwrap_or(json!({})))
                    .await,
            ),
            "resources/list" => Some(JsonRpcResponse::success(
                id,
                json!({ "resources": state.resources().descriptors() }),
            )),
            "resources/read" => Some(
                Self::handle_read_resource(state, id, request.params.unwrap_or(json!({}))).await,
            ),
            "notifications/cancelled" => {
                if let Some(params) = request.params {
                    if let Some(request_id) = params.get("requestId") {
                        if !session.cancel_request(request_id).await {
                            warn!("Cancel for unknown request {}", request_id);
                        }
                    }
                }
                None
            }
            _ => Some(JsonRpcResponse::error(
                id,
                code::METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )),
        };

        if let Some(ref response) = response {
            if response.is_error() {
                state.metrics().record_error();
            }
        }
        response
    }

    fn handle_initialize(id: Option<Value>) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                    "resources": {},
                    "logging": {}
                },
                "serverInfo": {
                    "name": "sluss",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    async fn handle_call_tool(
        state: &AppState,
        session: &Session,
        id: Option<Value>,
        params: Value,
    ) -> JsonRpcResponse {
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    code::INVALID_PARAMS,
                    format!("Invalid tool call params: {}", e),
                )
            }
        };
        let args = params.arguments.unwrap_or(json!({}));

        // Resolve and validate before the handler runs: invalid input
        // must not cause handler side effects.
        let (handler, tool_name) = match state.tools().resolve(&params.name) {
            Some(spec) => {
                if let Err(e) = spec.validator.validate(&args) {
                    return JsonRpcResponse::error(
                        id,
                        code::INVALID_PARAMS,
                        format!("Invalid arguments for {}: {}", params.name, e),
                    );
                }
                (spec.handler.clone(), spec.name.clone())
            }
            None => {
                return JsonRpcResponse::error(
                    id,
                    code::INVALID_PARAMS,
                    format!("Unknown tool: {}", params.name),
                )
            }
        };

        let request_id = id.clone().unwrap_or(Value::Null);
        let progress_token = params
            .meta
            .as_ref()
            .and_then(|m| m.get("progressToken").cloned())
            .unwrap_or_else(|| request_id.clone());

        let cancel = session.begin_request(&request_id).await;
        let ctx = ToolContext {
            state: state.clone(),
            session: session.clone(),
            request_id: request_id.clone(),
            progress_token,
            cancel,
        };

        let deadline = state.options().request_timeout;
        let outcome =
            tokio::time::timeout(deadline, AssertUnwindSafe((handler)(ctx, args)).catch_unwind())
                .await;
        session.finish_request(&request_id).await;

        match outcome {
            Err(_) => {
                warn!("Tool {} timed out after {:?}", tool_name, deadline);
                JsonRpcResponse::error(
                    id,
                    code::REQUEST_TIMEOUT,
                    format!("Request timed out after {}s", deadline.as_secs()),
                )
            }
            Ok(Err(_)) => {
                error!("Tool {} panicked", tool_name);
                JsonRpcResponse::error(
                    id,
                    code::INTERNAL_ERROR,
                    format!("Tool {} panicked", tool_name),
                )
            }
            Ok(Ok(Err(e))) => JsonRpcResponse::error(
                id,
                code::INTERNAL_ERROR,
                format!("Tool call failed: {}", e),
            ),
            Ok(Ok(Ok(value))) => JsonRpcResponse::success(id, Self::wrap_tool_result(value)),
        }
    }

    /// Wrap a tool result in the MCP content format.
    fn wrap_tool_result(value: Value) -> Value {
        let text = match value {
            Value::String(s) => s,
            other => serde_json::to_string_pretty(&other).unwrap_or_default(),
        };
        json!({
            "content": [{
                "type": "text",
                "text": text
            }]
        })
    }

    async fn handle_read_resource(
        state: &AppState,
        id: Option<Value>,
        params: Value,
    ) -> JsonRpcResponse {
        let params: ResourceReadParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    code::INVALID_PARAMS,
                    format!("Invalid resource read params: {}", e),
                )
            }
        };

        let handler = match state.resources().resolve(&params.uri) {
            Some(spec) => spec.handler.clone(),
            None => {
                return JsonRpcResponse::error(
                    id,
                    code::INVALID_PARAMS,
                    format!("Unknown resource: {}", params.uri),
                )
            }
        };

        match (handler)(state.clone()).await {
            Ok(text) => JsonRpcResponse::success(
                id,
                json!({
                    "contents": [{
                        "uri": params.uri,
                        "mimeType": "text/plain",
                        "text": text
                    }]
                }),
            ),
            Err(e) => JsonRpcResponse::error(
                id,
                code::INTERNAL_ERROR,
                format!("Resource read failed: {}", e),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    async fn state_with(tools: ToolRegistry) -> (AppState, Session) {
        let state = AppState::new(tools, ResourceRegistry::new(), RuntimeOptions::default());
        let session = state.sessions().create_session().await;
        (state, session)
    }

    fn request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let (state, session) = state_with(ToolRegistry::new()).await;
        let response = Dispatcher::dispatch(&state, &session, request("no/such/method", None))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_version_is_rejected() {
        let (state, session) = state_with(ToolRegistry::new()).await;
        let mut req = request("ping", None);
        req.jsonrpc = "1.0".to_string();
        let response = Dispatcher::dispatch(&state, &session, req).await.unwrap();
        assert_eq!(response.error.unwrap().code, code::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_before_handler_runs() {
        static RAN: AtomicBool = AtomicBool::new(false);

        let mut tools = ToolRegistry::new();
        tools
            .register(
                "probe",
                "Records that it ran",
                json!({
                    "type": "object",
                    "properties": { "value": { "type": "string" } },
                    "required": ["value"]
                }),
                |_ctx, _args| {
                    Box::pin(async {
                        RAN.store(true, Ordering::SeqCst);
                        Ok(json!("ran"))
                    })
                },
            )
            .unwrap();

        let (state, session) = state_with(tools).await;
        let response = Dispatcher::dispatch(
            &state,
            &session,
            request("tools/call", Some(json!({"name": "probe", "arguments": {}}))),
        )
        .await
        .unwrap();

        assert_eq!(response.error.unwrap().code, code::INVALID_PARAMS);
        assert!(!RAN.load(Ordering::SeqCst), "handler ran on invalid params");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let (state, session) = state_with(ToolRegistry::new()).await;
        let response = Dispatcher::dispatch(
            &state,
            &session,
            request("tools/call", Some(json!({"name": "ghost"}))),
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_handler_error_maps_to_internal_error() {
        let mut tools = ToolRegistry::new();
        tools
            .register(
                "fail",
                "Always fails",
                json!({"type": "object"}),
                |_ctx, _args| Box::pin(async { Err(anyhow!("boom")) }),
            )
            .unwrap();

        let (state, session) = state_with(tools).await;
        let response = Dispatcher::dispatch(
            &state,
            &session,
            request("tools/call", Some(json!({"name": "fail"}))),
        )
        .await
        .unwrap();

        let error = response.error.unwrap();
        assert_eq!(error.code, code::INTERNAL_ERROR);
        assert!(error.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let mut tools = ToolRegistry::new();
        tools
            .register(
                "sleep",
                "Sleeps past the deadline",
                json!({"type": "object"}),
                |_ctx, _args| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(json!("done"))
                    })
                },
            )
            .unwrap();

        let options = RuntimeOptions {
            request_timeout: Duration::from_millis(50),
            ..RuntimeOptions::default()
        };
        let state = AppState::new(tools, ResourceRegistry::new(), options);
        let session = state.sessions().create_session().await;

        let response = Dispatcher::dispatch(
            &state,
            &session,
            request("tools/call", Some(json!({"name": "sleep"}))),
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, code::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_initialize_reports_protocol_version() {
        let (state, session) = state_with(ToolRegistry::new()).await;
        let response = Dispatcher::dispatch(&state, &session, request("initialize", None))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "sluss");
    }

    #[tokio::test]
    async fn test_tool_result_wrapped_in_content() {
        let mut tools = ToolRegistry::new();
        tools
            .register(
                "echo",
                "Echoes its input",
                json!({"type": "object"}),
                |_ctx, args| Box::pin(async move { Ok(args["text"].clone()) }),
            )
            .unwrap();

        let (state, session) = state_with(tools).await;
        let response = Dispatcher::dispatch(
            &state,
            &session,
            request(
                "tools/call",
                Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
            ),
        )
        .await
        .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_cancelled_notification_flags_in_flight_request() {
        let (state, session) = state_with(ToolRegistry::new()).await;
        let token = session.begin_request(&json!(42)).await;

        let notification = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "notifications/cancelled".to_string(),
            params: Some(json!({"requestId": 42})),
        };
        let response = Dispatcher::dispatch(&state, &session, notification).await;
        assert!(response.is_none());
        assert!(token.is_cancelled());
    }
}
