//! MCP server implementation using rmcp.
//!
//! Exposes the execution core as a small set of inspection tools. Every
//! tool answers with exactly one JSON text block; failures are returned as
//! tool errors carrying `success: false`, never as protocol errors.

use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::exec::ExecutionResult;
use crate::mode::{DecisionReason, ModeDecision, RequestedMode, Strategy};
use crate::pagination::{paginate, PaginationParams};
use crate::registry::{Entity, FieldDetail, ModelDescription, RegistryError};
use crate::response;
use crate::session::InspectSession;

const EXECUTE_GUIDANCE: &str =
    "Result too large. Aggregate or slice the data in the executed code, or use search_models with pagination";

const MODEL_INFO_GUIDANCE: &str =
    "Model description too large. Pass field_filter to narrow the fields returned";

/// MCP server for inspecting the containerized runtime.
#[derive(Clone)]
pub struct InspectServer {
    session: Arc<InspectSession>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCodeParams {
    #[schemars(
        description = "Python code run in the runtime shell with `env` in scope. Assign to `result` to return a value"
    )]
    pub code: String,

    #[schemars(description = "Timeout in seconds (default from configuration)")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchModelsParams {
    #[schemars(description = "Substring or `*` glob matched against model names and descriptions")]
    pub pattern: String,

    #[schemars(description = "auto (default), fs, registry or db")]
    pub mode: Option<String>,

    #[serde(flatten)]
    pub pagination: PaginationParams,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ModelInfoParams {
    #[schemars(description = "Technical model name, e.g. 'res.partner'")]
    pub model_name: String,

    #[schemars(description = "auto (default), fs, registry or db")]
    pub mode: Option<String>,

    #[schemars(description = "Only return fields whose name or attributes contain this text")]
    pub field_filter: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateModuleParams {
    #[schemars(description = "Technical module names to update or install")]
    pub modules: Vec<String>,

    #[schemars(description = "Install instead of update (default false)")]
    pub install: Option<bool>,

    #[schemars(description = "Timeout in seconds (default from configuration)")]
    pub timeout_seconds: Option<u64>,
}

#[tool_router]
impl InspectServer {
    pub fn new(session: InspectSession) -> Self {
        Self {
            session: Arc::new(session),
            tool_router: Self::tool_router(),
        }
    }

    /// Run Python code inside the runtime container.
    #[tool(
        description = "Execute Python code in the Odoo shell inside the runtime container. Assign to `result` to return JSON"
    )]
    async fn execute_code(
        &self,
        Parameters(params): Parameters<ExecuteCodeParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(code_len = params.code.len(), "Executing code");
        let timeout = params.timeout_seconds.map(Duration::from_secs);

        match self.session.manager().execute(&params.code, timeout).await {
            ExecutionResult::Success { value } => {
                let payload = response::success(json!({ "result": value }));
                Ok(ok(self.session.size_guard().fit_object(payload, EXECUTE_GUIDANCE)))
            }
            ExecutionResult::Failure(failure) => Ok(fail(&response::execution_failure(
                &failure,
                self.session.config().enhanced_errors,
            ))),
        }
    }

    /// Report container states.
    #[tool(description = "Report the state of each runtime container (odoo, web, script-runner, database)")]
    async fn container_status(&self) -> Result<CallToolResult, McpError> {
        let statuses = self.session.manager().container_status().await;
        let exec_role = self.session.config().exec_role;
        let healthy = statuses.iter().any(|s| s.role == exec_role && s.running);
        Ok(ok(response::success(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "execution_role": exec_role,
            "containers": statuses,
        }))))
    }

    /// Search models by name or description.
    #[tool(
        description = "Search models by name or description, paginated. Answers from the live registry when available, otherwise from addon sources"
    )]
    async fn search_models(
        &self,
        Parameters(params): Parameters<SearchModelsParams>,
    ) -> Result<CallToolResult, McpError> {
        let requested = match parse_mode(params.mode.as_deref()) {
            Ok(mode) => mode,
            Err(payload) => return Ok(fail(&payload)),
        };
        let decision = match self.session.decide(requested).await {
            Ok(decision) => decision,
            Err(e) => return Ok(fail(&response::mode_failure(&e))),
        };

        let (decision, entities) = match self.collect(requested, decision).await {
            Ok(found) => found,
            Err(e) => {
                return Ok(fail(&response::registry_failure(
                    &e,
                    self.session.config().enhanced_errors,
                )))
            }
        };

        let matched: Vec<Entity> = entities
            .into_iter()
            .filter(|entity| entity.matches(&params.pattern))
            .collect();
        let page = paginate(matched, &params.pagination, Entity::search_text);
        let page = self.session.size_guard().fit_page(page.into_json());

        info!(
            pattern = %params.pattern,
            mode_used = decision.mode_used(),
            total = page.pagination.total_count,
            returned = page.items.len(),
            "Searched models"
        );
        Ok(ok(response::success(json!({
            "pattern": params.pattern,
            "mode_used": decision.mode_used(),
            "data_quality": decision.data_quality(),
            "decision": decision,
            "models": page.items,
            "pagination": page.pagination,
        }))))
    }

    /// Describe one model and its fields.
    #[tool(description = "Describe a model: module, inheritance and fields. Use field_filter to narrow large models")]
    async fn model_info(
        &self,
        Parameters(params): Parameters<ModelInfoParams>,
    ) -> Result<CallToolResult, McpError> {
        let requested = match parse_mode(params.mode.as_deref()) {
            Ok(mode) => mode,
            Err(payload) => return Ok(fail(&payload)),
        };
        let decision = match self.session.decide(requested).await {
            Ok(decision) => decision,
            Err(e) => return Ok(fail(&response::mode_failure(&e))),
        };

        let (decision, described) = match self.describe(requested, decision, &params.model_name).await {
            Ok(described) => described,
            Err(e) => {
                return Ok(fail(&response::registry_failure(
                    &e,
                    self.session.config().enhanced_errors,
                )))
            }
        };
        let Some(mut description) = described else {
            return Ok(fail(&response::error(
                "ModelNotFound",
                format!(
                    "Model '{}' not found ({} strategy)",
                    params.model_name,
                    decision.mode_used()
                ),
            )));
        };

        let filter = params.field_filter.as_deref().map(str::trim).filter(|f| !f.is_empty());
        if let Some(filter) = filter {
            filter_fields(&mut description.fields, filter);
        }
        let mut model = match serde_json::to_value(&description) {
            Ok(model) => model,
            Err(e) => return Ok(fail(&response::error("MalformedOutput", e.to_string()))),
        };
        if let Some(filter) = filter {
            model["matching_field_count"] = json!(description.fields.len());
            model["field_filter_applied"] = json!(filter);
        }
        model["mode_used"] = json!(decision.mode_used());
        model["data_quality"] = json!(decision.data_quality());

        let payload = response::success(model);
        Ok(ok(self.session.size_guard().fit_object(payload, MODEL_INFO_GUIDANCE)))
    }

    /// Install or update modules with `--stop-after-init`.
    #[tool(description = "Install or update Odoo modules in the runtime container (long running)")]
    async fn update_module(
        &self,
        Parameters(params): Parameters<UpdateModuleParams>,
    ) -> Result<CallToolResult, McpError> {
        let modules: Vec<String> = params
            .modules
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if modules.is_empty() {
            return Err(McpError::invalid_params("No modules given", None));
        }
        if let Some(bad) = modules.iter().find(|m| !is_module_name(m)) {
            return Err(McpError::invalid_params(
                format!("Invalid module name: '{bad}'"),
                None,
            ));
        }

        let config = self.session.config();
        let install = params.install.unwrap_or(false);
        let command = config.module_command(&modules, install);
        let timeout = params
            .timeout_seconds
            .filter(|&secs| secs > 0)
            .map_or_else(|| config.timeouts.module_update(), Duration::from_secs);
        info!(modules = ?modules, install, timeout = ?timeout, "Updating modules");

        match self
            .session
            .manager()
            .run_command(config.exec_role, &command, Some(timeout))
            .await
        {
            Ok(outcome) => {
                let succeeded = outcome.exit_code == 0;
                if !succeeded {
                    warn!(exit_code = outcome.exit_code, "Module update failed");
                }
                let payload = json!({
                    "success": succeeded,
                    "action": if install { "install" } else { "update" },
                    "modules": modules,
                    "container": outcome.container,
                    "exit_code": outcome.exit_code,
                    "stdout": outcome.stdout,
                    "stderr": outcome.stderr,
                });
                let payload = self.session.size_guard().fit_object(
                    payload,
                    "Module output too large; check the container logs for the full output",
                );
                Ok(if succeeded { ok(payload) } else { fail(&payload) })
            }
            Err(failure) => Ok(fail(&response::execution_failure(
                &failure,
                config.enhanced_errors,
            ))),
        }
    }
}

impl InspectServer {
    /// All entities for `decision`; `auto` falls back to static analysis
    /// when the live registry fails after a successful probe.
    async fn collect(
        &self,
        requested: RequestedMode,
        decision: ModeDecision,
    ) -> Result<(ModeDecision, Vec<Entity>), RegistryError> {
        let registry = self.session.registry_for(decision.chosen).await;
        match registry.collect_verified().await {
            Ok(entities) => Ok((decision, entities)),
            Err(e) => match fallback_for(requested, decision) {
                Some(fallback) => {
                    warn!(error = %e, "Live registry failed, falling back to static analysis");
                    let registry = self.session.registry_for(fallback.chosen).await;
                    Ok((fallback, registry.collect_verified().await?))
                }
                None => Err(e),
            },
        }
    }

    /// Description of `name` for `decision`, with the same `auto` fallback
    /// as [`Self::collect`].
    async fn describe(
        &self,
        requested: RequestedMode,
        decision: ModeDecision,
        name: &str,
    ) -> Result<(ModeDecision, Option<ModelDescription>), RegistryError> {
        let registry = self.session.registry_for(decision.chosen).await;
        match registry.describe(name).await {
            Ok(described) => Ok((decision, described)),
            Err(e) => match fallback_for(requested, decision) {
                Some(fallback) => {
                    warn!(error = %e, model = %name, "Live describe failed, falling back to static analysis");
                    let registry = self.session.registry_for(fallback.chosen).await;
                    Ok((fallback, registry.describe(name).await?))
                }
                None => Err(e),
            },
        }
    }
}

#[tool_handler]
impl ServerHandler for InspectServer {
    fn get_info(&self) -> ServerInfo {
        let config = self.session.config();
        let target = config
            .container_prefix
            .as_deref()
            .unwrap_or("(no ODOO_PROJECT_NAME set)");

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "odoo-inspect-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Inspect a containerized Odoo runtime.\n\
                 Compose project: {target}, database: {}\n\
                 \n\
                 - execute_code: run Python with `env` in scope, assign `result`\n\
                 - search_models / model_info: mode auto|fs|registry|db\n\
                 - container_status, update_module\n\
                 \n\
                 Responses stay under {} estimated tokens; large pages report \
                 next_offset to resume from.",
                config.database.name, config.max_response_tokens
            )),
        }
    }
}

/// Serve the inspection server over stdio.
pub async fn serve_stdio(session: InspectSession) -> anyhow::Result<()> {
    let server = InspectServer::new(session);
    let session = Arc::clone(&server.session);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    let outcome = service.waiting().await;
    session.shutdown().await;
    outcome.map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

fn parse_mode(raw: Option<&str>) -> Result<RequestedMode, Value> {
    raw.map_or(Ok(RequestedMode::Auto), str::parse)
        .map_err(|e| response::mode_failure(&e))
}

/// Decision to retry with when a live answer fails; only `auto` falls back.
fn fallback_for(requested: RequestedMode, decision: ModeDecision) -> Option<ModeDecision> {
    (requested == RequestedMode::Auto && decision.chosen == Strategy::Live).then_some(ModeDecision {
        chosen: Strategy::Static,
        reason: DecisionReason::Fallback,
    })
}

/// Keep only fields whose name, type or attributes mention `filter`.
fn filter_fields(fields: &mut Vec<FieldDetail>, filter: &str) {
    let needle = filter.to_lowercase();
    fields.retain(|field| {
        field.name.to_lowercase().contains(&needle)
            || field.field_type.to_lowercase().contains(&needle)
            || Value::Object(field.attributes.clone())
                .to_string()
                .to_lowercase()
                .contains(&needle)
    });
}

fn is_module_name(name: &str) -> bool {
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ok(payload: Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(payload.to_string())])
}

fn fail(payload: &Value) -> CallToolResult {
    CallToolResult::error(vec![Content::text(payload.to_string())])
}
