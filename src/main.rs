use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::GraphError;
use crate::graph::{EntityInput, ObservationAddition, ObservationDeletion, Relation};
use crate::manager::KnowledgeGraphManager;
use crate::storage::JsonFileStorage;

mod error;
mod graph;
mod logging;
mod manager;
mod storage;

use logging::{TransportMode, init_logging};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Project directory; the graph is stored under its .kiro subdirectory
    /// (defaults to the home directory).
    #[arg(value_name = "DIR")]
    project_dir: Option<PathBuf>,

    /// Explicit path of the graph JSON file (overrides the project directory).
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    storage_file: Option<PathBuf>,

    /// Enable streamable HTTP mode (default: stdio)
    #[arg(short = 's', long = "stream")]
    stream_mode: bool,

    /// HTTP port for stream mode
    #[arg(short = 'p', long, default_value = "8000")]
    port: u16,

    /// Bind address for stream mode
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind: String,

    /// Enable file logging. Optionally specify log file name (default: knowledge-graph-mcp-rs.log)
    #[arg(short = 'l', long, value_name = "FILE", num_args = 0..=1, default_missing_value = "knowledge-graph-mcp-rs.log")]
    log: Option<String>,
}

#[derive(Clone)]
struct KnowledgeGraphServer {
    manager: Arc<KnowledgeGraphManager>,
    tool_router: ToolRouter<Self>,
}

impl KnowledgeGraphServer {
    fn new(manager: Arc<KnowledgeGraphManager>) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "knowledge-graph-mcp-rs".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct CreateEntitiesArgs {
    /// Entities to create
    entities: Vec<EntityInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct CreateRelationsArgs {
    /// Relations to create (in active voice)
    relations: Vec<Relation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct AddObservationsArgs {
    /// Observations to add to existing entities
    observations: Vec<ObservationAddition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct DeleteEntitiesArgs {
    /// Names of entities to delete
    #[serde(rename = "entityNames")]
    entity_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct DeleteObservationsArgs {
    /// Observation deletions, per entity
    deletions: Vec<ObservationDeletion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct DeleteRelationsArgs {
    /// Relations to delete (exact from/to/relationType matches)
    relations: Vec<Relation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct SearchNodesArgs {
    /// Search query; whitespace-separated tokens are ORed together
    query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct OpenNodesArgs {
    /// Names of entities to retrieve
    names: Vec<String>,
}

#[tool_router]
impl KnowledgeGraphServer {
    #[tool(
        name = "create_entities",
        description = "Create new entities in the knowledge graph"
    )]
    async fn create_entities(
        &self,
        Parameters(CreateEntitiesArgs { entities }): Parameters<CreateEntitiesArgs>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&entities, "entities")?;
        graph_result(self.manager.create_entities(entities).await)
    }

    #[tool(
        name = "create_relations",
        description = "Create relations between entities in the knowledge graph"
    )]
    async fn create_relations(
        &self,
        Parameters(CreateRelationsArgs { relations }): Parameters<CreateRelationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&relations, "relations")?;
        graph_result(self.manager.create_relations(relations).await)
    }

    #[tool(
        name = "add_observations",
        description = "Add observations to existing entities"
    )]
    async fn add_observations(
        &self,
        Parameters(AddObservationsArgs { observations }): Parameters<AddObservationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&observations, "observations")?;
        graph_result(self.manager.add_observations(observations).await)
    }

    #[tool(
        name = "delete_entities",
        description = "Delete entities and their associated relations from the knowledge graph"
    )]
    async fn delete_entities(
        &self,
        Parameters(DeleteEntitiesArgs { entity_names }): Parameters<DeleteEntitiesArgs>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&entity_names, "entityNames")?;
        graph_result(self.manager.delete_entities(&entity_names).await)
    }

    #[tool(
        name = "delete_observations",
        description = "Delete specific observations from entities"
    )]
    async fn delete_observations(
        &self,
        Parameters(DeleteObservationsArgs { deletions }): Parameters<DeleteObservationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&deletions, "deletions")?;
        graph_result(self.manager.delete_observations(&deletions).await)
    }

    #[tool(
        name = "delete_relations",
        description = "Delete specific relations from the knowledge graph"
    )]
    async fn delete_relations(
        &self,
        Parameters(DeleteRelationsArgs { relations }): Parameters<DeleteRelationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&relations, "relations")?;
        graph_result(self.manager.delete_relations(&relations).await)
    }

    #[tool(
        name = "read_graph",
        description = "Read the entire knowledge graph with all entities and relations"
    )]
    async fn read_graph(&self) -> Result<CallToolResult, McpError> {
        success_result(&self.manager.read_graph())
    }

    #[tool(
        name = "search_nodes",
        description = "Search for entities by name, type, or observations"
    )]
    async fn search_nodes(
        &self,
        Parameters(SearchNodesArgs { query }): Parameters<SearchNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        success_result(&self.manager.search_nodes(&query))
    }

    #[tool(
        name = "open_nodes",
        description = "Open and retrieve specific entities by their names"
    )]
    async fn open_nodes(
        &self,
        Parameters(OpenNodesArgs { names }): Parameters<OpenNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&names, "names")?;
        graph_result(self.manager.open_nodes(&names))
    }
}

#[tool_handler]
impl ServerHandler for KnowledgeGraphServer {
    fn get_info(&self) -> ServerInfo {
        self.server_info()
    }
}

fn require_non_empty<T>(items: &[T], what: &'static str) -> Result<(), McpError> {
    if items.is_empty() {
        return Err(McpError::invalid_params(
            format!("{what} must not be empty"),
            None,
        ));
    }
    Ok(())
}

fn graph_result<T: Serialize>(result: Result<T, GraphError>) -> Result<CallToolResult, McpError> {
    match result {
        Ok(data) => success_result(&data),
        Err(err) => Ok(error_result(&err)),
    }
}

fn success_result<T: Serialize>(data: &T) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(data).map_err(|e| {
        McpError::internal_error(
            "Failed to serialize result",
            Some(json!({ "error": e.to_string() })),
        )
    })?;
    Ok(CallToolResult {
        content: vec![Content::text(text)],
        structured_content: Some(json!({ "success": true, "data": data })),
        is_error: Some(false),
        meta: None,
    })
}

fn error_result(err: &GraphError) -> CallToolResult {
    let message = err.to_string();
    CallToolResult {
        content: vec![Content::text(message.clone())],
        structured_content: Some(json!({ "success": false, "error": message })),
        is_error: Some(true),
        meta: None,
    }
}

/// Run server in stdio mode (default)
async fn run_stdio_mode(server: KnowledgeGraphServer) -> anyhow::Result<()> {
    let transport = stdio();
    let svc = server.serve(transport).await?;
    svc.waiting().await?;
    Ok(())
}

/// Run server in streamable HTTP mode
async fn run_stream_mode(
    server: KnowledgeGraphServer,
    bind: &str,
    port: u16,
) -> anyhow::Result<()> {
    use rmcp::transport::StreamableHttpService;
    use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;

    let addr = format!("{}:{}", bind, port);
    tracing::info!("Starting MCP HTTP server on http://{}/mcp", addr);

    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = axum::Router::new()
        .nest_service("/mcp", service)
        .route("/health", axum::routing::get(|| async { "OK" }));

    let tcp_listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mode = if args.stream_mode {
        TransportMode::Stream
    } else {
        TransportMode::Stdio
    };

    // stdio mode must not touch stderr: any output during the handshake
    // shows up as "connection closed" in MCP clients.
    init_logging(mode, args.log)?;

    let storage = match args.storage_file {
        Some(path) => JsonFileStorage::at_path(path),
        None => JsonFileStorage::new(args.project_dir.as_deref()),
    };
    tracing::info!("Knowledge graph file: {}", storage.path().display());

    let manager = Arc::new(KnowledgeGraphManager::new(Arc::new(storage)));
    manager.load_from_storage().await?;

    let server = KnowledgeGraphServer::new(manager);
    match mode {
        TransportMode::Stdio => run_stdio_mode(server).await,
        TransportMode::Stream => run_stream_mode(server, &args.bind, args.port).await,
    }
}
