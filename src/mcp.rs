//! MCP (Model Context Protocol) server for corpus-dedup.
//!
//! Exposes the `ops` layer as MCP tools so that AI assistants can dedup
//! small corpora and inspect MinHash/LSH behaviour over stdio JSON-RPC.
//!
//! Start with: `corpus-dedup --mcp`

use rmcp::{
    handler::server::tool::{ToolCallContext, ToolRouter},
    handler::server::wrapper::Parameters,
    model::*,
    service::RequestContext,
    tool, tool_router, ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::algo::select::RepresentativePolicy;
use crate::config::{DedupConfig, ExecutionMode, VerifyMode};
use crate::ops;
use crate::record::RecordFields;

// ── Parameter structs ───────────────────────────────────────────────────────
// `JsonSchema` is required by rmcp so that the tool's input schema is
// auto-generated for the AI client.

/// Optional overrides of the default dedup configuration.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ConfigParams {
    /// Tokens per shingle (default: 5).
    pub shingle_width: Option<usize>,
    /// MinHash signature length (default: 128).
    pub num_perm: Option<usize>,
    /// LSH bands; omit with `rows` to pick from the threshold.
    pub bands: Option<usize>,
    /// Rows per band.
    pub rows: Option<usize>,
    /// Jaccard similarity threshold (default: 0.8).
    pub threshold: Option<f64>,
    /// "first_seen" or "longest".
    pub policy: Option<String>,
    /// "none", "signature" or "shingles".
    pub verify: Option<String>,
    /// Hash-family seed (default: 42).
    pub seed: Option<u64>,
    /// Largest LSH bucket expanded into pairs (default: 1000).
    pub max_bucket_size: Option<usize>,
    /// Exact-duplicate digest width, 64 or 128 (default: 128).
    pub digest_bits: Option<u32>,
    /// Run the sharded execution mode with this many shards.
    pub shards: Option<usize>,
    /// Lowercase before comparing (default: true).
    pub lowercase: Option<bool>,
    /// Drop punctuation before comparing (default: false).
    pub strip_punctuation: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DedupParams {
    /// JSON array of records, each with an id and a text field.
    pub records: Vec<serde_json::Value>,
    /// Field holding the document id (default: "id").
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Field holding the document text (default: "text").
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(flatten)]
    pub config: ConfigParams,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DedupLinesParams {
    /// JSON array of records.
    pub records: Vec<serde_json::Value>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_text_field")]
    pub text_field: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SimilarityParams {
    /// First text.
    pub a: String,
    /// Second text.
    pub b: String,
    #[serde(flatten)]
    pub config: ConfigParams,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SignatureParams {
    /// Text to sketch.
    pub text: String,
    #[serde(flatten)]
    pub config: ConfigParams,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScurveParams {
    /// Bands (0 = choose from threshold).
    #[serde(default)]
    pub bands: usize,
    /// Rows per band (0 = choose from threshold).
    #[serde(default)]
    pub rows: usize,
    /// Signature length used when choosing automatically (default: 128).
    #[serde(default = "default_num_perm")]
    pub num_perm: usize,
    /// Target similarity (default: 0.8).
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Samples across [0, 1] (default: 20).
    #[serde(default = "default_steps")]
    pub steps: usize,
}

// ── Default helpers ─────────────────────────────────────────────────────────

fn default_id_field() -> String {
    "id".into()
}
fn default_text_field() -> String {
    "text".into()
}
fn default_num_perm() -> usize {
    128
}
fn default_threshold() -> f64 {
    0.8
}
fn default_steps() -> usize {
    20
}

// ── Shared helpers ──────────────────────────────────────────────────────────

fn json_text(v: &serde_json::Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
}

fn build_config(p: &ConfigParams) -> Result<DedupConfig, String> {
    let mut cfg = DedupConfig::default();
    if let Some(w) = p.shingle_width {
        cfg.shingle_width = w;
    }
    if let Some(k) = p.num_perm {
        cfg.num_hash_functions = k;
        cfg.num_bands = 0;
        cfg.rows_per_band = 0;
    }
    if let Some(b) = p.bands {
        cfg.num_bands = b;
    }
    if let Some(r) = p.rows {
        cfg.rows_per_band = r;
    }
    if let Some(t) = p.threshold {
        cfg.similarity_threshold = t;
    }
    if let Some(policy) = &p.policy {
        cfg.representative_policy = RepresentativePolicy::from_str(policy)
            .ok_or_else(|| format!("Unknown policy '{policy}'. Use: first_seen, longest"))?;
    }
    if let Some(v) = &p.verify {
        cfg.verify = VerifyMode::from_str(v)
            .ok_or_else(|| format!("Unknown verify mode '{v}'. Use: none, signature, shingles"))?;
    }
    if let Some(s) = p.seed {
        cfg.random_seed = s;
    }
    if let Some(m) = p.max_bucket_size {
        cfg.max_bucket_size = m;
    }
    if let Some(bits) = p.digest_bits {
        cfg.digest_bits = bits;
    }
    if let Some(n) = p.shards {
        cfg.execution = ExecutionMode::Sharded { shards: n };
    }
    if let Some(l) = p.lowercase {
        cfg.normalize.lowercase = l;
    }
    if let Some(sp) = p.strip_punctuation {
        cfg.normalize.strip_punctuation = sp;
    }
    Ok(cfg)
}

// ── MCP Server ──────────────────────────────────────────────────────────────

/// The MCP server struct. Holds only the auto-generated tool router.
#[derive(Clone)]
pub struct DedupMcp {
    #[allow(dead_code)] // accessed at runtime by the #[tool_router] macro
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl DedupMcp {
    pub fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    // ── dedup ───────────────────────────────────────────────────────────

    #[tool(
        name = "dedup",
        description = "Remove exact and near-duplicate documents from JSON records using MinHash signatures, LSH banding and union-find clustering. Returns the surviving records in input order, removal stats, and the near-duplicate clusters with their chosen representative."
    )]
    async fn dedup(&self, params: Parameters<DedupParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let config = build_config(&p.config).map_err(|e| McpError::invalid_params(e, None))?;
        let result = tokio::task::spawn_blocking(move || {
            let fields = RecordFields {
                id: p.id_field,
                text: p.text_field,
            };
            ops::op_dedup(&p.records, &fields, config, None)
        })
        .await
        .map_err(|e| McpError::internal_error(format!("task join error: {e}"), None))?
        .map_err(|e| McpError::invalid_params(e, None))?;
        Ok(CallToolResult::success(vec![Content::text(json_text(
            &result,
        ))]))
    }

    // ── dedup_lines ─────────────────────────────────────────────────────

    #[tool(
        name = "dedup_lines",
        description = "Drop every non-blank line that occurs more than once across all records (boilerplate such as navigation or cookie banners). Returns the rewritten records and line counts."
    )]
    async fn dedup_lines(
        &self,
        params: Parameters<DedupLinesParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let result = tokio::task::spawn_blocking(move || {
            let fields = RecordFields {
                id: p.id_field,
                text: p.text_field,
            };
            ops::op_dedup_lines(&p.records, &fields)
        })
        .await
        .map_err(|e| McpError::internal_error(format!("task join error: {e}"), None))?
        .map_err(|e| McpError::internal_error(e, None))?;
        Ok(CallToolResult::success(vec![Content::text(json_text(
            &result,
        ))]))
    }

    // ── similarity ──────────────────────────────────────────────────────

    #[tool(
        name = "similarity",
        description = "Compare two texts: exact shingle-set Jaccard, the MinHash estimate, whether LSH would pair them, and the banding scheme's collision probability at their similarity."
    )]
    async fn similarity(
        &self,
        params: Parameters<SimilarityParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let config = build_config(&p.config).map_err(|e| McpError::invalid_params(e, None))?;
        let result = ops::op_similarity(&p.a, &p.b, config)
            .map_err(|e| McpError::invalid_params(e, None))?;
        Ok(CallToolResult::success(vec![Content::text(json_text(
            &result,
        ))]))
    }

    // ── signature ───────────────────────────────────────────────────────

    #[tool(
        name = "signature",
        description = "Compute the MinHash signature and LSH band keys of one text."
    )]
    async fn signature(
        &self,
        params: Parameters<SignatureParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let config = build_config(&p.config).map_err(|e| McpError::invalid_params(e, None))?;
        let result =
            ops::op_signature(&p.text, config).map_err(|e| McpError::invalid_params(e, None))?;
        Ok(CallToolResult::success(vec![Content::text(json_text(
            &result,
        ))]))
    }

    // ── scurve ──────────────────────────────────────────────────────────

    #[tool(
        name = "scurve",
        description = "Tabulate the LSH S-curve P(candidate | similarity) for a banding scheme. With bands/rows omitted, picks the split of num_perm that best separates pairs around the threshold."
    )]
    async fn scurve(&self, params: Parameters<ScurveParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let result = ops::op_scurve(p.bands, p.rows, p.num_perm, p.threshold, p.steps)
            .map_err(|e| McpError::invalid_params(e, None))?;
        Ok(CallToolResult::success(vec![Content::text(json_text(
            &result,
        ))]))
    }
}

impl Default for DedupMcp {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandler for DedupMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Corpus deduplication engine. Tools: dedup, dedup_lines, similarity, \
                 signature, scurve. Pass JSON records with id/text fields for bulk \
                 operations or plain strings for similarity/signature."
                    .into(),
            ),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "corpus-dedup".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: Some("Corpus Dedup".into()),
                description: Some(
                    "Exact and near-duplicate removal for text corpora".into(),
                ),
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
            meta: Default::default(),
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let tool_context = ToolCallContext::new(self, request, context);
        async move { self.tool_router.call(tool_context).await }
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tool_router.get(name).cloned()
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Start the MCP server on stdio. Called from `cli.rs` when `--mcp` is passed.
pub async fn serve_stdio() -> Result<(), Box<dyn std::error::Error>> {
    let server = DedupMcp::new();
    let transport = rmcp::transport::io::stdio();
    let service = server.serve(transport).await.inspect_err(|e| {
        tracing::error!(error = %e, "MCP serve error");
    })?;
    service.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_params_override_defaults() {
        let cfg = build_config(&ConfigParams {
            shingle_width: Some(3),
            policy: Some("longest".into()),
            verify: Some("signature".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.shingle_width, 3);
        assert_eq!(cfg.representative_policy, RepresentativePolicy::Longest);
        assert_eq!(cfg.verify, VerifyMode::Signature);
        assert_eq!(cfg.num_hash_functions, 128);
    }

    #[test]
    fn config_params_cover_bucket_digest_shards_and_normalization() {
        let params: ConfigParams = serde_json::from_value(serde_json::json!({
            "max_bucket_size": 50,
            "digest_bits": 64,
            "shards": 4,
            "lowercase": false,
            "strip_punctuation": true
        }))
        .unwrap();
        let cfg = build_config(&params).unwrap();
        assert_eq!(cfg.max_bucket_size, 50);
        assert_eq!(cfg.digest_bits, 64);
        assert_eq!(cfg.execution, ExecutionMode::Sharded { shards: 4 });
        assert!(!cfg.normalize.lowercase);
        assert!(cfg.normalize.strip_punctuation);
        assert!(cfg.resolved().is_ok());
    }

    #[test]
    fn num_perm_alone_switches_to_auto_bands() {
        let cfg = build_config(&ConfigParams {
            num_perm: Some(64),
            ..Default::default()
        })
        .unwrap()
        .resolved()
        .unwrap();
        assert_eq!(cfg.num_bands * cfg.rows_per_band, 64);
    }

    #[test]
    fn bad_policy_is_rejected() {
        let err = build_config(&ConfigParams {
            policy: Some("shortest".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.contains("shortest"));
    }

    #[test]
    fn tools_are_registered() {
        let server = DedupMcp::new();
        for name in ["dedup", "dedup_lines", "similarity", "signature", "scurve"] {
            assert!(server.get_tool(name).is_some(), "missing tool {name}");
        }
    }
}
