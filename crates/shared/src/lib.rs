use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod hashing;

/// Manifest schema version. Bump on any breaking change to
/// [`ServerManifest`]: the manifest JSON is the stable interface between
/// the compiler and the runtime registry, possibly across process
/// generations.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Error taxonomy for the whole MFP pipeline. Explicit serde tagging so
/// errors serialize consistently across the tool boundary.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum MfpError {
    #[error("Swagger parse error: {0}")]
    Parse(String),
    #[error("Compile error: {0}")]
    Compile(String),
    #[error("Generated code failed lint: {message}")]
    Lint { message: String, output: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Security violation ({kind}): {pattern}")]
    Security { kind: String, pattern: String },
    #[error("Domain '{host}' is not in the allowed domains list")]
    Policy { host: String },
    #[error("Execution timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("Sandbox execution failed: {message}")]
    Runtime {
        message: String,
        stderr: String,
        exit_code: i64,
    },
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Server '{0}' not found")]
    ServerNotFound(String),
    #[error("Function '{function}' not found in server '{server}'")]
    FunctionNotFound { server: String, function: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MfpError {
    /// Wire-level error category exposed to MCP clients.
    ///
    /// The category set is closed; policy failures map to `security` since
    /// the set does not distinguish them.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Security { .. } | Self::Policy { .. } => "security",
            Self::Lint { .. } => "lint",
            Self::Timeout { .. } => "timeout",
            Self::Runtime { .. } => "runtime",
            Self::ServerNotFound(_) => "server_not_found",
            Self::FunctionNotFound { .. } => "function_not_found",
            _ => "internal",
        }
    }
}

pub type MfpResult<T> = std::result::Result<T, MfpError>;

// ============================================================
// Swagger source configuration
// ============================================================

/// One entry of the swagger sources file. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwaggerSource {
    pub name: String,
    /// HTTP(S) URL or local filesystem path of the swagger document.
    pub swagger_url: String,
    pub base_url: String,
    /// Auth header value; may contain `${VAR}` references resolved by the
    /// vault at injection time, never earlier.
    #[serde(default)]
    pub auth_header: String,
    #[serde(default)]
    pub is_read_only: bool,
}

// ============================================================
// Normalized API model
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Parse a swagger path-item key. Returns `None` for keys that are not
    /// supported operations (`head`, `options`, `parameters`, extensions).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "get" => Some(Self::Get),
            "post" => Some(Self::Post),
            "put" => Some(Self::Put),
            "patch" => Some(Self::Patch),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// True for methods that mutate server state. Read-only sources drop
    /// these at parse time so they can never reach codegen.
    #[must_use]
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

/// A single endpoint parameter. `name` is the wire name; `safe_name` is the
/// sanitized identifier used in generated signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub safe_name: String,
    pub location: ParamLocation,
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

/// A field of an endpoint's response schema. Nesting is capped at one level;
/// anything deeper is flattened or omitted by the parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseField {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Vec<ResponseField>>,
}

/// Normalized representation of one API operation.
///
/// Invariant: `parameters` stores required parameters before optional ones,
/// so every ordered emission downstream inherits the ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub operation_id: String,
    pub method: HttpMethod,
    pub path: String,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub response_fields: Vec<ResponseField>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Normalized representation of a complete API server.
///
/// Invariant: when `is_read_only`, no endpoint has a mutating method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub description: String,
    pub base_url: String,
    pub is_read_only: bool,
    pub endpoints: Vec<EndpointSpec>,
    /// SHA-256 of the raw swagger document bytes, lowercase hex.
    pub source_hash: String,
}

// ============================================================
// Manifest (compiler → registry interface)
// ============================================================

/// Manifest entry for one compiled function. The source excerpt is not
/// persisted here; the registry slices it lazily from the generated library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub signature: String,
    pub method: HttpMethod,
    pub path: String,
    pub summary: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub returns: Vec<ResponseField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerManifest {
    pub schema_version: u32,
    pub server_name: String,
    pub description: String,
    pub base_url: String,
    pub is_read_only: bool,
    /// RFC 3339 timestamp of the compile that produced this manifest.
    pub generated_at: String,
    pub swagger_hash: String,
    pub endpoint_count: usize,
    #[serde(default)]
    pub functions: Vec<FunctionSpec>,
}

/// Compact per-server summary returned by `list_servers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub description: String,
    pub functions: Vec<String>,
    pub function_summaries: HashMap<String, String>,
}

/// Full function record returned by `get_function`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub server_name: String,
    pub function_name: String,
    pub signature: String,
    pub method: HttpMethod,
    pub path: String,
    pub summary: String,
    pub parameters: Vec<ParamSpec>,
    pub returns: Vec<ResponseField>,
    pub source_excerpt: String,
}

// ============================================================
// Execution
// ============================================================

/// Outcome of one `execute_code` call. The executor never raises: every
/// failure path lands here with `success=false` and a populated `error_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_id: Option<String>,
}

impl ExecutionResult {
    /// Build a failure result from an error. The `Display` text of every
    /// `MfpError` variant is operator-safe: it names kinds and symbols but
    /// never embeds submitted code or credential values.
    #[must_use]
    pub fn failure(err: &MfpError, duration_ms: u64) -> Self {
        let stderr = match err {
            MfpError::Runtime { stderr, .. } => stderr.clone(),
            _ => String::new(),
        };
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            error_type: Some(err.error_type().to_string()),
            stdout: String::new(),
            stderr,
            duration_ms,
            cache_id: None,
        }
    }
}

// ============================================================
// Cache
// ============================================================

/// A cached snippet. `id` is `SHA256(normalize(code))`, so whitespace
/// variants of the same code share an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub code: String,
    pub description: String,
    pub servers_used: Vec<String>,
    pub swagger_hash: String,
    pub result_summary: String,
    pub created_at: f64,
    pub last_used_at: f64,
    pub use_count: i64,
    pub ttl_seconds: i64,
}

/// Listing projection of a cache entry (no code body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSummary {
    pub id: String,
    pub description: String,
    pub servers_used: Vec<String>,
    pub result_summary: String,
    pub use_count: i64,
    pub created_at: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse_accepts_supported_verbs() {
        assert_eq!(HttpMethod::parse("get"), Some(HttpMethod::Get));
        assert_eq!(HttpMethod::parse("POST"), Some(HttpMethod::Post));
        assert_eq!(HttpMethod::parse("Delete"), Some(HttpMethod::Delete));
    }

    #[test]
    fn test_method_parse_rejects_non_operations() {
        assert_eq!(HttpMethod::parse("head"), None);
        assert_eq!(HttpMethod::parse("options"), None);
        assert_eq!(HttpMethod::parse("parameters"), None);
        assert_eq!(HttpMethod::parse("x-amazon-apigateway"), None);
    }

    #[test]
    fn test_only_get_is_non_mutating() {
        assert!(!HttpMethod::Get.is_mutating());
        assert!(HttpMethod::Post.is_mutating());
        assert!(HttpMethod::Put.is_mutating());
        assert!(HttpMethod::Patch.is_mutating());
        assert!(HttpMethod::Delete.is_mutating());
    }

    #[test]
    fn test_error_type_mapping() {
        let sec = MfpError::Security {
            kind: "blocked_import".into(),
            pattern: "os".into(),
        };
        assert_eq!(sec.error_type(), "security");

        let pol = MfpError::Policy {
            host: "evil.example.com".into(),
        };
        assert_eq!(pol.error_type(), "security");

        assert_eq!(MfpError::Timeout { seconds: 30 }.error_type(), "timeout");
        assert_eq!(MfpError::Internal("x".into()).error_type(), "internal");
        assert_eq!(MfpError::Cache("x".into()).error_type(), "internal");
    }

    #[test]
    fn test_failure_result_carries_runtime_stderr() {
        let err = MfpError::Runtime {
            message: "exit 1".into(),
            stderr: "Traceback".into(),
            exit_code: 1,
        };
        let result = ExecutionResult::failure(&err, 12);
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("runtime"));
        assert_eq!(result.stderr, "Traceback");
        assert_eq!(result.duration_ms, 12);
        assert!(result.cache_id.is_none());
    }

    #[test]
    fn test_manifest_round_trips_through_json() {
        let manifest = ServerManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            server_name: "weather".into(),
            description: "Weather API".into(),
            base_url: "https://api.weather.example.com/v1".into(),
            is_read_only: true,
            generated_at: "2026-01-01T00:00:00Z".into(),
            swagger_hash: "ab".repeat(32),
            endpoint_count: 1,
            functions: vec![FunctionSpec {
                name: "get_current_weather".into(),
                signature: "get_current_weather(city: str)".into(),
                method: HttpMethod::Get,
                path: "/current".into(),
                summary: "Current conditions".into(),
                parameters: vec![],
                returns: vec![],
            }],
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let back: ServerManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.server_name, manifest.server_name);
        assert_eq!(back.endpoint_count, 1);
        assert_eq!(back.functions.len(), 1);
        assert_eq!(back.functions[0].name, "get_current_weather");
    }
}
