//! Runtime registry: loads compiled server manifests into immutable
//! indexes for the discovery tools. Reload is a full reconstruction; after
//! `load` the registry is never mutated, so concurrent readers need no
//! locking (the lazy source-excerpt cache keeps its own).

use mfp_shared::{
    FunctionInfo, FunctionSpec, MfpError, MfpResult, ServerInfo, ServerManifest,
    MANIFEST_SCHEMA_VERSION,
};
use mfp_shared::hashing::combine_hashes;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug)]
pub struct Registry {
    compiled_dir: PathBuf,
    servers: HashMap<String, ServerManifest>,
    source_cache: Mutex<HashMap<String, String>>,
}

impl Registry {
    /// Scan the compiled directory and index every manifest. A missing
    /// directory yields an empty registry; an unreadable manifest is logged
    /// and skipped; two manifests claiming the same server name are a
    /// configuration error.
    pub fn load(compiled_dir: &Path) -> MfpResult<Self> {
        let mut servers: HashMap<String, ServerManifest> = HashMap::new();
        let mut manifest_paths: HashMap<String, PathBuf> = HashMap::new();

        if !compiled_dir.exists() {
            tracing::warn!(path = %compiled_dir.display(), "compiled directory not found");
            return Ok(Self {
                compiled_dir: compiled_dir.to_path_buf(),
                servers,
                source_cache: Mutex::new(HashMap::new()),
            });
        }

        let entries = std::fs::read_dir(compiled_dir).map_err(|e| {
            MfpError::Config(format!(
                "Failed to scan compiled directory {}: {e}",
                compiled_dir.display()
            ))
        })?;

        for entry in entries.flatten() {
            let manifest_path = entry.path().join("manifest.json");
            if !manifest_path.is_file() {
                continue;
            }

            let manifest = match load_manifest(&manifest_path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::error!(path = %manifest_path.display(), error = %e, "manifest load failed");
                    continue;
                }
            };

            if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
                tracing::warn!(
                    path = %manifest_path.display(),
                    found = manifest.schema_version,
                    expected = MANIFEST_SCHEMA_VERSION,
                    "manifest schema version mismatch, skipped"
                );
                continue;
            }

            let name = manifest.server_name.clone();
            if let Some(previous) = manifest_paths.get(&name) {
                return Err(MfpError::Config(format!(
                    "Duplicate server name '{name}' in {} and {}",
                    previous.display(),
                    manifest_path.display()
                )));
            }
            manifest_paths.insert(name.clone(), manifest_path);
            servers.insert(name, manifest);
        }

        tracing::info!(
            servers = servers.len(),
            total_functions = servers.values().map(|m| m.functions.len()).sum::<usize>(),
            "registry loaded"
        );

        Ok(Self {
            compiled_dir: compiled_dir.to_path_buf(),
            servers,
            source_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Snapshot of registered server names, handed to the AST guard so it
    /// can admit `from {server}.functions import …` only for real servers.
    #[must_use]
    pub fn server_names(&self) -> HashSet<String> {
        self.servers.keys().cloned().collect()
    }

    #[must_use]
    pub fn list_servers(&self) -> Vec<ServerInfo> {
        let mut infos: Vec<ServerInfo> = self
            .servers
            .values()
            .map(|manifest| ServerInfo {
                name: manifest.server_name.clone(),
                description: manifest.description.clone(),
                functions: manifest.functions.iter().map(|f| f.name.clone()).collect(),
                function_summaries: manifest
                    .functions
                    .iter()
                    .map(|f| (f.name.clone(), f.summary.clone()))
                    .collect(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn get_function(&self, server_name: &str, function_name: &str) -> MfpResult<FunctionInfo> {
        let manifest = self.manifest(server_name)?;
        let function = manifest
            .functions
            .iter()
            .find(|f| f.name == function_name)
            .ok_or_else(|| MfpError::FunctionNotFound {
                server: server_name.to_string(),
                function: function_name.to_string(),
            })?;

        Ok(FunctionInfo {
            server_name: server_name.to_string(),
            function_name: function.name.clone(),
            signature: function.signature.clone(),
            method: function.method,
            path: function.path.clone(),
            summary: function.summary.clone(),
            parameters: function.parameters.clone(),
            returns: function.returns.clone(),
            source_excerpt: self.function_source(server_name, function),
        })
    }

    pub fn swagger_hash(&self, server_name: &str) -> MfpResult<String> {
        Ok(self.manifest(server_name)?.swagger_hash.clone())
    }

    /// Combined swagger hash over the servers a snippet uses. Unknown names
    /// are skipped; no known server at all degrades to a fixed marker.
    #[must_use]
    pub fn combined_swagger_hash(&self, server_names: &[String]) -> String {
        if server_names.is_empty() {
            return "no-servers".to_string();
        }
        let hashes: Vec<String> = server_names
            .iter()
            .filter_map(|name| self.servers.get(name).map(|m| m.swagger_hash.clone()))
            .collect();
        if hashes.is_empty() {
            return "unknown".to_string();
        }
        combine_hashes(&hashes)
    }

    fn manifest(&self, server_name: &str) -> MfpResult<&ServerManifest> {
        self.servers
            .get(server_name)
            .ok_or_else(|| MfpError::ServerNotFound(server_name.to_string()))
    }

    /// Source excerpt for one function, sliced syntactically out of the
    /// generated library. Slicing failure falls back to the whole file; a
    /// missing file yields a placeholder. Cached per function.
    fn function_source(&self, server_name: &str, function: &FunctionSpec) -> String {
        let cache_key = format!("{server_name}.{}", function.name);
        {
            let cache = self
                .source_cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(cached) = cache.get(&cache_key) {
                return cached.clone();
            }
        }

        let functions_file = self.compiled_dir.join(server_name).join("functions.py");
        let excerpt = match std::fs::read_to_string(&functions_file) {
            Ok(source) => extract_function(&source, &function.name),
            Err(_) => format!("# Source not found for {server_name}.{}", function.name),
        };

        self.source_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(cache_key, excerpt.clone());
        excerpt
    }
}

fn load_manifest(path: &Path) -> MfpResult<ServerManifest> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| MfpError::Config(format!("unreadable manifest: {e}")))?;
    serde_json::from_str(&raw).map_err(|e| MfpError::Config(format!("invalid manifest: {e}")))
}

/// Slice a single top-level `def` block out of a Python module: from its
/// `def` line up to the next column-zero statement. Returns the full source
/// when the function cannot be located.
fn extract_function(source: &str, function_name: &str) -> String {
    let needle = format!("def {function_name}(");
    let lines: Vec<&str> = source.lines().collect();

    let Some(start) = lines.iter().position(|line| line.starts_with(&needle)) else {
        return source.to_string();
    };

    let mut end = lines.len();
    for (offset, line) in lines[start + 1..].iter().enumerate() {
        let is_top_level = !line.is_empty() && !line.starts_with(' ') && !line.starts_with('\t');
        if is_top_level {
            end = start + 1 + offset;
            break;
        }
    }

    lines[start..end].join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfp_shared::HttpMethod;

    fn sample_manifest(server_name: &str) -> ServerManifest {
        ServerManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            server_name: server_name.to_string(),
            description: format!("{server_name} API"),
            base_url: format!("https://{server_name}.example.com"),
            is_read_only: false,
            generated_at: "2026-01-01T00:00:00Z".into(),
            swagger_hash: mfp_shared::hashing::hash_content(server_name),
            endpoint_count: 1,
            functions: vec![FunctionSpec {
                name: "get_item".into(),
                signature: "get_item(item_id: int)".into(),
                method: HttpMethod::Get,
                path: "/items/{item_id}".into(),
                summary: "Fetch one item".into(),
                parameters: vec![],
                returns: vec![],
            }],
        }
    }

    fn write_server(dir: &Path, manifest: &ServerManifest, dir_name: &str, functions_py: &str) {
        let server_dir = dir.join(dir_name);
        std::fs::create_dir_all(&server_dir).unwrap();
        std::fs::write(
            server_dir.join("manifest.json"),
            serde_json::to_string_pretty(manifest).unwrap(),
        )
        .unwrap();
        std::fs::write(server_dir.join("functions.py"), functions_py).unwrap();
    }

    const FUNCTIONS_PY: &str = "\
\"\"\"module doc\"\"\"

def _request(method, path):
    return None


def get_item(item_id: int) -> Any:
    \"\"\"Fetch one item.\"\"\"
    path = f\"/items/{item_id}\"
    return _request(\"GET\", path)


def other_fn():
    return 2
";

    #[test]
    fn test_load_indexes_servers_and_functions() {
        let dir = tempfile::tempdir().unwrap();
        write_server(dir.path(), &sample_manifest("weather"), "weather", FUNCTIONS_PY);
        write_server(dir.path(), &sample_manifest("hotel"), "hotel", FUNCTIONS_PY);

        let registry = Registry::load(dir.path()).unwrap();
        assert_eq!(registry.server_names().len(), 2);

        let infos = registry.list_servers();
        assert_eq!(infos.len(), 2);
        // Deterministic name ordering.
        assert_eq!(infos[0].name, "hotel");
        assert_eq!(infos[1].name, "weather");
        assert_eq!(infos[0].functions, vec!["get_item"]);
        assert_eq!(
            infos[0].function_summaries.get("get_item").map(String::as_str),
            Some("Fetch one item")
        );
    }

    #[test]
    fn test_missing_compiled_dir_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(&dir.path().join("nope")).unwrap();
        assert!(registry.list_servers().is_empty());
    }

    #[test]
    fn test_duplicate_server_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_server(dir.path(), &sample_manifest("weather"), "weather", FUNCTIONS_PY);
        write_server(dir.path(), &sample_manifest("weather"), "weather_copy", FUNCTIONS_PY);

        let err = Registry::load(dir.path()).unwrap_err();
        assert!(matches!(err, MfpError::Config(_)));
    }

    #[test]
    fn test_corrupt_manifest_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_server(dir.path(), &sample_manifest("weather"), "weather", FUNCTIONS_PY);
        let broken = dir.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("manifest.json"), "{not json").unwrap();

        let registry = Registry::load(dir.path()).unwrap();
        assert_eq!(registry.server_names().len(), 1);
    }

    #[test]
    fn test_schema_version_mismatch_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = sample_manifest("future");
        manifest.schema_version = MANIFEST_SCHEMA_VERSION + 1;
        write_server(dir.path(), &manifest, "future", FUNCTIONS_PY);

        let registry = Registry::load(dir.path()).unwrap();
        assert!(registry.server_names().is_empty());
    }

    #[test]
    fn test_get_function_slices_source_excerpt() {
        let dir = tempfile::tempdir().unwrap();
        write_server(dir.path(), &sample_manifest("weather"), "weather", FUNCTIONS_PY);

        let registry = Registry::load(dir.path()).unwrap();
        let info = registry.get_function("weather", "get_item").unwrap();

        assert!(info.source_excerpt.starts_with("def get_item(item_id: int)"));
        assert!(info.source_excerpt.contains("return _request"));
        assert!(!info.source_excerpt.contains("other_fn"));
        assert!(!info.source_excerpt.contains("module doc"));
    }

    #[test]
    fn test_excerpt_falls_back_to_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = sample_manifest("weather");
        manifest.functions[0].name = "not_in_source".into();
        write_server(dir.path(), &manifest, "weather", FUNCTIONS_PY);

        let registry = Registry::load(dir.path()).unwrap();
        let info = registry.get_function("weather", "not_in_source").unwrap();
        assert!(info.source_excerpt.contains("module doc"));
        assert!(info.source_excerpt.contains("other_fn"));
    }

    #[test]
    fn test_unknown_lookups_error() {
        let dir = tempfile::tempdir().unwrap();
        write_server(dir.path(), &sample_manifest("weather"), "weather", FUNCTIONS_PY);
        let registry = Registry::load(dir.path()).unwrap();

        assert!(matches!(
            registry.get_function("nope", "get_item"),
            Err(MfpError::ServerNotFound(_))
        ));
        assert!(matches!(
            registry.get_function("weather", "nope"),
            Err(MfpError::FunctionNotFound { .. })
        ));
    }

    #[test]
    fn test_combined_swagger_hash_behaviors() {
        let dir = tempfile::tempdir().unwrap();
        write_server(dir.path(), &sample_manifest("weather"), "weather", FUNCTIONS_PY);
        write_server(dir.path(), &sample_manifest("hotel"), "hotel", FUNCTIONS_PY);
        let registry = Registry::load(dir.path()).unwrap();

        assert_eq!(registry.combined_swagger_hash(&[]), "no-servers");
        assert_eq!(
            registry.combined_swagger_hash(&["ghost".into()]),
            "unknown"
        );

        let ab = registry.combined_swagger_hash(&["weather".into(), "hotel".into()]);
        let ba = registry.combined_swagger_hash(&["hotel".into(), "weather".into()]);
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 64);
    }
}
