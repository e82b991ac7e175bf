//! OpenAPI 3.x / Swagger 2.0 parser: turns raw document bytes into a
//! normalized [`ServerSpec`]. YAML is a superset of JSON, so one loader
//! covers both encodings; the parsed tree is walked defensively as loose
//! JSON values.

use mfp_shared::hashing::hash_content;
use mfp_shared::{
    EndpointSpec, HttpMethod, MfpError, MfpResult, ParamLocation, ParamSpec, ResponseField,
    ServerSpec, SwaggerSource,
};
use serde_json::Value;

/// Response nesting cap: fields may carry one level of nested fields,
/// anything deeper is flattened or omitted.
const MAX_NESTING_DEPTH: usize = 1;

/// Schema combinators we do not expand; their presence skips the schema.
const COMPLEX_KEYWORDS: &[&str] = &["oneOf", "anyOf", "allOf", "discriminator", "not"];

pub struct SwaggerParser<'a> {
    source: &'a SwaggerSource,
}

impl<'a> SwaggerParser<'a> {
    #[must_use]
    pub fn new(source: &'a SwaggerSource) -> Self {
        Self { source }
    }

    /// Parse raw swagger bytes. Malformed top-level structure fails with
    /// `Parse`; individual endpoint failures are logged and skipped.
    pub fn parse(&self, raw: &[u8]) -> MfpResult<ServerSpec> {
        let text = std::str::from_utf8(raw).map_err(|e| {
            MfpError::Parse(format!(
                "Swagger document for '{}' is not valid UTF-8: {e}",
                self.source.name
            ))
        })?;

        let doc: Value = serde_yaml::from_str(text).map_err(|e| {
            MfpError::Parse(format!(
                "Failed to parse swagger document for '{}': {e}",
                self.source.name
            ))
        })?;

        if !doc.is_object() {
            return Err(MfpError::Parse(format!(
                "Swagger document for '{}' is not a mapping",
                self.source.name
            )));
        }

        self.detect_dialect(&doc)?;

        let source_hash = hash_content(raw);
        let description = self.extract_description(&doc);
        let endpoints = self.parse_paths(&doc);

        tracing::info!(
            server = %self.source.name,
            total_endpoints = endpoints.len(),
            swagger_hash = %&source_hash[..12],
            "swagger parsed"
        );

        Ok(ServerSpec {
            name: self.source.name.clone(),
            description,
            base_url: self.source.base_url.clone(),
            is_read_only: self.source.is_read_only,
            endpoints,
            source_hash,
        })
    }

    fn detect_dialect(&self, doc: &Value) -> MfpResult<()> {
        if doc.get("openapi").and_then(Value::as_str).is_some() {
            return Ok(());
        }
        if doc.get("swagger").and_then(Value::as_str) == Some("2.0") {
            return Ok(());
        }
        Err(MfpError::Parse(format!(
            "Document for '{}' is neither OpenAPI 3.x nor Swagger 2.0",
            self.source.name
        )))
    }

    fn extract_description(&self, doc: &Value) -> String {
        let info = doc.get("info");
        info.and_then(|i| i.get("description"))
            .or_else(|| info.and_then(|i| i.get("title")))
            .and_then(Value::as_str)
            .unwrap_or(&self.source.name)
            .to_string()
    }

    fn parse_paths(&self, doc: &Value) -> Vec<EndpointSpec> {
        let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
            return Vec::new();
        };

        let mut endpoints = Vec::new();
        let mut skipped = 0usize;

        for (path, path_item) in paths {
            let Some(item) = path_item.as_object() else {
                continue;
            };
            let empty = Vec::new();
            let path_level_params = item
                .get("parameters")
                .and_then(Value::as_array)
                .unwrap_or(&empty);

            for (key, operation) in item {
                let Some(method) = HttpMethod::parse(key) else {
                    continue;
                };
                if !operation.is_object() {
                    continue;
                }

                // Read-only sources drop mutating methods here so they can
                // never reach codegen.
                if self.source.is_read_only && method.is_mutating() {
                    tracing::debug!(path = %path, method = %method, "skipped read-only violation");
                    skipped += 1;
                    continue;
                }

                match self.parse_operation(doc, path, method, operation, path_level_params) {
                    Ok(endpoint) => endpoints.push(endpoint),
                    Err(e) => {
                        tracing::warn!(
                            path = %path,
                            method = %method,
                            reason = %e,
                            "endpoint skipped"
                        );
                        skipped += 1;
                    }
                }
            }
        }

        if skipped > 0 {
            tracing::info!(server = %self.source.name, count = skipped, "endpoints skipped");
        }

        endpoints
    }

    fn parse_operation(
        &self,
        doc: &Value,
        path: &str,
        method: HttpMethod,
        operation: &Value,
        path_level_params: &[Value],
    ) -> MfpResult<EndpointSpec> {
        let operation_id = operation
            .get("operationId")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| synthesize_operation_id(method, path));
        let operation_id = sanitize_operation_id(&operation_id);

        let summary = operation
            .get("summary")
            .or_else(|| operation.get("description"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("{method} {path}"));
        let description = operation
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // Operation-level parameters win over path-level on name collision.
        let empty = Vec::new();
        let op_params = operation
            .get("parameters")
            .and_then(Value::as_array)
            .unwrap_or(&empty);
        let mut merged: Vec<&Value> = op_params.iter().collect();
        merged.extend(path_level_params.iter());
        let mut parameters = self.parse_parameters(doc, &merged);

        // Invariant: required parameters precede optional in stored order.
        parameters.sort_by_key(|p| !p.required);

        let request_body_schema = if method.is_mutating() && method != HttpMethod::Delete {
            self.parse_request_body(doc, operation.get("requestBody"))
        } else {
            None
        };

        let response_fields = self.parse_response_fields(doc, operation.get("responses"));

        let tags = operation
            .get("tags")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(EndpointSpec {
            operation_id,
            method,
            path: path.to_string(),
            summary: truncate(&summary, 200),
            description: truncate(&description, 1000),
            parameters,
            request_body_schema,
            response_fields,
            tags,
        })
    }

    fn parse_parameters(&self, doc: &Value, raw_params: &[&Value]) -> Vec<ParamSpec> {
        let mut params = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for raw in raw_params {
            // A parameter may itself be a $ref; resolve one level.
            let resolved;
            let raw = if raw.get("$ref").is_some() {
                match resolve_ref(doc, raw) {
                    Some(r) => {
                        resolved = r;
                        &resolved
                    }
                    None => continue,
                }
            } else {
                *raw
            };

            let Some(name) = raw.get("name").and_then(Value::as_str) else {
                continue;
            };
            if name.is_empty() || !seen.insert(name.to_string()) {
                continue;
            }

            let location = match raw.get("in").and_then(Value::as_str) {
                Some("path") => ParamLocation::Path,
                Some("header") => ParamLocation::Header,
                Some("body") => ParamLocation::Body,
                _ => ParamLocation::Query,
            };

            // OpenAPI 3.x nests the type under `schema`; Swagger 2.0 puts it
            // on the parameter itself.
            let schema = raw.get("schema").unwrap_or(raw);
            let param_type = extract_type(schema);
            let required = raw
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(location == ParamLocation::Path);

            let default = schema.get("default").map(value_to_display);
            let enum_values = schema.get("enum").and_then(Value::as_array).map(|arr| {
                arr.iter().map(value_to_display).collect::<Vec<String>>()
            });

            params.push(ParamSpec {
                name: name.to_string(),
                safe_name: sanitize_param_name(name),
                location,
                param_type,
                required,
                description: raw
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                default,
                enum_values,
            });
        }

        params
    }

    fn parse_request_body(&self, doc: &Value, body: Option<&Value>) -> Option<Value> {
        let schema = body?
            .get("content")?
            .get("application/json")?
            .get("schema")?;

        let resolved = if schema.get("$ref").is_some() {
            resolve_ref(doc, schema)?
        } else {
            schema.clone()
        };

        if has_complex_keyword(&resolved) {
            tracing::warn!(server = %self.source.name, "request body uses unsupported schema combinators, skipped");
            return None;
        }
        Some(resolved)
    }

    fn parse_response_fields(&self, doc: &Value, responses: Option<&Value>) -> Vec<ResponseField> {
        let responses = match responses {
            Some(r) => r,
            None => return Vec::new(),
        };

        for status in ["200", "201"] {
            let Some(resp) = responses.get(status) else {
                continue;
            };
            // 3.x: content/application-json/schema; 2.0: schema directly.
            let schema = resp
                .get("content")
                .and_then(|c| c.get("application/json"))
                .and_then(|j| j.get("schema"))
                .or_else(|| resp.get("schema"));
            let Some(schema) = schema else {
                continue;
            };

            let resolved = if schema.get("$ref").is_some() {
                match resolve_ref(doc, schema) {
                    Some(r) => r,
                    None => continue,
                }
            } else {
                schema.clone()
            };

            if has_complex_keyword(&resolved) {
                tracing::warn!(server = %self.source.name, status = %status, "response schema uses unsupported combinators, skipped");
                return Vec::new();
            }

            return schema_to_fields(&resolved, 0);
        }

        Vec::new()
    }
}

/// Convert a (already one-level-resolved) schema into response fields.
/// `depth` 0 is the top level; nested fields appear only at depth 0, and a
/// `$ref` encountered here degrades to an opaque `object`.
fn schema_to_fields(schema: &Value, depth: usize) -> Vec<ResponseField> {
    if depth > MAX_NESTING_DEPTH {
        return Vec::new();
    }
    let Some(obj) = schema.as_object() else {
        return Vec::new();
    };

    let schema_type = obj.get("type").and_then(Value::as_str).unwrap_or("object");
    let mut fields = Vec::new();

    if schema_type == "object" || obj.contains_key("properties") {
        let Some(props) = obj.get("properties").and_then(Value::as_object) else {
            return Vec::new();
        };
        for (prop_name, prop_schema) in props {
            // Refs inside a resolved schema stay opaque.
            let field_type = if prop_schema.get("$ref").is_some() {
                "object".to_string()
            } else {
                extract_type(prop_schema)
            };

            let nested = if field_type == "object" && depth < MAX_NESTING_DEPTH {
                let inner = schema_to_fields(prop_schema, depth + 1);
                (!inner.is_empty()).then_some(inner)
            } else {
                None
            };

            fields.push(ResponseField {
                name: prop_name.clone(),
                field_type,
                description: prop_schema
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                nested,
            });
        }
    } else if schema_type == "array" {
        let items = obj.get("items").cloned().unwrap_or(Value::Null);
        if items.get("$ref").is_some() {
            fields.push(ResponseField {
                name: "items".into(),
                field_type: "array".into(),
                description: String::new(),
                nested: None,
            });
        } else {
            let item_fields = schema_to_fields(&items, depth + 1);
            if !item_fields.is_empty() {
                fields.push(ResponseField {
                    name: "items".into(),
                    field_type: "array".into(),
                    description: String::new(),
                    nested: (depth < MAX_NESTING_DEPTH).then_some(item_fields),
                });
            }
        }
    }

    fields
}

/// Resolve a local `$ref` pointer exactly one level. External refs are
/// unsupported and yield `None`.
fn resolve_ref(doc: &Value, holder: &Value) -> Option<Value> {
    let reference = holder.get("$ref")?.as_str()?;
    let path = reference.strip_prefix("#/")?;

    let mut node = doc;
    for part in path.split('/') {
        node = node.get(part)?;
    }
    node.is_object().then(|| node.clone())
}

fn has_complex_keyword(schema: &Value) -> bool {
    COMPLEX_KEYWORDS
        .iter()
        .any(|k| schema.get(k).is_some())
}

/// Primary type of a schema. Nullable unions like `["string", "null"]`
/// collapse to their non-null member.
fn extract_type(schema: &Value) -> String {
    match schema.get("type") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("string")
            .to_string(),
        _ => "string".to_string(),
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `{method_lower}_{path_sanitized}`: non-identifier characters become `_`,
/// runs collapse, path separators become joiners.
fn synthesize_operation_id(method: HttpMethod, path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '/' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let parts: Vec<&str> = sanitized
        .split('/')
        .filter(|p| !p.is_empty() && *p != "_")
        .collect();

    if parts.is_empty() {
        format!("{}_endpoint", method.as_str().to_lowercase())
    } else {
        format!("{}_{}", method.as_str().to_lowercase(), parts.join("_"))
    }
}

/// Sanitize to a valid lowercase Python identifier.
fn sanitize_operation_id(name: &str) -> String {
    let collapsed = collapse_non_identifier(name);
    let collapsed = collapsed.trim_matches('_').to_string();
    let prefixed = match collapsed.chars().next() {
        Some(c) if c.is_ascii_digit() => format!("fn_{collapsed}"),
        Some(_) => collapsed,
        None => return "endpoint".to_string(),
    };
    prefixed.to_lowercase()
}

/// Sanitize a parameter name, keeping case (the wire name is preserved
/// separately for request assembly).
fn sanitize_param_name(name: &str) -> String {
    let collapsed = collapse_non_identifier(name);
    let collapsed = collapsed.trim_matches('_').to_string();
    match collapsed.chars().next() {
        Some(c) if c.is_ascii_digit() => format!("p_{collapsed}"),
        Some(_) => collapsed,
        None => "param".to_string(),
    }
}

fn collapse_non_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEATHER_YAML: &str = r#"
openapi: "3.0.0"
info:
  title: Weather API
  description: Current conditions and forecasts
paths:
  /current:
    get:
      operationId: getCurrentWeather
      summary: Get current weather
      parameters:
        - name: units
          in: query
          schema:
            type: string
            default: metric
            enum: [metric, imperial]
        - name: city
          in: query
          required: true
          schema:
            type: string
      responses:
        "200":
          content:
            application/json:
              schema:
                type: object
                properties:
                  temperature:
                    type: number
                  conditions:
                    type: string
  /report:
    post:
      operationId: submitReport
      summary: Submit a weather report
      responses:
        "201":
          description: created
"#;

    fn weather_source(read_only: bool) -> SwaggerSource {
        SwaggerSource {
            name: "weather".into(),
            swagger_url: "unused".into(),
            base_url: "https://api.weather.example.com/v1".into(),
            auth_header: String::new(),
            is_read_only: read_only,
        }
    }

    #[test]
    fn test_parses_openapi3_document() {
        let source = weather_source(false);
        let spec = SwaggerParser::new(&source)
            .parse(WEATHER_YAML.as_bytes())
            .unwrap();

        assert_eq!(spec.name, "weather");
        assert_eq!(spec.description, "Current conditions and forecasts");
        assert_eq!(spec.endpoints.len(), 2);
        assert_eq!(spec.source_hash.len(), 64);
    }

    #[test]
    fn test_read_only_drops_mutating_methods() {
        let source = weather_source(true);
        let spec = SwaggerParser::new(&source)
            .parse(WEATHER_YAML.as_bytes())
            .unwrap();

        assert_eq!(spec.endpoints.len(), 1);
        assert!(spec.endpoints.iter().all(|e| !e.method.is_mutating()));
    }

    #[test]
    fn test_required_parameters_precede_optional() {
        let source = weather_source(false);
        let spec = SwaggerParser::new(&source)
            .parse(WEATHER_YAML.as_bytes())
            .unwrap();

        let current = spec
            .endpoints
            .iter()
            .find(|e| e.operation_id == "getcurrentweather")
            .unwrap();
        // `city` is required and listed second in the document; it must
        // still come first.
        assert_eq!(current.parameters[0].name, "city");
        assert!(current.parameters[0].required);
        assert_eq!(current.parameters[1].name, "units");
        assert!(!current.parameters[1].required);
        assert_eq!(current.parameters[1].default.as_deref(), Some("metric"));
        assert_eq!(
            current.parameters[1].enum_values.as_deref(),
            Some(&["metric".to_string(), "imperial".to_string()][..])
        );
    }

    #[test]
    fn test_parse_is_deterministic() {
        let source = weather_source(false);
        let a = SwaggerParser::new(&source)
            .parse(WEATHER_YAML.as_bytes())
            .unwrap();
        let b = SwaggerParser::new(&source)
            .parse(WEATHER_YAML.as_bytes())
            .unwrap();
        assert_eq!(a.source_hash, b.source_hash);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_missing_operation_id_synthesized() {
        let yaml = r#"
openapi: "3.0.0"
info: { title: T }
paths:
  /users/{user-id}/orders:
    get:
      responses: {}
"#;
        let source = weather_source(false);
        let spec = SwaggerParser::new(&source).parse(yaml.as_bytes()).unwrap();
        assert_eq!(spec.endpoints[0].operation_id, "get_users_user_id_orders");
    }

    #[test]
    fn test_operation_params_win_over_path_level() {
        let yaml = r#"
openapi: "3.0.0"
info: { title: T }
paths:
  /items:
    parameters:
      - name: limit
        in: query
        schema: { type: integer }
    get:
      operationId: list_items
      parameters:
        - name: limit
          in: query
          required: true
          schema: { type: string }
      responses: {}
"#;
        let source = weather_source(false);
        let spec = SwaggerParser::new(&source).parse(yaml.as_bytes()).unwrap();
        let params = &spec.endpoints[0].parameters;
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].param_type, "string");
        assert!(params[0].required);
    }

    #[test]
    fn test_ref_resolved_one_level_only() {
        let yaml = r##"
openapi: "3.0.0"
info: { title: T }
components:
  schemas:
    Order:
      type: object
      properties:
        id: { type: integer }
        customer:
          $ref: "#/components/schemas/Customer"
    Customer:
      type: object
      properties:
        name: { type: string }
paths:
  /orders/{id}:
    get:
      operationId: get_order
      parameters:
        - name: id
          in: path
          schema: { type: integer }
      responses:
        "200":
          content:
            application/json:
              schema:
                $ref: "#/components/schemas/Order"
"##;
        let source = weather_source(false);
        let spec = SwaggerParser::new(&source).parse(yaml.as_bytes()).unwrap();
        let fields = &spec.endpoints[0].response_fields;

        let id = fields.iter().find(|f| f.name == "id").unwrap();
        assert_eq!(id.field_type, "integer");

        // The nested $ref is one level past the resolved Order schema; it
        // degrades to an opaque object.
        let customer = fields.iter().find(|f| f.name == "customer").unwrap();
        assert_eq!(customer.field_type, "object");
        assert!(customer.nested.is_none());
    }

    #[test]
    fn test_path_param_required_by_default() {
        let yaml = r#"
openapi: "3.0.0"
info: { title: T }
paths:
  /pets/{petId}:
    get:
      operationId: get_pet
      parameters:
        - name: petId
          in: path
          schema: { type: integer }
      responses: {}
"#;
        let source = weather_source(false);
        let spec = SwaggerParser::new(&source).parse(yaml.as_bytes()).unwrap();
        let param = &spec.endpoints[0].parameters[0];
        assert!(param.required);
        assert_eq!(param.location, ParamLocation::Path);
        assert_eq!(param.safe_name, "petId");
    }

    #[test]
    fn test_complex_schema_combinators_skipped() {
        let yaml = r#"
openapi: "3.0.0"
info: { title: T }
paths:
  /poly:
    get:
      operationId: get_poly
      responses:
        "200":
          content:
            application/json:
              schema:
                oneOf:
                  - { type: string }
                  - { type: integer }
"#;
        let source = weather_source(false);
        let spec = SwaggerParser::new(&source).parse(yaml.as_bytes()).unwrap();
        // Parsing does not fail; the schema is simply dropped.
        assert_eq!(spec.endpoints.len(), 1);
        assert!(spec.endpoints[0].response_fields.is_empty());
    }

    #[test]
    fn test_swagger_2_dialect_accepted() {
        let yaml = r#"
swagger: "2.0"
info: { title: Legacy }
paths:
  /things:
    get:
      operationId: list_things
      parameters:
        - name: q
          in: query
          type: string
      responses:
        "200":
          schema:
            type: object
            properties:
              total: { type: integer }
"#;
        let source = weather_source(false);
        let spec = SwaggerParser::new(&source).parse(yaml.as_bytes()).unwrap();
        assert_eq!(spec.endpoints.len(), 1);
        assert_eq!(spec.endpoints[0].parameters[0].param_type, "string");
        assert_eq!(spec.endpoints[0].response_fields[0].name, "total");
    }

    #[test]
    fn test_unknown_dialect_is_parse_error() {
        let source = weather_source(false);
        let err = SwaggerParser::new(&source)
            .parse(b"info: {title: X}\npaths: {}")
            .unwrap_err();
        assert!(matches!(err, MfpError::Parse(_)));
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        let source = weather_source(false);
        assert!(matches!(
            SwaggerParser::new(&source).parse(b"- just\n- a list"),
            Err(MfpError::Parse(_))
        ));
        assert!(matches!(
            SwaggerParser::new(&source).parse(b"{unclosed"),
            Err(MfpError::Parse(_))
        ));
    }

    #[test]
    fn test_sanitize_operation_id_rules() {
        assert_eq!(sanitize_operation_id("getUser"), "getuser");
        assert_eq!(sanitize_operation_id("get-user--by-id"), "get_user_by_id");
        assert_eq!(sanitize_operation_id("2fast"), "fn_2fast");
        assert_eq!(sanitize_operation_id("!!!"), "endpoint");
    }

    #[test]
    fn test_sanitize_param_name_rules() {
        assert_eq!(sanitize_param_name("X-Api-Key"), "X_Api_Key");
        assert_eq!(sanitize_param_name("page[size]"), "page_size");
        assert_eq!(sanitize_param_name("2nd"), "p_2nd");
        assert_eq!(sanitize_param_name("---"), "param");
    }
}
