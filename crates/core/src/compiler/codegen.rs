//! Code generator: pure mapping from a [`ServerSpec`] to the Python
//! function library shipped into the sandbox. Byte-deterministic: identical
//! input produces identical output. Credentials never appear in the emitted
//! text; the generated helpers read `MFP_{SERVER}_BASE_URL` and
//! `MFP_{SERVER}_AUTH` from the process environment at call time.

use mfp_shared::{EndpointSpec, HttpMethod, ParamLocation, ParamSpec, ServerSpec};
use std::fmt::Write;

/// Map swagger/JSON-schema types to Python annotations.
fn python_type(swagger_type: &str) -> &'static str {
    match swagger_type {
        "string" => "str",
        "integer" => "int",
        "number" => "float",
        "boolean" => "bool",
        "object" => "dict[str, Any]",
        "array" => "list[Any]",
        _ => "Any",
    }
}

fn env_fragment(server_name: &str) -> String {
    server_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn default_literal(param: &ParamSpec) -> String {
    match &param.default {
        Some(value) if param.param_type == "string" => format!("\"{value}\""),
        Some(value) => value.clone(),
        None => "None".to_string(),
    }
}

/// Human-readable signature for manifests and `get_function` responses.
/// Required parameters first, then optional with defaults, then the body.
#[must_use]
pub fn function_signature(endpoint: &EndpointSpec) -> String {
    let mut parts = Vec::new();

    for param in endpoint.parameters.iter().filter(|p| p.required) {
        parts.push(format!(
            "{}: {}",
            param.safe_name,
            python_type(&param.param_type)
        ));
    }
    for param in endpoint.parameters.iter().filter(|p| !p.required) {
        parts.push(format!(
            "{}: {} | None = {}",
            param.safe_name,
            python_type(&param.param_type),
            default_literal(param)
        ));
    }
    if endpoint.request_body_schema.is_some() {
        parts.push("json_body: dict[str, Any] | None = None".to_string());
    }

    format!("{}({})", endpoint.operation_id, parts.join(", "))
}

/// Generate the complete Python module for one server.
#[must_use]
pub fn generate(spec: &ServerSpec) -> String {
    let mut out = String::with_capacity(4096);
    let fragment = env_fragment(&spec.name);

    let _ = write!(
        out,
        r#""""{name} API functions.

GENERATED — DO NOT EDIT

{description}
"""

from __future__ import annotations

import os
from typing import Any

import httpx

_ENV_PREFIX = "MFP_{fragment}_"
_DEFAULT_BASE_URL = "{base_url}"


def _build_headers() -> dict[str, str]:
    """Assemble request headers from the process environment."""
    headers = {{"Accept": "application/json"}}
    auth = os.environ.get(_ENV_PREFIX + "AUTH", "")
    if auth:
        headers["Authorization"] = auth
    return headers


def _request(
    method: str,
    path: str,
    params: dict[str, Any] | None = None,
    json_body: dict[str, Any] | None = None,
    headers: dict[str, str] | None = None,
) -> Any:
    """Issue a request against the server and decode the response."""
    base_url = os.environ.get(_ENV_PREFIX + "BASE_URL", _DEFAULT_BASE_URL)
    merged = _build_headers()
    if headers:
        merged.update(headers)
    with httpx.Client(timeout=30.0, follow_redirects=True) as client:
        response = client.request(
            method,
            base_url.rstrip("/") + path,
            params=params,
            json=json_body,
            headers=merged,
        )
        response.raise_for_status()
        content_type = response.headers.get("content-type", "")
        if "application/json" in content_type:
            return response.json()
        return response.text
"#,
        name = spec.name,
        description = spec.description,
        fragment = fragment,
        base_url = spec.base_url,
    );

    for endpoint in &spec.endpoints {
        out.push_str("\n\n");
        emit_function(&mut out, endpoint);
    }

    tracing::debug!(
        server = %spec.name,
        functions = spec.endpoints.len(),
        code_size = out.len(),
        "code generated"
    );
    out
}

fn emit_function(out: &mut String, endpoint: &EndpointSpec) {
    let signature = function_signature(endpoint);
    let _ = write!(out, "def {signature} -> Any:\n");
    emit_docstring(out, endpoint);

    // Query parameters, filtered of unset optionals at call time.
    let query: Vec<&ParamSpec> = endpoint
        .parameters
        .iter()
        .filter(|p| p.location == ParamLocation::Query)
        .collect();
    if query.is_empty() {
        out.push_str("    params: dict[str, Any] | None = None\n");
    } else {
        out.push_str("    params = {\n");
        for param in &query {
            let _ = write!(out, "        \"{}\": {},\n", param.name, param.safe_name);
        }
        out.push_str("    }\n");
        out.push_str("    params = {k: v for k, v in params.items() if v is not None}\n");
    }

    // Header parameters keep their wire names.
    let headers: Vec<&ParamSpec> = endpoint
        .parameters
        .iter()
        .filter(|p| p.location == ParamLocation::Header)
        .collect();
    if headers.is_empty() {
        out.push_str("    headers: dict[str, str] | None = None\n");
    } else {
        out.push_str("    headers = {\n");
        for param in &headers {
            let _ = write!(
                out,
                "        \"{}\": str({}),\n",
                param.name, param.safe_name
            );
        }
        out.push_str("    }\n");
        out.push_str("    headers = {k: v for k, v in headers.items() if v != \"None\"}\n");
    }

    let _ = write!(out, "    path = {}\n", path_expression(endpoint));

    let body_arg = if endpoint.request_body_schema.is_some() {
        "json_body=json_body"
    } else {
        "json_body=None"
    };
    let _ = write!(
        out,
        "    return _request(\"{}\", path, params=params, {}, headers=headers)\n",
        endpoint.method, body_arg
    );
}

fn emit_docstring(out: &mut String, endpoint: &EndpointSpec) {
    let _ = write!(out, "    \"\"\"{}\n", endpoint.summary);

    if !endpoint.parameters.is_empty() || endpoint.request_body_schema.is_some() {
        out.push_str("\n    Args:\n");
        for param in &endpoint.parameters {
            let requirement = if param.required { "required" } else { "optional" };
            let description = if param.description.is_empty() {
                param.name.as_str()
            } else {
                param.description.as_str()
            };
            let _ = write!(
                out,
                "        {} ({}, {}): {}\n",
                param.safe_name,
                python_type(&param.param_type),
                requirement,
                description
            );
        }
        if endpoint.request_body_schema.is_some() {
            out.push_str(
                "        json_body (dict[str, Any], optional): Request body as a JSON object\n",
            );
        }
    }

    out.push_str("\n    Returns:\n");
    if endpoint.response_fields.is_empty() {
        out.push_str("        Response data\n");
    } else {
        let names: Vec<&str> = endpoint
            .response_fields
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        let _ = write!(out, "        {}\n", names.join(", "));
    }
    out.push_str("    \"\"\"\n");
}

/// Path expression with `{param}` placeholders rewritten to safe names; an
/// f-string only when substitution actually happens.
fn path_expression(endpoint: &EndpointSpec) -> String {
    let mut path = endpoint.path.clone();
    let mut has_params = false;
    for param in endpoint
        .parameters
        .iter()
        .filter(|p| p.location == ParamLocation::Path)
    {
        let needle = format!("{{{}}}", param.name);
        if path.contains(&needle) {
            path = path.replace(&needle, &format!("{{{}}}", param.safe_name));
            has_params = true;
        }
    }
    if has_params {
        format!("f\"{path}\"")
    } else {
        format!("\"{path}\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfp_shared::ResponseField;

    fn sample_spec() -> ServerSpec {
        ServerSpec {
            name: "weather".into(),
            description: "Weather data".into(),
            base_url: "https://api.weather.example.com/v1".into(),
            is_read_only: true,
            endpoints: vec![EndpointSpec {
                operation_id: "get_current_weather".into(),
                method: HttpMethod::Get,
                path: "/current/{region}".into(),
                summary: "Get current weather".into(),
                description: String::new(),
                parameters: vec![
                    ParamSpec {
                        name: "region".into(),
                        safe_name: "region".into(),
                        location: ParamLocation::Path,
                        param_type: "string".into(),
                        required: true,
                        description: "Region code".into(),
                        default: None,
                        enum_values: None,
                    },
                    ParamSpec {
                        name: "units".into(),
                        safe_name: "units".into(),
                        location: ParamLocation::Query,
                        param_type: "string".into(),
                        required: false,
                        description: String::new(),
                        default: Some("metric".into()),
                        enum_values: None,
                    },
                ],
                request_body_schema: None,
                response_fields: vec![ResponseField {
                    name: "temperature".into(),
                    field_type: "number".into(),
                    description: String::new(),
                    nested: None,
                }],
                tags: vec![],
            }],
            source_hash: "ab".repeat(32),
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let spec = sample_spec();
        assert_eq!(generate(&spec), generate(&spec));
    }

    #[test]
    fn test_banner_and_helpers_present() {
        let code = generate(&sample_spec());
        assert!(code.contains("GENERATED — DO NOT EDIT"));
        assert!(code.contains("def _build_headers()"));
        assert!(code.contains("def _request("));
        assert!(code.contains("_ENV_PREFIX = \"MFP_WEATHER_\""));
    }

    #[test]
    fn test_signature_orders_required_first() {
        let mut spec = sample_spec();
        // Force the optional param ahead in the vec to prove ordering comes
        // from required-ness, not position.
        spec.endpoints[0].parameters.reverse();
        let sig = function_signature(&spec.endpoints[0]);
        assert_eq!(
            sig,
            "get_current_weather(region: str, units: str | None = \"metric\")"
        );
    }

    #[test]
    fn test_path_params_use_fstring_substitution() {
        let code = generate(&sample_spec());
        assert!(code.contains("path = f\"/current/{region}\""));
    }

    #[test]
    fn test_docstring_lists_params_and_returns() {
        let code = generate(&sample_spec());
        assert!(code.contains("region (str, required): Region code"));
        assert!(code.contains("units (str, optional)"));
        assert!(code.contains("Returns:\n        temperature"));
    }

    #[test]
    fn test_no_auth_material_in_output() {
        let code = generate(&sample_spec());
        // Only env var *names* may appear; never values or header literals.
        assert!(!code.contains("Bearer "));
        assert!(code.contains("os.environ.get(_ENV_PREFIX + \"AUTH\""));
    }

    #[test]
    fn test_body_parameter_emitted_for_mutating_endpoint() {
        let mut spec = sample_spec();
        spec.is_read_only = false;
        spec.endpoints[0].operation_id = "create_report".into();
        spec.endpoints[0].method = HttpMethod::Post;
        spec.endpoints[0].request_body_schema =
            Some(serde_json::json!({"type": "object"}));
        let code = generate(&spec);
        assert!(code.contains("json_body: dict[str, Any] | None = None) -> Any:"));
        assert!(code.contains("json_body=json_body"));
    }

    #[test]
    fn test_wire_names_preserved_for_query_assembly() {
        let mut spec = sample_spec();
        spec.endpoints[0].parameters.push(ParamSpec {
            name: "page[size]".into(),
            safe_name: "page_size".into(),
            location: ParamLocation::Query,
            param_type: "integer".into(),
            required: false,
            description: String::new(),
            default: None,
            enum_values: None,
        });
        let code = generate(&spec);
        assert!(code.contains("\"page[size]\": page_size,"));
    }
}
