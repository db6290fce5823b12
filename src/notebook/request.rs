//! Builds the `REQUEST` object injected into a kernel before running an
//! endpoint cell, and the statement that assigns it (C9 step 1 and 3).
//!
//! The body is decoded by `Content-Type`, query arguments and form fields
//! are collected as `name -> [values]`, and repeated headers collapse into
//! a list.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::Value;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const APPLICATION_JSON: &str = "application/json";
const MULTIPART_FORM_DATA: &str = "multipart/form-data";

/// The request object injected into the kernel's namespace before an
/// endpoint cell runs.
#[derive(Serialize)]
pub struct Request {
    pub body: Value,
    pub args: BTreeMap<String, Vec<String>>,
    pub path: BTreeMap<String, String>,
    pub headers: BTreeMap<String, Value>,
}

impl Request {
    /// Build a request object from the raw HTTP parts.
    pub fn build(
        headers: &HeaderMap,
        query: &str,
        raw_body: &[u8],
        path_params: BTreeMap<String, String>,
    ) -> Self {
        let content_type = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/plain");

        Request {
            body: parse_body(content_type, raw_body),
            args: parse_query(query),
            path: path_params,
            headers: headers_to_map(headers),
        }
    }

    /// The statement assigning this request to the kernel's well-known
    /// variable, varying by kernel language. Transmitted as a single
    /// JSON-encoded string to avoid lexical escape issues in arbitrary
    /// kernels.
    pub fn assignment_statement(&self, kernel_language: &str) -> String {
        let bundle = serde_json::to_string(self).expect("Request always serializes");
        let encoded = serde_json::to_string(&bundle).expect("string always serializes");
        match kernel_language.to_lowercase().as_str() {
            "perl" => format!("my $REQUEST = {encoded}"),
            "bash" => format!("REQUEST={encoded}"),
            _ => format!("REQUEST = {encoded}"),
        }
    }
}

fn parse_body(content_type: &str, raw_body: &[u8]) -> Value {
    let body = String::from_utf8_lossy(raw_body).into_owned();
    if content_type.starts_with(FORM_URLENCODED) {
        let parsed: BTreeMap<String, String> =
            serde_urlencoded::from_bytes(raw_body).unwrap_or_default();
        let as_lists: BTreeMap<String, Vec<String>> = parsed
            .into_iter()
            .map(|(key, value)| (key, vec![value]))
            .collect();
        return serde_json::to_value(as_lists).unwrap_or(Value::String(body));
    }
    if content_type.starts_with(APPLICATION_JSON) {
        if let Ok(value) = serde_json::from_str(&body) {
            return value;
        }
    }
    if content_type.starts_with(MULTIPART_FORM_DATA) {
        if let Some(boundary) = content_type
            .split(';')
            .find_map(|part| part.trim().strip_prefix("boundary="))
        {
            let as_lists = parse_multipart(raw_body, boundary);
            return serde_json::to_value(as_lists).unwrap_or(Value::String(body));
        }
    }
    Value::String(body)
}

/// Parses a `name -> [values]` map out of a `multipart/form-data` body.
/// Only plain text fields are decoded; file parts are skipped since there is
/// no filesystem-backed upload surface in this dispatcher.
fn parse_multipart(raw_body: &[u8], boundary: &str) -> BTreeMap<String, Vec<String>> {
    let boundary = boundary.trim_matches('"');
    let delimiter = format!("--{boundary}");
    let text = String::from_utf8_lossy(raw_body);
    let mut args: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for part in text.split(&delimiter) {
        let part = part.trim_start_matches("\r\n").trim_end_matches("\r\n");
        if part.is_empty() || part == "--" {
            continue;
        }
        let Some((head, value)) = part.split_once("\r\n\r\n") else {
            continue;
        };
        let Some(name) = head.lines().find_map(|line| {
            let line = line.trim();
            if !line.to_ascii_lowercase().starts_with("content-disposition:") {
                return None;
            }
            line.split(';').find_map(|segment| {
                segment.trim().strip_prefix("name=").map(|n| n.trim_matches('"').to_string())
            })
        }) else {
            continue;
        };
        if head.to_ascii_lowercase().contains("filename=") {
            continue;
        }
        args.entry(name).or_default().push(value.trim_end_matches("\r\n").to_string());
    }
    args
}

fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
    let mut args: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        args.entry(key).or_default().push(value);
    }
    args
}

fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, Value> {
    let mut map: BTreeMap<String, Value> = BTreeMap::new();
    for name in headers.keys() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let entry = if values.len() == 1 {
            Value::String(values[0].to_string())
        } else {
            Value::Array(values.into_iter().map(|v| Value::String(v.to_string())).collect())
        };
        map.insert(name.as_str().to_string(), entry);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_body() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        let request = Request::build(&headers, "", br#"{"x":1}"#, BTreeMap::new());
        assert_eq!(request.body, serde_json::json!({"x": 1}));
    }

    #[test]
    fn falls_back_to_raw_text_for_unknown_content_type() {
        let headers = HeaderMap::new();
        let request = Request::build(&headers, "", b"plain text", BTreeMap::new());
        assert_eq!(request.body, Value::String("plain text".to_string()));
    }

    #[test]
    fn collects_repeated_query_args() {
        let headers = HeaderMap::new();
        let request = Request::build(&headers, "a=1&a=2&b=3", b"", BTreeMap::new());
        assert_eq!(request.args.get("a"), Some(&vec!["1".to_string(), "2".to_string()]));
        assert_eq!(request.args.get("b"), Some(&vec!["3".to_string()]));
    }

    #[test]
    fn assignment_statement_defaults_to_request_equals() {
        let headers = HeaderMap::new();
        let request = Request::build(&headers, "", b"", BTreeMap::new());
        let stmt = request.assignment_statement("python");
        assert!(stmt.starts_with("REQUEST = \""));
    }

    #[test]
    fn parses_multipart_form_fields() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            "multipart/form-data; boundary=X".parse().unwrap(),
        );
        let body = b"--X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--X--\r\n";
        let request = Request::build(&headers, "", body, BTreeMap::new());
        assert_eq!(request.body, serde_json::json!({"a": ["1"]}));
    }

    #[test]
    fn assignment_statement_uses_bash_syntax() {
        let headers = HeaderMap::new();
        let request = Request::build(&headers, "", b"", BTreeMap::new());
        let stmt = request.assignment_statement("bash");
        assert!(stmt.starts_with("REQUEST=\""));
    }
}
