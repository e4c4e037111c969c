use crate::error::{Result, WafError};
use crate::recorder::ResponseRecorder;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use serde_json::Value;
use std::net::IpAddr;
use tracing::debug;

/// Target names whose logged values are replaced when redaction is on
const SENSITIVE_MARKERS: [&str; 5] = ["password", "token", "apikey", "authorization", "secret"];

/// Everything the extractor can see of one request.
///
/// The middleware builds this once per request; the body has already been
/// buffered, so downstream handlers receive the identical bytes.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_ip: IpAddr,
    pub body: Bytes,
}

impl RequestContext {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    pub fn host(&self) -> &str {
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.host())
            .unwrap_or("")
    }

    fn protocol(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/1.1",
        }
    }
}

/// Resolves rule target names to request/response values.
#[derive(Debug, Clone)]
pub struct RequestExtractor {
    redact_sensitive_data: bool,
}

impl RequestExtractor {
    pub fn new(redact_sensitive_data: bool) -> Self {
        Self {
            redact_sensitive_data,
        }
    }

    /// Resolve a target. A comma-separated list concatenates the values
    /// that resolve, separated by commas; failed extractions are skipped
    /// silently.
    pub fn extract(
        &self,
        target: &str,
        ctx: &RequestContext,
        recorder: Option<&ResponseRecorder>,
        phase: u8,
    ) -> Result<String> {
        let target = target.trim();
        if target.is_empty() {
            return Err(WafError::Extraction("empty extraction target".to_string()));
        }

        if target.contains(',') {
            let mut values = Vec::new();
            for part in target.split(',') {
                match self.extract_single(part.trim(), ctx, recorder, phase) {
                    Ok(value) => values.push(value),
                    Err(e) => {
                        debug!(target = %part.trim(), error = %e, "Skipping unresolved target in list");
                    }
                }
            }
            return Ok(values.join(","));
        }

        self.extract_single(target, ctx, recorder, phase)
    }

    /// The value to put in a log record for this target. Matching always
    /// sees the raw value; only log output is redacted.
    pub fn loggable<'a>(&self, target: &str, value: &'a str) -> &'a str {
        if self.redact_sensitive_data {
            let lowered = target.to_lowercase();
            if SENSITIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
                return "REDACTED";
            }
        }
        value
    }

    fn extract_single(
        &self,
        target: &str,
        ctx: &RequestContext,
        recorder: Option<&ResponseRecorder>,
        phase: u8,
    ) -> Result<String> {
        let upper = target.to_uppercase();

        // Prefixed targets keep their argument's original case; only the
        // prefix itself is case-insensitive.
        if let Some(name) = strip_prefix_ci(target, "REQUEST_HEADERS:")
            .or_else(|| strip_prefix_ci(target, "HEADERS:"))
        {
            return self.request_header(ctx, name, target);
        }
        if let Some(name) = strip_prefix_ci(target, "RESPONSE_HEADERS:") {
            let recorder = recorder.ok_or_else(|| {
                WafError::Extraction(format!(
                    "response headers not available during this phase for target: {target}"
                ))
            })?;
            return recorder
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    WafError::Extraction(format!(
                        "response header '{name}' not found for target: {target}"
                    ))
                });
        }
        if let Some(name) = strip_prefix_ci(target, "COOKIES:") {
            return cookie_value(ctx, name).ok_or_else(|| {
                WafError::Extraction(format!("cookie '{name}' not found for target: {target}"))
            });
        }
        if let Some(name) = strip_prefix_ci(target, "URL_PARAM:") {
            if name.is_empty() {
                return Err(WafError::Extraction(format!(
                    "URL parameter name is empty for target: {target}"
                )));
            }
            return query_param(ctx.query(), name).ok_or_else(|| {
                WafError::Extraction(format!(
                    "url parameter '{name}' not found for target: {target}"
                ))
            });
        }
        if let Some(path) = strip_prefix_ci(target, "JSON_PATH:") {
            if ctx.body.is_empty() {
                return Err(WafError::Extraction(format!(
                    "request body is empty for target: {target}"
                )));
            }
            return extract_json_path(&ctx.body, path);
        }

        let value = match upper.as_str() {
            "METHOD" => ctx.method.to_string(),
            "REMOTE_IP" => ctx.remote_ip.to_string(),
            "PROTOCOL" => ctx.protocol().to_string(),
            "HOST" => ctx.host().to_string(),
            "PATH" => ctx.path().to_string(),
            "URI" => {
                let query = ctx.query();
                if query.is_empty() {
                    ctx.path().to_string()
                } else {
                    format!("{}?{}", ctx.path(), query)
                }
            }
            "URL" => ctx.uri.to_string(),
            "USER_AGENT" => ctx
                .headers
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            "ARGS" => {
                let query = ctx.query();
                if query.is_empty() {
                    return Err(WafError::Extraction(format!(
                        "query string is empty for target: {target}"
                    )));
                }
                query.to_string()
            }
            "BODY" => {
                if ctx.body.is_empty() {
                    return Err(WafError::Extraction(format!(
                        "request body is empty for target: {target}"
                    )));
                }
                String::from_utf8_lossy(&ctx.body).into_owned()
            }
            "CONTENT_TYPE" => ctx
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
                .ok_or_else(|| {
                    WafError::Extraction(format!(
                        "content-type header not found for target: {target}"
                    ))
                })?,
            "HEADERS" | "REQUEST_HEADERS" => {
                if ctx.headers.is_empty() {
                    return Err(WafError::Extraction(format!(
                        "request headers are empty for target: {target}"
                    )));
                }
                join_headers(&ctx.headers)
            }
            "RESPONSE_HEADERS" => {
                let recorder = recorder.ok_or_else(|| {
                    WafError::Extraction(format!(
                        "response headers not accessible outside phases 3-4 for target: {target}"
                    ))
                })?;
                join_headers(recorder.headers())
            }
            "RESPONSE_BODY" => {
                let recorder = recorder.filter(|_| phase == 4).ok_or_else(|| {
                    WafError::Extraction(format!(
                        "response body not accessible outside phase 4 for target: {target}"
                    ))
                })?;
                if recorder.body_bytes().is_empty() {
                    return Err(WafError::Extraction(format!(
                        "response body is empty for target: {target}"
                    )));
                }
                recorder.body_string()
            }
            "COOKIES" | "REQUEST_COOKIES" => {
                let cookies = all_cookies(ctx);
                if cookies.is_empty() {
                    return Err(WafError::Extraction(format!(
                        "no cookies found for target: {target}"
                    )));
                }
                cookies
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            }
            "FILE_NAME" => first_multipart_file(ctx)
                .map(|part| part.filename)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    WafError::Extraction(format!("file name not found for target: {target}"))
                })?,
            "FILE_MIME_TYPE" => first_multipart_file(ctx)
                .and_then(|part| part.content_type)
                .ok_or_else(|| {
                    WafError::Extraction(format!("file MIME type not found for target: {target}"))
                })?,
            _ => {
                debug!(target = %target, "Unknown extraction target");
                return Err(WafError::Extraction(format!(
                    "unknown extraction target: {target}"
                )));
            }
        };

        debug!(
            target = %target,
            value = %self.loggable(target, &value),
            "Extracted value"
        );
        Ok(value)
    }

    fn request_header(&self, ctx: &RequestContext, name: &str, target: &str) -> Result<String> {
        ctx.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                WafError::Extraction(format!("header '{name}' not found for target: {target}"))
            })
    }
}

fn strip_prefix_ci<'a>(target: &'a str, prefix: &str) -> Option<&'a str> {
    if target.len() >= prefix.len() && target[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&target[prefix.len()..])
    } else {
        None
    }
}

fn join_headers(headers: &HeaderMap) -> String {
    headers
        .keys()
        .map(|name| {
            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            format!("{name}: {}", values.join(","))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn all_cookies(ctx: &RequestContext) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for header in ctx.headers.get_all(http::header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
    }
    cookies
}

fn cookie_value(ctx: &RequestContext, name: &str) -> Option<String> {
    all_cookies(ctx)
        .into_iter()
        .find(|(cookie, _)| cookie == name)
        .map(|(_, value)| value)
}

fn query_param(query: &str, name: &str) -> Option<String> {
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if percent_decode(key) == name {
            let decoded = percent_decode(value);
            if decoded.is_empty() {
                return None;
            }
            return Some(decoded);
        }
    }
    None
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Descend a dotted JSON path: object keys for maps, integer indices for
/// arrays. Terminal scalars are stringified, composites re-marshalled.
fn extract_json_path(body: &[u8], path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(WafError::Extraction("json path is empty".to_string()));
    }

    let root: Value = serde_json::from_slice(body)
        .map_err(|e| WafError::Extraction(format!("failed to parse body as JSON: {e}")))?;

    let mut current = &root;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part).ok_or_else(|| {
                WafError::Extraction(format!(
                    "invalid json path: key '{part}' not found in path '{path}'"
                ))
            })?,
            Value::Array(items) => {
                let index: usize = part.parse().map_err(|_| {
                    WafError::Extraction(format!(
                        "invalid json path: index '{part}' is not a valid index in path '{path}'"
                    ))
                })?;
                items.get(index).ok_or_else(|| {
                    WafError::Extraction(format!(
                        "invalid json path: index '{part}' is out of bounds in path '{path}'"
                    ))
                })?
            }
            _ => {
                return Err(WafError::Extraction(format!(
                    "invalid json path: unexpected type at part '{part}' in path '{path}'"
                )))
            }
        };
    }

    match current {
        Value::Null => Err(WafError::Extraction(format!(
            "invalid json path: value is null at path '{path}'"
        ))),
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        composite => serde_json::to_string(composite)
            .map_err(|e| WafError::Extraction(format!("failed to re-marshal JSON value: {e}"))),
    }
}

struct MultipartFile {
    filename: String,
    content_type: Option<String>,
}

/// First file part of a multipart/form-data body, if any.
fn first_multipart_file(ctx: &RequestContext) -> Option<MultipartFile> {
    let content_type = ctx
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())?;
    if !content_type
        .to_lowercase()
        .starts_with("multipart/form-data")
    {
        return None;
    }
    let boundary = content_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("boundary="))
        .next()?
        .trim_matches('"');

    let body = String::from_utf8_lossy(&ctx.body);
    let delimiter = format!("--{boundary}");
    for part in body.split(delimiter.as_str()).skip(1) {
        let Some(headers_end) = part.find("\r\n\r\n").or_else(|| part.find("\n\n")) else {
            continue;
        };
        let part_headers = &part[..headers_end];

        let mut filename = None;
        let mut mime = None;
        for line in part_headers.lines() {
            let lowered = line.to_lowercase();
            if lowered.starts_with("content-disposition:") {
                filename = line
                    .split(';')
                    .filter_map(|attr| attr.trim().strip_prefix("filename="))
                    .next()
                    .map(|name| name.trim_matches('"').to_string());
            } else if lowered.starts_with("content-type:") {
                mime = line.split_once(':').map(|(_, v)| v.trim().to_string());
            }
        }

        if let Some(filename) = filename {
            return Some(MultipartFile {
                filename,
                content_type: mime,
            });
        }
    }
    None
}
