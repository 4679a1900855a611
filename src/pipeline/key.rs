//! Cache key construction and reversal.
//!
//! A cache key is a URL derived from the intercepted request: the request URL
//! with its pathname normalized, augmented with engine-reserved query
//! parameters (`__`-prefixed) carrying the canonical body, the method, and
//! the values of policy-selected headers, with all parameters sorted by name.
//! Construction is a pure function of the request and the `keyHeaders` list;
//! the body is already buffered so nothing is consumed.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request};
use thiserror::Error;
use url::Url;
use url::form_urlencoded;

use crate::policy::normalize_path;

/// Prefix of every engine-reserved query parameter.
pub const RESERVED_PREFIX: &str = "__";

const BODY_PARAM: &str = "__body";
const METHOD_PARAM: &str = "__method";
const HEADER_PARAM_PREFIX: &str = "__header-";

/// Placeholder for an empty canonical body or an absent key header.
const ABSENT: &str = "none";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("request URL `{0}` has no origin")]
    NoOrigin(String),
    #[error("failed to parse request URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Build the cache key for `request` under the given key-header list.
pub fn cache_key(request: &Request<Bytes>, key_headers: &[String]) -> Result<String, KeyError> {
    let raw = request.uri().to_string();
    let url = Url::parse(&raw)?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(KeyError::NoOrigin(raw));
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let body = canonical_body(request);
    pairs.push((
        BODY_PARAM.to_string(),
        if body.is_empty() { ABSENT.to_string() } else { body },
    ));
    pairs.push((METHOD_PARAM.to_string(), request.method().as_str().to_string()));
    for header in key_headers {
        let value = request
            .headers()
            .get(header)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(ABSENT);
        pairs.push((format!("{HEADER_PARAM_PREFIX}{header}"), value.to_string()));
    }

    // Stable sort: duplicate parameter names keep their relative order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut keyed = Url::parse(&format!(
        "{}/{}",
        origin.ascii_serialization(),
        normalize_path(url.path())
    ))?;
    keyed
        .query_pairs_mut()
        .extend_pairs(pairs.iter().map(|(name, value)| (name.as_str(), value.as_str())))
        .finish();

    Ok(keyed.to_string())
}

/// The original lookup request recovered from a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertedRequest {
    pub url: String,
    pub method: String,
}

/// Strip the engine-reserved parameters from a cache key, recovering the
/// original lookup URL and method.
pub fn revert_key(key: &str) -> Result<RevertedRequest, KeyError> {
    let url = Url::parse(key)?;

    let mut method = Method::GET.as_str().to_string();
    let mut remaining = Vec::new();
    for (name, value) in url.query_pairs() {
        if name == METHOD_PARAM {
            method = value.into_owned();
        } else if !name.starts_with(RESERVED_PREFIX) {
            remaining.push((name.into_owned(), value.into_owned()));
        }
    }

    let mut reverted = url.clone();
    if remaining.is_empty() {
        reverted.set_query(None);
    } else {
        reverted
            .query_pairs_mut()
            .clear()
            .extend_pairs(remaining.iter().map(|(name, value)| (name.as_str(), value.as_str())))
            .finish();
    }

    Ok(RevertedRequest {
        url: reverted.to_string(),
        method,
    })
}

/// Canonical string form of the request body.
///
/// GET/HEAD requests canonicalize to the empty string. JSON objects are
/// re-serialized with top-level keys sorted, form bodies with parameters
/// sorted by name; anything else passes through as text.
fn canonical_body(request: &Request<Bytes>) -> String {
    let method = request.method();
    if method == Method::GET || method == Method::HEAD {
        return String::new();
    }

    let body = request.body();
    if body.is_empty() {
        return String::new();
    }

    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if content_type.contains("application/json") {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Some(object) = value.as_object() {
                let sorted: BTreeMap<&String, &serde_json::Value> = object.iter().collect();
                if let Ok(canonical) = serde_json::to_string(&sorted) {
                    return canonical;
                }
            }
            return value.to_string();
        }
        // Unparsable JSON falls through to the raw text form.
    } else if content_type.contains("application/x-www-form-urlencoded") {
        let mut pairs: Vec<(String, String)> = form_urlencoded::parse(body)
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        return form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(name, value)| (name.as_str(), value.as_str())))
            .finish();
    }

    String::from_utf8_lossy(body).into_owned()
}
