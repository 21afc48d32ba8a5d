//! Injection of configured extra OAuth parameters (e.g. an RFC 8707
//! `resource` indicator) into authorization and token requests. All other
//! traffic passes through untouched.

use std::collections::HashMap;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use url::Url;

/// Parameters the OAuth machinery owns. Configured `extra_params` must
/// never shadow these; config validation rejects them up front.
pub const RESERVED_OAUTH_PARAMS: &[&str] = &[
    "client_id",
    "redirect_uri",
    "code",
    "state",
    "code_verifier",
    "grant_type",
    "refresh_token",
];

pub fn validate_extra_params(extra: &HashMap<String, String>) -> Result<(), String> {
    for key in extra.keys() {
        if RESERVED_OAUTH_PARAMS.contains(&key.as_str()) {
            return Err(key.clone());
        }
    }
    Ok(())
}

/// Merge `extra` into the query string of `url`, overwriting collisions.
/// Original parameter order is preserved; new parameters are appended in
/// sorted order so output is deterministic.
pub fn merge_query(url: &Url, extra: &HashMap<String, String>) -> Url {
    let mut out = url.clone();
    let existing: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut appended: Vec<(&String, &String)> = extra
        .iter()
        .filter(|(k, _)| !existing.iter().any(|(ek, _)| ek == *k))
        .collect();
    appended.sort_by(|a, b| a.0.cmp(b.0));

    out.query_pairs_mut().clear();
    {
        let mut pairs = out.query_pairs_mut();
        for (k, v) in &existing {
            match extra.get(k) {
                Some(replacement) => pairs.append_pair(k, replacement),
                None => pairs.append_pair(k, v),
            };
        }
        for (k, v) in appended {
            pairs.append_pair(k, v);
        }
    }
    if out.query() == Some("") {
        out.set_query(None);
    }
    out
}

/// Merge `extra` into a form-encoded body, overwriting collisions.
pub fn merge_form(body: &str, extra: &HashMap<String, String>) -> String {
    let existing: Vec<(String, String)> = url::form_urlencoded::parse(body.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut appended: Vec<(&String, &String)> = extra
        .iter()
        .filter(|(k, _)| !existing.iter().any(|(ek, _)| ek == *k))
        .collect();
    appended.sort_by(|a, b| a.0.cmp(b.0));

    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &existing {
        match extra.get(k) {
            Some(replacement) => ser.append_pair(k, replacement),
            None => ser.append_pair(k, v),
        };
    }
    for (k, v) in appended {
        ser.append_pair(k, v);
    }
    ser.finish()
}

fn is_authorize_request(req: &reqwest::Request) -> bool {
    req.method() == reqwest::Method::GET && req.url().path().ends_with("/authorize")
}

fn is_token_request(req: &reqwest::Request) -> bool {
    if req.method() != reqwest::Method::POST || !req.url().path().ends_with("/token") {
        return false;
    }
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Produce a modified clone of `req` with `extra` merged in, or `None`
/// when the request is not an OAuth authorization/token request (callers
/// then send the original untouched). The input request is never mutated.
pub fn inject_request(
    req: &reqwest::Request,
    extra: &HashMap<String, String>,
) -> Option<reqwest::Request> {
    if extra.is_empty() {
        return None;
    }
    if is_authorize_request(req) {
        let mut cloned = req.try_clone()?;
        *cloned.url_mut() = merge_query(req.url(), extra);
        return Some(cloned);
    }
    if is_token_request(req) {
        let body = req.body().and_then(|b| b.as_bytes())?;
        let body = std::str::from_utf8(body).ok()?;
        let merged = merge_form(body, extra);
        let mut cloned = req.try_clone()?;
        cloned
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(merged.len() as u64));
        *cloned.body_mut() = Some(reqwest::Body::from(merged));
        return Some(cloned);
    }
    None
}
