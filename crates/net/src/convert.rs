//! Wire conventions shared by the server and the HTTP replica client.

use axum::http::{HeaderMap, HeaderValue};
use ringkv_common::{NodeId, Timestamp};

pub const ENTITY_PATH: &str = "/v0/entity";
pub const STATUS_PATH: &str = "/v0/status";
pub const METRICS_PATH: &str = "/metrics";

/// Marks a request as coming from another node's coordinator.
pub const INTERNAL_HEADER: &str = "x-internal";
/// Version timestamp in nanoseconds, on requests and responses.
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

pub const NOT_ENOUGH_REPLICAS: &str = "Not Enough Replicas";

pub fn is_internal(headers: &HeaderMap) -> bool {
    headers
        .get(INTERNAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// The `X-Timestamp` header, `Ok(None)` when absent.
pub fn timestamp_from_headers(headers: &HeaderMap) -> Result<Option<Timestamp>, String> {
    let Some(value) = headers.get(TIMESTAMP_HEADER) else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .map_err(|_| "timestamp header is not ASCII".to_string())?;
    text.parse::<Timestamp>().map(Some).map_err(|e| e.to_string())
}

pub fn timestamp_header_value(timestamp: Timestamp) -> HeaderValue {
    HeaderValue::from(timestamp.as_nanos())
}

/// The entity URL for `key` on `node`. Keys travel as the `id` query
/// parameter, so they must be UTF-8.
pub fn entity_url(node: &NodeId, key: &[u8]) -> Result<reqwest::Url, String> {
    let key = std::str::from_utf8(key).map_err(|_| "key is not valid UTF-8".to_string())?;
    let mut url = reqwest::Url::parse(node.as_str())
        .map_err(|e| format!("invalid node address {}: {}", node, e))?;
    url.set_path(ENTITY_PATH);
    url.query_pairs_mut().clear().append_pair("id", key);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_header() {
        let mut headers = HeaderMap::new();
        assert!(!is_internal(&headers));
        headers.insert(INTERNAL_HEADER, HeaderValue::from_static("true"));
        assert!(is_internal(&headers));
        headers.insert(INTERNAL_HEADER, HeaderValue::from_static("no"));
        assert!(!is_internal(&headers));
    }

    #[test]
    fn test_timestamp_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(timestamp_from_headers(&headers), Ok(None));

        headers.insert(
            TIMESTAMP_HEADER,
            timestamp_header_value(Timestamp::from_nanos(1_700_000_000_123)),
        );
        assert_eq!(
            timestamp_from_headers(&headers),
            Ok(Some(Timestamp::from_nanos(1_700_000_000_123)))
        );

        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static("soon"));
        assert!(timestamp_from_headers(&headers).is_err());
    }

    #[test]
    fn test_entity_url_encodes_key() {
        let node = NodeId::new("http://127.0.0.1:7000");
        let url = entity_url(&node, b"a b&c=d").unwrap();
        assert_eq!(url.path(), ENTITY_PATH);
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs, vec![("id".to_string(), "a b&c=d".to_string())]);
    }

    #[test]
    fn test_entity_url_rejects_binary_key() {
        let node = NodeId::new("http://127.0.0.1:7000");
        assert!(entity_url(&node, &[0xff, 0xfe]).is_err());
    }
}
