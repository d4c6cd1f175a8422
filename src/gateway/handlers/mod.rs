pub mod admin;
pub mod health;
pub mod spike;

use axum::http::HeaderMap;

/// Trace id: propagate the caller's if present, else mint one.
pub fn trace_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_propagated() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", "abc-123".parse().unwrap());
        assert_eq!(trace_id_from(&headers), "abc-123");
    }

    #[test]
    fn test_trace_id_minted_when_absent() {
        let headers = HeaderMap::new();
        let trace = trace_id_from(&headers);
        assert!(!trace.is_empty());
    }
}
