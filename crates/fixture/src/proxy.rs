//! Recording proxy store
//!
//! Named buckets of captured requests. `proxywrite` appends the
//! incoming request and answers with its offset; `proxyread` returns a
//! stored request verbatim with its metadata in response headers.

use std::collections::HashMap;

use parking_lot::RwLock;

/// One captured request
#[derive(Debug, Clone)]
pub struct StoredRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// All proxy buckets of a fixture server
#[derive(Debug, Default)]
pub struct ProxyStore {
    buckets: RwLock<HashMap<String, Vec<StoredRequest>>>,
}

impl ProxyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request to the named bucket, returning its offset.
    pub fn write(&self, name: &str, request: StoredRequest) -> usize {
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(name.to_string()).or_default();
        bucket.push(request);
        bucket.len() - 1
    }

    /// Read the request at `offset`, along with the current bucket
    /// size.
    pub fn read(&self, name: &str, offset: usize) -> Option<(StoredRequest, usize)> {
        let buckets = self.buckets.read();
        let bucket = buckets.get(name)?;
        Some((bucket.get(offset)?.clone(), bucket.len()))
    }

    /// Number of stored requests in a bucket.
    pub fn count(&self, name: &str) -> usize {
        self.buckets.read().get(name).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: &str) -> StoredRequest {
        StoredRequest {
            method: method.to_string(),
            path: "/x".to_string(),
            query: String::new(),
            headers: vec![],
            body: b"payload".to_vec(),
        }
    }

    #[test]
    fn test_write_read_offsets() {
        let store = ProxyStore::new();
        assert_eq!(store.write("a", req("POST")), 0);
        assert_eq!(store.write("a", req("PUT")), 1);
        assert_eq!(store.write("b", req("GET")), 0);

        let (r, count) = store.read("a", 1).unwrap();
        assert_eq!(r.method, "PUT");
        assert_eq!(count, 2);
        assert!(store.read("a", 2).is_none());
        assert!(store.read("missing", 0).is_none());
    }
}
