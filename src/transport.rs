//! The object-store HTTP transport. Other components depend only on
//! [`ObjectStoreClient`]; `ReqwestObjectStoreClient` is the one concrete
//! collaborator the worker pool's task closures reach for.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::credentials::{Credentials, CredentialsProvider, RequestSigner};
use crate::error::{FsError, Result};
use crate::headers::HeaderMap;
use crate::xml;

#[derive(Debug, Clone)]
pub struct HeadResult {
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct GetResult {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub etag: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListObjectsResult {
    pub keys: Vec<xml::ListEntry>,
    pub common_prefixes: Vec<String>,
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// The interface the core consumes. Every method takes
/// already-built request parameters; none of it knows about `reqwest` or
/// `quick-xml`.
pub trait ObjectStoreClient: Send + Sync {
    fn head(&self, key: &str) -> Result<HeadResult>;
    fn get_range(&self, key: &str, range: Option<(u64, u64)>) -> Result<GetResult>;
    fn put(&self, key: &str, body: Vec<u8>, headers: &HeaderMap) -> Result<PutResult>;
    fn put_copy(&self, key: &str, copy_source: &str, headers: &HeaderMap) -> Result<PutResult>;
    fn list_objects_v2(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> Result<ListObjectsResult>;
    fn delete_object(&self, key: &str) -> Result<()>;

    fn create_multipart_upload(&self, key: &str, headers: &HeaderMap) -> Result<String>;
    fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, body: Vec<u8>) -> Result<String>;
    fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        copy_source: &str,
        range: (u64, u64),
    ) -> Result<String>;
    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<String>;
    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// The default `ObjectStoreClient`: a pooled blocking `reqwest` client,
/// SigV4-signed via an injected [`RequestSigner`], decoding XML bodies with
/// `quick-xml`.
pub struct ReqwestObjectStoreClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    bucket: String,
    region: String,
    path_style: bool,
    credentials: Arc<dyn CredentialsProvider>,
    signer: Arc<dyn RequestSigner>,
}

impl ReqwestObjectStoreClient {
    pub fn new(
        cfg: &Config,
        region: impl Into<String>,
        credentials: Arc<dyn CredentialsProvider>,
        signer: Arc<dyn RequestSigner>,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| FsError::client_fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(ReqwestObjectStoreClient {
            client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            bucket: cfg.bucket.clone(),
            region: region.into(),
            path_style: cfg.path_style,
            credentials,
            signer,
        })
    }

    fn object_url(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.path_style {
            format!("{}/{}/{}", self.endpoint, self.bucket, key)
        } else {
            // Virtual-hosted style: bucket is a subdomain of the endpoint host.
            let without_scheme = self
                .endpoint
                .split_once("://")
                .map(|(_, rest)| rest)
                .unwrap_or(&self.endpoint);
            let scheme = if self.endpoint.starts_with("https") {
                "https"
            } else {
                "http"
            };
            format!("{scheme}://{}.{}/{}", self.bucket, without_scheme, key)
        }
    }

    fn host_of(&self, url: &str) -> String {
        url.split_once("://")
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default()
            .to_string()
    }

    fn canonical_path(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.path_style {
            format!("/{}/{}", self.bucket, key)
        } else {
            format!("/{key}")
        }
    }

    fn sign_and_build(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &str,
        mut headers: HeaderMap,
        body: &[u8],
    ) -> Result<reqwest::blocking::RequestBuilder> {
        let creds: Credentials = self.credentials.credentials()?;
        let url = if query.is_empty() {
            self.object_url(key)
        } else {
            format!("{}?{}", self.object_url(key), query)
        };
        let host = self.host_of(&url);
        let body_hash = self.signer.hash_body(body);

        self.signer.sign_request(
            method.as_str(),
            &self.canonical_path(key),
            query,
            &host,
            &mut headers,
            &body_hash,
            &creds,
            &self.region,
        )?;

        let mut req = self.client.request(method, url);
        for (name, value) in headers.iter() {
            req = req.header(name, value);
        }
        Ok(req)
    }

    fn classify(&self, key: &str, status: reqwest::StatusCode, body: &str) -> FsError {
        let detail = xml::parse_error_response(body)
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_else(|| format!("HTTP {status}"));
        FsError::from_status(status.as_u16(), key, detail)
    }

    fn headers_from_response(resp: &reqwest::blocking::Response) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in resp.headers().iter() {
            if let Ok(v) = value.to_str() {
                out.insert(name.as_str().to_string(), v.to_string());
            }
        }
        out
    }

    fn etag_header(headers: &HeaderMap) -> Result<String> {
        headers
            .get("etag")
            .map(|s| s.to_string())
            .ok_or_else(|| FsError::integrity("unknown", "response carried no ETag header"))
    }
}

impl ObjectStoreClient for ReqwestObjectStoreClient {
    fn head(&self, key: &str) -> Result<HeadResult> {
        let req = self.sign_and_build(reqwest::Method::HEAD, key, "", HeaderMap::new(), b"")?;
        let resp = req
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(self.classify(key, status, &body));
        }
        Ok(HeadResult {
            headers: Self::headers_from_response(&resp),
        })
    }

    fn get_range(&self, key: &str, range: Option<(u64, u64)>) -> Result<GetResult> {
        let mut headers = HeaderMap::new();
        if let Some((start, len)) = range {
            headers.insert("range", format!("bytes={start}-{}", start + len - 1));
        }
        let req = self.sign_and_build(reqwest::Method::GET, key, "", headers, b"")?;
        let resp = req
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(self.classify(key, status, &body));
        }
        let out_headers = Self::headers_from_response(&resp);
        let body = resp
            .bytes()
            .map_err(|e| FsError::server_transient(e.to_string()))?
            .to_vec();
        Ok(GetResult {
            headers: out_headers,
            body,
        })
    }

    fn put(&self, key: &str, body: Vec<u8>, headers: &HeaderMap) -> Result<PutResult> {
        let req = self.sign_and_build(reqwest::Method::PUT, key, "", headers.clone(), &body)?;
        let resp = req
            .body(body)
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(self.classify(key, status, &body));
        }
        let out_headers = Self::headers_from_response(&resp);
        Ok(PutResult {
            etag: Self::etag_header(&out_headers)?,
        })
    }

    fn put_copy(&self, key: &str, copy_source: &str, headers: &HeaderMap) -> Result<PutResult> {
        let mut headers = headers.clone();
        headers.insert("x-amz-copy-source", copy_source.to_string());
        headers.insert("x-amz-metadata-directive", "REPLACE".to_string());
        let req = self.sign_and_build(reqwest::Method::PUT, key, "", headers, b"")?;
        let resp = req
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(self.classify(key, status, &body));
        }
        let out_headers = Self::headers_from_response(&resp);
        Ok(PutResult {
            etag: Self::etag_header(&out_headers)?,
        })
    }

    fn list_objects_v2(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> Result<ListObjectsResult> {
        let mut query = format!("list-type=2&prefix={}", urlencode(prefix));
        if let Some(d) = delimiter {
            query.push_str(&format!("&delimiter={}", urlencode(d)));
        }
        if let Some(token) = continuation_token {
            query.push_str(&format!("&continuation-token={}", urlencode(token)));
        }
        let req = self.sign_and_build(reqwest::Method::GET, "", &query, HeaderMap::new(), b"")?;
        let resp = req
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(self.classify(prefix, status, &body));
        }
        let parsed = xml::parse_list_bucket(&body)?;
        Ok(ListObjectsResult {
            keys: parsed.contents,
            common_prefixes: parsed.common_prefixes.into_iter().map(|p| p.prefix).collect(),
            next_continuation_token: parsed.next_continuation_token,
            is_truncated: parsed.is_truncated,
        })
    }

    fn delete_object(&self, key: &str) -> Result<()> {
        let req = self.sign_and_build(reqwest::Method::DELETE, key, "", HeaderMap::new(), b"")?;
        let resp = req
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().unwrap_or_default();
            return Err(self.classify(key, status, &body));
        }
        Ok(())
    }

    fn create_multipart_upload(&self, key: &str, headers: &HeaderMap) -> Result<String> {
        let req = self.sign_and_build(reqwest::Method::POST, key, "uploads", headers.clone(), b"")?;
        let resp = req
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(self.classify(key, status, &body));
        }
        Ok(xml::parse_initiate_multipart(&body)?.upload_id)
    }

    fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, body: Vec<u8>) -> Result<String> {
        let query = format!("partNumber={part_number}&uploadId={upload_id}");
        let req = self.sign_and_build(reqwest::Method::PUT, key, &query, HeaderMap::new(), &body)?;
        let resp = req
            .body(body)
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(self.classify(key, status, &body));
        }
        let headers = Self::headers_from_response(&resp);
        Self::etag_header(&headers)
    }

    fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        copy_source: &str,
        range: (u64, u64),
    ) -> Result<String> {
        let query = format!("partNumber={part_number}&uploadId={upload_id}");
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-copy-source", copy_source.to_string());
        headers.insert(
            "x-amz-copy-source-range",
            format!("bytes={}-{}", range.0, range.0 + range.1 - 1),
        );
        let req = self.sign_and_build(reqwest::Method::PUT, key, &query, headers, b"")?;
        let resp = req
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(self.classify(key, status, &body));
        }
        // CopyPartResult carries the ETag in the XML body, not a header.
        quick_xml_etag(&body)
    }

    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<String> {
        let body = xml::serialize_complete_multipart(parts)?;
        let query = format!("uploadId={upload_id}");
        let req = self.sign_and_build(
            reqwest::Method::POST,
            key,
            &query,
            HeaderMap::new(),
            body.as_bytes(),
        )?;
        let resp = req
            .body(body)
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(self.classify(key, status, &text));
        }
        Ok(xml::parse_complete_multipart(&text)?.etag)
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let query = format!("uploadId={upload_id}");
        let req = self.sign_and_build(reqwest::Method::DELETE, key, &query, HeaderMap::new(), b"")?;
        let resp = req
            .send()
            .map_err(|e| FsError::server_transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(self.classify(key, status, &body));
        }
        Ok(())
    }
}

/// `CopyPartResult` carries its ETag as XML body content, not a header;
/// a tiny ad-hoc parse avoids a whole extra serde model for one field.
fn quick_xml_etag(body: &str) -> Result<String> {
    #[derive(serde::Deserialize)]
    #[serde(rename = "CopyPartResult")]
    struct CopyPartResult {
        #[serde(rename = "ETag")]
        etag: String,
    }
    quick_xml::de::from_str::<CopyPartResult>(body)
        .map(|r| r.etag)
        .map_err(|e| FsError::client_fatal(format!("malformed CopyPartResult: {e}")))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_leaves_unreserved_characters_untouched() {
        assert_eq!(urlencode("dir/sub-file_1.0~a"), "dir/sub-file_1.0~a");
    }

    #[test]
    fn urlencode_escapes_spaces_and_special_characters() {
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("key?"), "key%3F");
    }
}
