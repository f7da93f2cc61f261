//! Serde models for the S3 XML bodies the core's transport needs to read or
//! write. Decoding goes through `quick-xml`'s serde integration;
//! nothing above the transport layer touches XML directly.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename = "Error")]
pub struct ErrorResponse {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "InitiateMultipartUploadResult")]
pub struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUploadRequest {
    #[serde(rename = "Part")]
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Serialize)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "CompleteMultipartUploadResult")]
pub struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename = "ListBucketResult")]
pub struct ListBucketResult {
    #[serde(rename = "Contents", default)]
    pub contents: Vec<ListEntry>,
    #[serde(rename = "CommonPrefixes", default)]
    pub common_prefixes: Vec<CommonPrefix>,
    #[serde(rename = "NextContinuationToken")]
    pub next_continuation_token: Option<String>,
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "ETag", default)]
    pub etag: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(rename = "LastModified", default)]
    pub last_modified: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommonPrefix {
    #[serde(rename = "Prefix")]
    pub prefix: String,
}

pub fn parse_initiate_multipart(body: &str) -> Result<InitiateMultipartUploadResult> {
    quick_xml::de::from_str(body)
        .map_err(|e| FsError::client_fatal(format!("malformed InitiateMultipartUploadResult: {e}")))
}

pub fn parse_complete_multipart(body: &str) -> Result<CompleteMultipartUploadResult> {
    quick_xml::de::from_str(body)
        .map_err(|e| FsError::client_fatal(format!("malformed CompleteMultipartUploadResult: {e}")))
}

pub fn parse_list_bucket(body: &str) -> Result<ListBucketResult> {
    quick_xml::de::from_str(body)
        .map_err(|e| FsError::client_fatal(format!("malformed ListBucketResult: {e}")))
}

pub fn parse_error_response(body: &str) -> Option<ErrorResponse> {
    quick_xml::de::from_str(body).ok()
}

pub fn serialize_complete_multipart(parts: &[(u32, String)]) -> Result<String> {
    let req = CompleteMultipartUploadRequest {
        parts: parts
            .iter()
            .map(|(n, etag)| CompletedPart {
                part_number: *n,
                etag: etag.clone(),
            })
            .collect(),
    };
    quick_xml::se::to_string(&req)
        .map_err(|e| FsError::client_fatal(format!("failed to serialize CompleteMultipartUpload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_initiate_multipart_upload_result() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult>
  <Bucket>example-bucket</Bucket>
  <Key>big-file.bin</Key>
  <UploadId>abc123</UploadId>
</InitiateMultipartUploadResult>"#;
        let parsed = parse_initiate_multipart(xml).unwrap();
        assert_eq!(parsed.upload_id, "abc123");
    }

    #[test]
    fn parses_list_bucket_result_with_common_prefixes() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Contents><Key>dir/a.txt</Key><ETag>"e1"</ETag><Size>5</Size><LastModified>2024-01-01T00:00:00Z</LastModified></Contents>
  <CommonPrefixes><Prefix>dir/sub/</Prefix></CommonPrefixes>
  <IsTruncated>false</IsTruncated>
</ListBucketResult>"#;
        let parsed = parse_list_bucket(xml).unwrap();
        assert_eq!(parsed.contents.len(), 1);
        assert_eq!(parsed.contents[0].key, "dir/a.txt");
        assert_eq!(parsed.common_prefixes[0].prefix, "dir/sub/");
        assert!(!parsed.is_truncated);
    }

    #[test]
    fn serializes_complete_multipart_request_in_part_order() {
        let xml = serialize_complete_multipart(&[
            (1, "\"e1\"".to_string()),
            (2, "\"e2\"".to_string()),
        ])
        .unwrap();
        let p1 = xml.find("e1").unwrap();
        let p2 = xml.find("e2").unwrap();
        assert!(p1 < p2);
    }

    #[test]
    fn parses_error_response() {
        let xml = r#"<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"#;
        let parsed = parse_error_response(xml).unwrap();
        assert_eq!(parsed.code, "NoSuchKey");
    }
}
