//! Credentials acquisition and request signing.
//!
//! The core never reaches for environment variables or HMAC primitives
//! directly — it calls through [`CredentialsProvider`] and [`RequestSigner`]
//! trait objects injected at start-up, so the core is polymorphic over any
//! implementation of that capability set. IMDS-based instance-role
//! discovery is named in the spec but intentionally not implemented here.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{FsError, Result};
use crate::headers::HeaderMap;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials>;
}

/// Reads `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
pub struct EnvCredentialsProvider;

impl CredentialsProvider for EnvCredentialsProvider {
    fn credentials(&self) -> Result<Credentials> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| FsError::client_fatal("AWS_ACCESS_KEY_ID not set"))?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| FsError::client_fatal("AWS_SECRET_ACCESS_KEY not set"))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Ok(Credentials {
            access_key,
            secret_key,
            session_token,
        })
    }
}

/// Reads a `key:secret` line from a credentials file, mirroring the
/// `~/.passwd-s3fs` convention.
pub struct FileCredentialsProvider {
    pub path: PathBuf,
}

impl CredentialsProvider for FileCredentialsProvider {
    fn credentials(&self) -> Result<Credentials> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| FsError::local_io(self.path.display().to_string(), e))?;
        let line = contents
            .lines()
            .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .ok_or_else(|| FsError::client_fatal("credentials file has no usable entries"))?;
        let (access_key, secret_key) = line
            .split_once(':')
            .ok_or_else(|| FsError::client_fatal("credentials file line must be 'key:secret'"))?;
        Ok(Credentials {
            access_key: access_key.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            session_token: None,
        })
    }
}

/// IMDS instance-role discovery: named by the spec as an external
/// collaborator, not implemented. Always returns `ClientFatal`.
pub struct ImdsCredentialsProvider;

impl CredentialsProvider for ImdsCredentialsProvider {
    fn credentials(&self) -> Result<Credentials> {
        Err(FsError::client_fatal(
            "IMDS credential discovery is not implemented by this core",
        ))
    }
}

/// The `{ sign_request, hash_body, compute_hmac }` capability set is modeled
/// as an injected trait rather than a hard dependency on one TLS/crypto stack.
pub trait RequestSigner: Send + Sync {
    fn hash_body(&self, body: &[u8]) -> String;
    fn compute_hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8>;

    /// Adds whatever headers are needed to authenticate `method` against
    /// `canonical_uri`/`canonical_query`, given the already-hashed body.
    fn sign_request(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        host: &str,
        headers: &mut HeaderMap,
        body_sha256: &str,
        creds: &Credentials,
        region: &str,
    ) -> Result<()>;
}

/// A single-request AWS SigV4 signer. Chunked signing, presigned URLs and
/// S3 Express are out of scope.
pub struct SigV4Signer {
    pub service: String,
}

impl Default for SigV4Signer {
    fn default() -> Self {
        SigV4Signer {
            service: "s3".to_string(),
        }
    }
}

impl SigV4Signer {
    fn canonical_headers_and_signed(&self, headers: &HeaderMap) -> (String, String) {
        let mut pairs: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical = pairs
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect::<String>();
        let signed = pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        (canonical, signed)
    }
}

impl RequestSigner for SigV4Signer {
    fn hash_body(&self, body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    fn compute_hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn sign_request(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        host: &str,
        headers: &mut HeaderMap,
        body_sha256: &str,
        creds: &Credentials,
        region: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        headers.insert("host", host);
        headers.insert("x-amz-date", &amz_date);
        headers.insert("x-amz-content-sha256", body_sha256);
        if let Some(token) = &creds.session_token {
            headers.insert("x-amz-security-token", token);
        }

        let (canonical_headers, signed_headers) = self.canonical_headers_and_signed(headers);

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{body_sha256}"
        );
        let hashed_canonical_request = hex::encode(Sha256::digest(canonical_request.as_bytes()));

        let credential_scope = format!("{date_stamp}/{region}/{}/aws4_request", self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{hashed_canonical_request}"
        );

        let k_date = self.compute_hmac(format!("AWS4{}", creds.secret_key).as_bytes(), date_stamp.as_bytes());
        let k_region = self.compute_hmac(&k_date, region.as_bytes());
        let k_service = self.compute_hmac(&k_region, self.service.as_bytes());
        let k_signing = self.compute_hmac(&k_service, b"aws4_request");
        let signature = hex::encode(self.compute_hmac(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            creds.access_key
        );
        headers.insert("authorization", authorization);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_provider_reads_standard_variables() {
        std::env::set_var("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "secret");
        std::env::remove_var("AWS_SESSION_TOKEN");

        let creds = EnvCredentialsProvider.credentials().unwrap();
        assert_eq!(creds.access_key, "AKIDEXAMPLE");
        assert_eq!(creds.secret_key, "secret");
        assert!(creds.session_token.is_none());
    }

    #[test]
    fn file_provider_parses_key_colon_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd-objectfs");
        fs::write(&path, "AKIDEXAMPLE:secretkey\n").unwrap();

        let creds = FileCredentialsProvider { path }.credentials().unwrap();
        assert_eq!(creds.access_key, "AKIDEXAMPLE");
        assert_eq!(creds.secret_key, "secretkey");
    }

    #[test]
    fn imds_provider_is_unimplemented() {
        assert!(ImdsCredentialsProvider.credentials().is_err());
    }

    #[test]
    fn sigv4_signer_produces_authorization_header() {
        let signer = SigV4Signer::default();
        let creds = Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
            session_token: None,
        };
        let mut headers = HeaderMap::new();
        let body_hash = signer.hash_body(b"");

        signer
            .sign_request(
                "GET",
                "/my-key",
                "",
                "example-bucket.s3.amazonaws.com",
                &mut headers,
                &body_hash,
                &creds,
                "us-east-1",
            )
            .unwrap();

        let auth = headers.get("authorization").unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("SignedHeaders="));
        assert!(headers.get("x-amz-date").is_some());
    }

    #[test]
    fn hmac_is_deterministic_for_same_inputs() {
        let signer = SigV4Signer::default();
        let a = signer.compute_hmac(b"key", b"data");
        let b = signer.compute_hmac(b"key", b"data");
        assert_eq!(a, b);
    }
}
