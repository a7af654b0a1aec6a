//! S3 mirror of the per-user document directories.
//!
//! Objects live under `<prefix><user_id>/<file>.pdf` (default prefix
//! `source/`). [`sync_user`] downloads any missing or changed PDFs into the
//! user's local directory before ingestion, and [`upload`] mirrors API
//! uploads back to the bucket.
//!
//! Requests use the S3 REST API signed with AWS Signature V4 (`hmac` +
//! `sha2`). Custom endpoints (MinIO, LocalStack) use path-style addressing.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional)

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{Config, S3Config};
use crate::loader::{sanitize_filename, tenant_dir};

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Metadata for a single object, parsed from a `ListObjectsV2` response.
#[derive(Debug, Clone, PartialEq)]
struct S3Object {
    key: String,
    size: i64,
}

/// Key prefix holding one user's documents, e.g. `source/alice/`.
pub fn user_prefix(s3: &S3Config, user_id: &str) -> String {
    let base = s3.prefix.trim_end_matches('/');
    if base.is_empty() {
        format!("{}/", user_id)
    } else {
        format!("{}/{}/", base, user_id)
    }
}

/// Download the user's PDFs that are missing locally or differ in size.
///
/// Returns the number of files written.
pub async fn sync_user(config: &Config, s3: &S3Config, user_id: &str) -> Result<usize> {
    let dir = tenant_dir(config, user_id)?;
    let creds = AwsCredentials::from_env()?;
    let client = reqwest::Client::new();
    let prefix = user_prefix(s3, user_id);

    let objects = list_objects(s3, &creds, &client, &prefix).await?;
    debug!(bucket = %s3.bucket, %prefix, objects = objects.len(), "listed objects");

    let mut written = 0;
    for obj in &objects {
        let name = match sanitize_filename(&obj.key) {
            Ok(name) => name,
            Err(_) => continue,
        };

        let local = dir.join(&name);
        if let Ok(meta) = std::fs::metadata(&local) {
            if meta.len() as i64 == obj.size {
                continue;
            }
        }

        let bytes = match get_object(s3, &creds, &client, &obj.key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(bucket = %s3.bucket, key = %obj.key, error = %e, "download failed");
                continue;
            }
        };

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        std::fs::write(&local, &bytes)
            .with_context(|| format!("Failed to write {}", local.display()))?;
        written += 1;
    }

    info!(user = user_id, downloaded = written, "synced documents from S3");
    Ok(written)
}

/// Store an uploaded document under the user's prefix.
pub async fn upload(s3: &S3Config, user_id: &str, name: &str, bytes: &[u8]) -> Result<()> {
    let creds = AwsCredentials::from_env()?;
    let client = reqwest::Client::new();
    let key = format!("{}{}", user_prefix(s3, user_id), name);

    let target = object_target(s3, &key);
    let payload_hash = hex_sha256(bytes);
    let signed = sign(
        "PUT",
        &target.host,
        &target.canonical_uri,
        "",
        &payload_hash,
        &s3.region,
        &creds,
        Utc::now(),
    )?;

    let resp = signed
        .apply(client.put(&target.url))
        .header("Content-Type", "application/pdf")
        .body(bytes.to_vec())
        .send()
        .await
        .map_err(|e| anyhow!("Failed to put s3://{}/{}: {}", s3.bucket, key, e))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!(
            "S3 PutObject failed (HTTP {}) for key '{}': {}",
            status,
            key,
            body.chars().take(500).collect::<String>()
        );
    }

    debug!(bucket = %s3.bucket, %key, "uploaded object");
    Ok(())
}

/// List every object under `prefix`, following continuation tokens.
async fn list_objects(
    s3: &S3Config,
    creds: &AwsCredentials,
    client: &reqwest::Client,
    prefix: &str,
) -> Result<Vec<S3Object>> {
    let mut objects = Vec::new();
    let mut continuation_token: Option<String> = None;

    loop {
        let mut params = vec![
            ("list-type".to_string(), "2".to_string()),
            ("max-keys".to_string(), "1000".to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        if let Some(ref token) = continuation_token {
            params.push(("continuation-token".to_string(), token.clone()));
        }
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let target = bucket_target(s3);
        let payload_hash = hex_sha256(b"");
        let signed = sign(
            "GET",
            &target.host,
            &target.canonical_uri,
            &query,
            &payload_hash,
            &s3.region,
            creds,
            Utc::now(),
        )?;

        let resp = signed
            .apply(client.get(format!("{}?{}", target.url, query)))
            .send()
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to list S3 objects in s3://{}/{}: {}",
                    s3.bucket,
                    prefix,
                    e
                )
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 ListObjectsV2 failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        let xml_body = resp.text().await?;
        let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
        objects.extend(batch);

        if is_truncated && next_token.is_some() {
            continuation_token = next_token;
        } else {
            break;
        }
    }

    Ok(objects)
}

async fn get_object(
    s3: &S3Config,
    creds: &AwsCredentials,
    client: &reqwest::Client,
    key: &str,
) -> Result<Vec<u8>> {
    let target = object_target(s3, key);
    let payload_hash = hex_sha256(b"");
    let signed = sign(
        "GET",
        &target.host,
        &target.canonical_uri,
        "",
        &payload_hash,
        &s3.region,
        creds,
        Utc::now(),
    )?;

    let resp = signed
        .apply(client.get(&target.url))
        .send()
        .await
        .map_err(|e| anyhow!("Failed to get s3://{}/{}: {}", s3.bucket, key, e))?;

    if !resp.status().is_success() {
        bail!(
            "S3 GetObject failed (HTTP {}) for key '{}'",
            resp.status(),
            key
        );
    }

    Ok(resp.bytes().await?.to_vec())
}

// ============ Addressing ============

struct Target {
    host: String,
    canonical_uri: String,
    url: String,
}

/// Scheme and host. Custom endpoints keep their scheme; AWS is
/// virtual-hosted over HTTPS.
fn endpoint(s3: &S3Config) -> (String, String, bool) {
    match s3.endpoint_url {
        Some(ref url) => {
            let scheme = if url.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            let host = url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            (scheme.to_string(), host, true)
        }
        None => (
            "https".to_string(),
            format!("{}.s3.{}.amazonaws.com", s3.bucket, s3.region),
            false,
        ),
    }
}

fn bucket_target(s3: &S3Config) -> Target {
    let (scheme, host, path_style) = endpoint(s3);
    let canonical_uri = if path_style {
        format!("/{}", uri_encode(&s3.bucket))
    } else {
        "/".to_string()
    };
    Target {
        url: format!("{}://{}{}", scheme, host, canonical_uri),
        host,
        canonical_uri,
    }
}

fn object_target(s3: &S3Config, key: &str) -> Target {
    let (scheme, host, path_style) = endpoint(s3);
    let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
    let canonical_uri = if path_style {
        format!("/{}/{}", uri_encode(&s3.bucket), encoded_key)
    } else {
        format!("/{}", encoded_key)
    };
    Target {
        url: format!("{}://{}{}", scheme, host, canonical_uri),
        host,
        canonical_uri,
    }
}

// ============ AWS SigV4 ============

/// Headers to attach to a signed request.
struct SignedRequest {
    authorization: String,
    amz_date: String,
    payload_hash: String,
    session_token: Option<String>,
}

impl SignedRequest {
    fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .header("Authorization", &self.authorization)
            .header("x-amz-content-sha256", &self.payload_hash)
            .header("x-amz-date", &self.amz_date);
        match self.session_token {
            Some(ref token) => builder.header("x-amz-security-token", token),
            None => builder,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn sign(
    method: &str,
    host: &str,
    canonical_uri: &str,
    canonical_query: &str,
    payload_hash: &str,
    region: &str,
    creds: &AwsCredentials,
    now: DateTime<Utc>,
) -> Result<SignedRequest> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3")?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        ),
        amz_date,
        payload_hash: payload_hash.to_string(),
        session_token: creds.session_token.clone(),
    })
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything but `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ XML Parsing ============

/// Objects, truncation flag and continuation token from a `ListObjectsV2`
/// body. Directory placeholders (keys ending in `/`) are dropped.
fn parse_list_objects_response(xml: &str) -> (Vec<S3Object>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut objects = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        objects.push(S3Object { key, size });
    }

    (objects, is_truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}
