//! AWS Signature Version 4 request signing.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use hyper::Uri;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Service name Bedrock Runtime signs under.
pub const BEDROCK_SERVICE: &str = "bedrock";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Result<Self, AuthError> {
        let access_key = access_key.into();
        let secret_key = secret_key.into();
        if access_key.trim().is_empty() {
            return Err(AuthError::MissingCredentials("access key is empty".to_string()));
        }
        if secret_key.trim().is_empty() {
            return Err(AuthError::MissingCredentials("secret key is empty".to_string()));
        }
        Ok(Self {
            access_key,
            secret_key,
            session_token: session_token.filter(|t| !t.trim().is_empty()),
        })
    }
}

/// Request time in the two formats SigV4 needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigV4Timestamp {
    /// `YYYYMMDD'T'HHMMSS'Z'`
    pub amz_date: String,
    /// `YYYYMMDD`
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        Self {
            amz_date: datetime.format("%Y%m%dT%H%M%SZ").to_string(),
            date: datetime.format("%Y%m%d").to_string(),
        }
    }

    pub fn from_amz_date(amz_date: &str) -> Result<Self, AuthError> {
        let amz_date = amz_date.trim();
        let well_formed = amz_date.len() == 16
            && amz_date.as_bytes()[8] == b'T'
            && amz_date.ends_with('Z')
            && amz_date[..8].bytes().all(|b| b.is_ascii_digit());
        if !well_formed {
            return Err(AuthError::Signing(format!(
                "invalid amz date '{}'",
                amz_date
            )));
        }
        Ok(Self {
            amz_date: amz_date.to_string(),
            date: amz_date[..8].to_string(),
        })
    }
}

/// Headers the signer adds to the outbound request.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub host: String,
    pub security_token: Option<String>,
    pub signed_headers: String,
    pub canonical_request: String,
}

impl SignedRequest {
    pub fn apply(&self, builder: hyper::http::request::Builder) -> hyper::http::request::Builder {
        let builder = builder
            .header("host", &self.host)
            .header("x-amz-date", &self.amz_date)
            .header("x-amz-content-sha256", &self.content_sha256)
            .header("authorization", &self.authorization);
        match &self.security_token {
            Some(token) => builder.header("x-amz-security-token", token),
            None => builder,
        }
    }
}

#[derive(Debug)]
struct CachedKey {
    date: String,
    access_key: String,
    secret_key: String,
    key: Vec<u8>,
}

/// SigV4 signer for one region and service.
///
/// The derived signing key only changes once a day, so the last one is kept
/// and reused while date and credentials match.
#[derive(Debug)]
pub struct SigV4Signer {
    region: String,
    service: String,
    cached_key: Mutex<Option<CachedKey>>,
}

impl SigV4Signer {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            cached_key: Mutex::new(None),
        }
    }

    pub fn bedrock(region: impl Into<String>) -> Self {
        Self::new(region, BEDROCK_SERVICE)
    }

    /// Sign a request. `headers` are the headers that will be sent besides
    /// the ones this returns; they are all included in the signature.
    pub fn sign(
        &self,
        credentials: &Credentials,
        method: &str,
        uri: &Uri,
        headers: &[(&str, &str)],
        body: &[u8],
        timestamp: &SigV4Timestamp,
    ) -> Result<SignedRequest, AuthError> {
        let host = match (uri.host(), uri.port_u16()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(AuthError::Signing(format!("url '{}' has no host", uri)));
            }
        };

        let payload_hash = sha256_hex(body);
        let mut canonical = BTreeMap::<String, String>::new();
        for (name, value) in headers {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            let value = normalize_header_value(value);
            canonical
                .entry(name)
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(&value);
                })
                .or_insert_with(|| value.clone());
        }
        canonical.insert("host".to_string(), host.clone());
        canonical.insert("x-amz-date".to_string(), timestamp.amz_date.clone());
        canonical.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        if let Some(token) = &credentials.session_token {
            canonical.insert("x-amz-security-token".to_string(), normalize_header_value(token));
        }

        let mut canonical_headers = String::new();
        for (name, value) in &canonical {
            let _ = writeln!(canonical_headers, "{}:{}", name, value);
        }
        let signed_headers = canonical.keys().map(String::as_str).collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.to_ascii_uppercase(),
            canonical_uri(uri.path()),
            canonical_query(uri.query().unwrap_or("")),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            timestamp.date, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            timestamp.amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = self.signing_key(credentials, &timestamp.date)?;
        let signature = hex(&hmac_sha256(&signing_key, string_to_sign.as_bytes())?);
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, credentials.access_key, scope, signed_headers, signature
        );

        Ok(SignedRequest {
            authorization,
            amz_date: timestamp.amz_date.clone(),
            content_sha256: payload_hash,
            host,
            security_token: credentials.session_token.clone(),
            signed_headers,
            canonical_request,
        })
    }

    fn signing_key(&self, credentials: &Credentials, date: &str) -> Result<Vec<u8>, AuthError> {
        let mut cached = self.cached_key.lock();
        if let Some(entry) = cached.as_ref()
            && entry.date == date
            && entry.access_key == credentials.access_key
            && entry.secret_key == credentials.secret_key
        {
            return Ok(entry.key.clone());
        }

        let key = derive_signing_key(&credentials.secret_key, date, &self.region, &self.service)?;
        *cached = Some(CachedKey {
            date: date.to_string(),
            access_key: credentials.access_key.clone(),
            secret_key: credentials.secret_key.clone(),
            key: key.clone(),
        });
        Ok(key)
    }
}

fn derive_signing_key(
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, AuthError> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// Each path segment is encoded again, so an already-escaped `%3A` in a
/// model id is signed as `%253A`.
fn canonical_uri(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (aws_encode(name), aws_encode(value))
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn aws_encode(component: &str) -> String {
    let decoded = urlencoding::decode(component)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| component.to_string());
    urlencoding::encode(&decoded).into_owned()
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AuthError::Signing(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn example_credentials() -> Credentials {
        Credentials::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            None,
        )
        .unwrap()
    }

    fn example_timestamp() -> SigV4Timestamp {
        SigV4Timestamp::from_amz_date("20150830T123600Z").unwrap()
    }

    /// AWS's IAM `ListUsers` example request. The payload hash header is
    /// always signed, so the signature differs from the published one.
    #[test]
    fn test_iam_list_users_signed_with_payload_hash() {
        let signer = SigV4Signer::new("us-east-1", "iam");
        let uri: Uri = "https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08"
            .parse()
            .unwrap();

        let signed = signer
            .sign(
                &example_credentials(),
                "GET",
                &uri,
                &[(
                    "Content-Type",
                    "application/x-www-form-urlencoded; charset=utf-8",
                )],
                b"",
                &example_timestamp(),
            )
            .unwrap();

        let expected_canonical = [
            "GET",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            "content-type:application/x-www-form-urlencoded; charset=utf-8",
            "host:iam.amazonaws.com",
            &format!("x-amz-content-sha256:{}", EMPTY_SHA256),
            "x-amz-date:20150830T123600Z",
            "",
            "content-type;host;x-amz-content-sha256;x-amz-date",
            EMPTY_SHA256,
        ]
        .join("\n");
        assert_eq!(signed.canonical_request, expected_canonical);
        assert_eq!(
            signed.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, \
             SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, \
             Signature=dd479fa8a80364edf2119ec24bebde66712ee9c9cb2b0d92eb3ab9ccdc0c3947"
        );
        assert_eq!(signed.content_sha256, EMPTY_SHA256);
        assert_eq!(signed.host, "iam.amazonaws.com");
    }

    #[test]
    fn test_signing_is_deterministic() {
        let uri: Uri = "https://bedrock-runtime.us-east-1.amazonaws.com/model/anthropic.claude-3-haiku-20240307-v1%3A0/invoke"
            .parse()
            .unwrap();
        let body = br#"{"anthropic_version":"bedrock-2023-05-31"}"#;
        let headers = [("content-type", "application/json"), ("accept", "application/json")];

        let first = SigV4Signer::bedrock("us-east-1")
            .sign(&example_credentials(), "POST", &uri, &headers, body, &example_timestamp())
            .unwrap();
        // A fresh signer has an empty key cache.
        let second = SigV4Signer::bedrock("us-east-1")
            .sign(&example_credentials(), "POST", &uri, &headers, body, &example_timestamp())
            .unwrap();

        assert_eq!(first.authorization, second.authorization);
        assert_eq!(first.canonical_request, second.canonical_request);
    }

    #[test]
    fn test_cached_key_gives_same_signature() {
        let signer = SigV4Signer::bedrock("us-west-2");
        let uri: Uri = "https://bedrock-runtime.us-west-2.amazonaws.com/model/m/invoke"
            .parse()
            .unwrap();

        let sign = || {
            signer
                .sign(&example_credentials(), "POST", &uri, &[], b"{}", &example_timestamp())
                .unwrap()
                .authorization
        };
        assert_eq!(sign(), sign());
    }

    #[test]
    fn test_cache_invalidated_on_credential_change() {
        let signer = SigV4Signer::bedrock("us-east-1");
        let uri: Uri = "https://bedrock-runtime.us-east-1.amazonaws.com/model/m/invoke"
            .parse()
            .unwrap();
        let other = Credentials::new("AKIDEXAMPLE", "another-secret", None).unwrap();

        let a = signer
            .sign(&example_credentials(), "POST", &uri, &[], b"{}", &example_timestamp())
            .unwrap();
        let b = signer
            .sign(&other, "POST", &uri, &[], b"{}", &example_timestamp())
            .unwrap();
        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn test_model_id_path_is_double_encoded() {
        let signer = SigV4Signer::bedrock("us-east-1");
        let uri: Uri = "https://bedrock-runtime.us-east-1.amazonaws.com/model/anthropic.claude-3-haiku-20240307-v1%3A0/invoke-with-response-stream"
            .parse()
            .unwrap();

        let signed = signer
            .sign(&example_credentials(), "POST", &uri, &[], b"{}", &example_timestamp())
            .unwrap();
        let canonical_uri = signed.canonical_request.lines().nth(1).unwrap();
        assert_eq!(
            canonical_uri,
            "/model/anthropic.claude-3-haiku-20240307-v1%253A0/invoke-with-response-stream"
        );
    }

    #[test]
    fn test_session_token_is_signed() {
        let signer = SigV4Signer::bedrock("us-east-1");
        let uri: Uri = "https://bedrock-runtime.us-east-1.amazonaws.com/model/m/invoke"
            .parse()
            .unwrap();
        let credentials =
            Credentials::new("AKIDEXAMPLE", "secret", Some("session-token".to_string())).unwrap();

        let signed = signer
            .sign(&credentials, "POST", &uri, &[], b"{}", &example_timestamp())
            .unwrap();
        assert_eq!(signed.security_token.as_deref(), Some("session-token"));
        assert!(signed.signed_headers.contains("x-amz-security-token"));
        assert!(
            signed
                .canonical_request
                .contains("x-amz-security-token:session-token\n")
        );
    }

    #[test]
    fn test_host_includes_explicit_port() {
        let signer = SigV4Signer::bedrock("us-east-1");
        let uri: Uri = "http://127.0.0.1:9999/model/m/invoke".parse().unwrap();

        let signed = signer
            .sign(&example_credentials(), "POST", &uri, &[], b"", &example_timestamp())
            .unwrap();
        assert_eq!(signed.host, "127.0.0.1:9999");
    }

    #[test]
    fn test_headers_normalized() {
        let signer = SigV4Signer::new("us-east-1", "iam");
        let uri: Uri = "https://iam.amazonaws.com/".parse().unwrap();

        let signed = signer
            .sign(
                &example_credentials(),
                "get",
                &uri,
                &[("X-Custom", "  a   b  "), ("x-custom", "c")],
                b"",
                &example_timestamp(),
            )
            .unwrap();
        assert!(signed.canonical_request.starts_with("GET\n/\n\n"));
        assert!(signed.canonical_request.contains("x-custom:a b,c\n"));
    }

    #[test]
    fn test_canonical_query_sorted_and_encoded() {
        assert_eq!(canonical_query("b=2&a=1"), "a=1&b=2");
        assert_eq!(canonical_query("key=a%20b&flag"), "flag=&key=a%20b");
        assert_eq!(canonical_query("path=x/y"), "path=x%2Fy");
        assert_eq!(canonical_query(""), "");
    }

    #[test]
    fn test_timestamp_from_datetime() {
        let dt = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        assert_eq!(SigV4Timestamp::from_datetime(dt), example_timestamp());
    }

    #[test]
    fn test_invalid_amz_date() {
        assert!(SigV4Timestamp::from_amz_date("2015").is_err());
        assert!(SigV4Timestamp::from_amz_date("20150830X123600Z").is_err());
    }

    #[test]
    fn test_missing_credentials() {
        assert!(matches!(
            Credentials::new("", "secret", None),
            Err(AuthError::MissingCredentials(_))
        ));
        assert!(matches!(
            Credentials::new("AKID", "  ", None),
            Err(AuthError::MissingCredentials(_))
        ));
    }

    #[test]
    fn test_sha256_hex_empty() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    }
}
