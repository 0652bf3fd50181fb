use hyper::body::Bytes;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::BedrockConfig;
use crate::error::{Error, Result};
use crate::mapping::resolve;
use crate::sigv4::sha256_hex;

/// A request body rewritten for Bedrock, ready to be signed.
#[derive(Debug, Clone)]
pub struct Transformed {
    /// Exact bytes to sign and send.
    pub body: Bytes,
    /// Bedrock model id (goes into the URL path, not the body).
    pub model: String,
    pub stream: bool,
    /// Hex SHA-256 of `body`.
    pub digest: String,
}

/// Rewrites Anthropic Messages request bodies into the shape Bedrock's
/// `InvokeModel` expects.
#[derive(Debug, Clone)]
pub struct Transformer {
    config: BedrockConfig,
}

impl Transformer {
    pub fn new(config: BedrockConfig) -> Self {
        Self { config }
    }

    /// Transform an inbound body.
    ///
    /// `version_hint` is the inbound `anthropic-version` header, used when
    /// the body carries no `anthropic_version`.
    pub fn transform(
        &self,
        body: &[u8],
        content_type: &str,
        version_hint: Option<&str>,
    ) -> Result<Transformed> {
        if !content_type.contains("json") {
            let model = self.resolve_model("");
            debug!(content_type = %content_type, model = %model, "Passing non-JSON body through unmodified");
            return Ok(Transformed {
                digest: sha256_hex(body),
                body: Bytes::copy_from_slice(body),
                model,
                stream: false,
            });
        }

        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedRequest(format!("invalid JSON body: {}", e)))?;
        let Value::Object(mut object) = value else {
            return Err(Error::MalformedRequest(
                "request body must be a JSON object".to_string(),
            ));
        };

        let model = match object.remove("model") {
            Some(Value::String(model)) => self.resolve_model(&model),
            _ => self.resolve_model(""),
        };
        let stream = matches!(object.remove("stream"), Some(Value::Bool(true)));

        let version = match object.get("anthropic_version") {
            Some(Value::String(v)) => self.resolve_version(v),
            _ => self.resolve_version(version_hint.unwrap_or("")),
        };
        object.insert("anthropic_version".to_string(), Value::String(version));

        self.apply_feature_flags(&mut object);

        let body = serde_json::to_vec(&Value::Object(object))
            .map_err(|e| Error::MalformedRequest(format!("failed to serialize body: {}", e)))?;

        Ok(Transformed {
            digest: sha256_hex(&body),
            body: Bytes::from(body),
            model,
            stream,
        })
    }

    fn resolve_model(&self, requested: &str) -> String {
        resolve(
            &self.config.model_mappings,
            requested,
            &self.config.default_model,
        )
        .to_string()
    }

    fn resolve_version(&self, requested: &str) -> String {
        resolve(
            &self.config.anthropic_version_mappings,
            requested,
            &self.config.default_version,
        )
        .to_string()
    }

    fn apply_feature_flags(&self, object: &mut Map<String, Value>) {
        if self.config.enable_computer_use && !object.contains_key("anthropic_beta") {
            object.insert(
                "anthropic_beta".to_string(),
                json!([self.config.computer_use_beta]),
            );
        }

        if self.config.enable_output_reasoning {
            if !object.contains_key("thinking") {
                object.insert(
                    "thinking".to_string(),
                    json!({
                        "type": "enabled",
                        "budget_tokens": self.config.reason_budget_tokens,
                    }),
                );
            }
        } else if object.remove("thinking").is_some() {
            debug!("Stripped thinking block, output reasoning is disabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn config() -> BedrockConfig {
        let mut config = BedrockConfig::default();
        config.model_mappings.insert(
            "claude-3-haiku".to_string(),
            "anthropic.claude-3-haiku-20240307-v1:0".to_string(),
        );
        config.default_version = "bedrock-2023-05-31".to_string();
        config
    }

    fn parse(body: &Bytes) -> Map<String, Value> {
        match serde_json::from_slice(body).unwrap() {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    #[test]
    fn test_transform_haiku_request() {
        let transformer = Transformer::new(config());
        let body = br#"{"model":"claude-3-haiku","stream":false,"messages":[{"role":"user","content":"hi"}],"max_tokens":16}"#;

        let out = transformer.transform(body, "application/json", None).unwrap();
        let object = parse(&out.body);

        assert_eq!(out.model, "anthropic.claude-3-haiku-20240307-v1:0");
        assert!(!out.stream);
        assert_eq!(object["anthropic_version"], "bedrock-2023-05-31");
        assert!(!object.contains_key("model"));
        assert!(!object.contains_key("stream"));
        assert_eq!(object["max_tokens"], 16);
        assert_eq!(object["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_stream_flag_extracted() {
        let transformer = Transformer::new(config());
        let out = transformer
            .transform(br#"{"model":"claude-3-haiku","stream":true}"#, "application/json", None)
            .unwrap();
        assert!(out.stream);
        assert!(!parse(&out.body).contains_key("stream"));
    }

    #[test]
    fn test_unmapped_model_uses_default() {
        let transformer = Transformer::new(config());
        let out = transformer
            .transform(br#"{"model":"gpt-4"}"#, "application/json", None)
            .unwrap();
        assert_eq!(out.model, BedrockConfig::default().default_model);

        let out = transformer.transform(b"{}", "application/json", None).unwrap();
        assert_eq!(out.model, BedrockConfig::default().default_model);
    }

    #[test]
    fn test_version_mapping_and_hint() {
        let mut config = config();
        config
            .anthropic_version_mappings
            .insert("2023-06-01".to_string(), "bedrock-2023-05-31".to_string());
        config.default_version = "bedrock-default".to_string();
        let transformer = Transformer::new(config);

        let out = transformer
            .transform(b"{}", "application/json", Some("2023-06-01"))
            .unwrap();
        assert_eq!(parse(&out.body)["anthropic_version"], "bedrock-2023-05-31");

        let out = transformer
            .transform(br#"{"anthropic_version":"unknown"}"#, "application/json", Some("2023-06-01"))
            .unwrap();
        assert_eq!(parse(&out.body)["anthropic_version"], "bedrock-default");
    }

    #[test]
    fn test_computer_use_beta_injected_when_absent() {
        let mut config = config();
        config.enable_computer_use = true;
        let transformer = Transformer::new(config);

        let out = transformer.transform(b"{}", "application/json", None).unwrap();
        assert_eq!(parse(&out.body)["anthropic_beta"], json!(["computer-use-2024-10-22"]));

        let out = transformer
            .transform(br#"{"anthropic_beta":["custom"]}"#, "application/json", None)
            .unwrap();
        assert_eq!(parse(&out.body)["anthropic_beta"], json!(["custom"]));
    }

    #[test]
    fn test_computer_use_disabled_leaves_body_alone() {
        let transformer = Transformer::new(config());
        let out = transformer.transform(b"{}", "application/json", None).unwrap();
        assert!(!parse(&out.body).contains_key("anthropic_beta"));
    }

    #[test]
    fn test_thinking_injected_when_enabled() {
        let mut config = config();
        config.enable_output_reasoning = true;
        config.reason_budget_tokens = 2048;
        let transformer = Transformer::new(config);

        let out = transformer.transform(b"{}", "application/json", None).unwrap();
        assert_eq!(
            parse(&out.body)["thinking"],
            json!({"type": "enabled", "budget_tokens": 2048})
        );

        let caller = br#"{"thinking":{"type":"enabled","budget_tokens":4000}}"#;
        let out = transformer.transform(caller, "application/json", None).unwrap();
        assert_eq!(parse(&out.body)["thinking"]["budget_tokens"], 4000);
    }

    #[test]
    fn test_thinking_stripped_when_disabled() {
        let transformer = Transformer::new(config());
        let out = transformer
            .transform(
                br#"{"thinking":{"type":"enabled","budget_tokens":4000},"tools":[{"name":"t"}]}"#,
                "application/json",
                None,
            )
            .unwrap();
        let object = parse(&out.body);
        assert!(!object.contains_key("thinking"));
        assert_eq!(object["tools"][0]["name"], "t");
    }

    #[test]
    fn test_non_json_passthrough() {
        let transformer = Transformer::new(config());
        let body = b"model=claude-3-haiku&stream=true";

        let out = transformer.transform(body, "text/plain", None).unwrap();
        assert_eq!(&out.body[..], body);
        assert!(!out.stream);
        assert_eq!(out.model, BedrockConfig::default().default_model);
    }

    #[test]
    fn test_digest_matches_body() {
        let transformer = Transformer::new(config());
        let out = transformer
            .transform(br#"{"model":"claude-3-haiku"}"#, "application/json", None)
            .unwrap();

        let expected: String = Sha256::digest(&out.body)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        assert_eq!(out.digest, expected);
    }

    #[test]
    fn test_output_keys_sorted() {
        let transformer = Transformer::new(config());
        let out = transformer
            .transform(br#"{"z":1,"a":2,"max_tokens":3}"#, "application/json", None)
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&out.body).unwrap(),
            r#"{"a":2,"anthropic_version":"bedrock-2023-05-31","max_tokens":3,"z":1}"#
        );
    }

    #[test]
    fn test_malformed_json() {
        let transformer = Transformer::new(config());
        let err = transformer
            .transform(b"{not json", "application/json", None)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));

        let err = transformer
            .transform(b"[1,2,3]", "application/json", None)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));
    }

    #[test]
    fn test_transformed_body_is_valid_json() {
        let transformer = Transformer::new(config());
        let inputs: [&[u8]; 4] = [
            b"{}",
            br#"{"nested":{"deep":[1,{"x":null}]},"unicode":"\u00e9\u4e2d"}"#,
            br#"{"model":123,"stream":"yes"}"#,
            br#"{"text":"line\nbreak \"quoted\""}"#,
        ];
        for input in inputs {
            let out = transformer.transform(input, "application/json", None).unwrap();
            assert!(serde_json::from_slice::<Value>(&out.body).is_ok());
        }
    }
}
