use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

use super::{build_formatter, OutputPlugin, OutputProvider, PluginError, SendError, FORMAT_PROP};
use crate::format::Formatter;
use crate::model::{Article, OutputDef, PluginKind, PluginSpec, PropSpec, PropType};
use crate::util::{truncate_chars, validate_url, NetworkPolicy};

/// Error code the timeline API returns for "Status is a duplicate"
pub const DUPLICATE_STATUS_CODE: i64 = 187;

pub const DEFAULT_MAX_LENGTH: usize = 280;

/// Largest error body we bother decoding
const MAX_ERROR_BODY: usize = 64 * 1024;

// ============================================================================
// API errors
// ============================================================================

/// Structured error decoded from a failed status post.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Timeline API error (status {status}, code {code:?}): {message}")]
pub struct TimelineApiError {
    pub status: u16,
    /// First API error code in the body, if the body had one
    pub code: Option<i64>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    code: i64,
    #[serde(default)]
    message: String,
}

impl TimelineApiError {
    /// Decode `{"errors":[{"code":N,"message":"..."}]}`; any other body is
    /// kept as the message with no code.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorBody>(body) {
            Ok(parsed) if !parsed.errors.is_empty() => {
                let first = &parsed.errors[0];
                Self {
                    status,
                    code: Some(first.code),
                    message: first.message.clone(),
                }
            }
            _ => Self {
                status,
                code: None,
                message: String::from_utf8_lossy(body).trim().to_string(),
            },
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.code == Some(DUPLICATE_STATUS_CODE)
    }
}

// ============================================================================
// Plugin
// ============================================================================

/// Posts each article as a status on a social timeline.
pub struct TimelinePlugin {
    client: reqwest::Client,
    policy: NetworkPolicy,
}

impl TimelinePlugin {
    pub fn new(client: reqwest::Client, policy: NetworkPolicy) -> Self {
        Self { client, policy }
    }
}

impl OutputPlugin for TimelinePlugin {
    fn spec(&self) -> PluginSpec {
        PluginSpec {
            name: "timeline",
            desc: "Post new articles as statuses on a social timeline",
            kind: PluginKind::Output,
            props: vec![
                PropSpec {
                    name: "endpoint",
                    desc: "Status update endpoint",
                    kind: PropType::Url,
                    required: true,
                },
                PropSpec {
                    name: "accessToken",
                    desc: "Bearer token of the posting account",
                    kind: PropType::Password,
                    required: true,
                },
                PropSpec {
                    name: "maxLength",
                    desc: "Maximum status length in characters (default 280)",
                    kind: PropType::Number,
                    required: false,
                },
                FORMAT_PROP,
            ],
        }
    }

    fn build(&self, def: &OutputDef) -> Result<Arc<dyn OutputProvider>, PluginError> {
        let endpoint = def
            .props
            .get("endpoint")
            .ok_or_else(|| PluginError::MissingProperty("endpoint".into()))?;
        let endpoint = validate_url(endpoint, self.policy)
            .map_err(|e| PluginError::invalid("endpoint", e.to_string()))?;
        let token = def
            .props
            .get("accessToken")
            .ok_or_else(|| PluginError::MissingProperty("accessToken".into()))?;
        let max_length = match def.props.get("maxLength") {
            None => DEFAULT_MAX_LENGTH,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(PluginError::invalid("maxLength", "must be a positive integer")),
            },
        };

        Ok(Arc::new(TimelineOutput {
            def: def.clone(),
            client: self.client.clone(),
            endpoint,
            token: SecretString::from(token.to_string()),
            max_length,
            formatter: build_formatter(&def.props)?,
        }))
    }
}

struct TimelineOutput {
    def: OutputDef,
    client: reqwest::Client,
    endpoint: url::Url,
    token: SecretString,
    max_length: usize,
    formatter: Formatter,
}

#[async_trait]
impl OutputProvider for TimelineOutput {
    async fn send(&self, article: &Article) -> Result<(), SendError> {
        let text = self.formatter.format(article)?;
        let status = truncate_chars(&text, self.max_length);

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(
                "Authorization",
                format!("Bearer {}", self.token.expose_secret()),
            )
            .form(&[("status", status.as_ref())])
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let code = response.status().as_u16();
        let body = read_error_body(response, MAX_ERROR_BODY).await;
        let error = TimelineApiError::from_response(code, &body);
        if error.is_duplicate() {
            tracing::debug!(
                output = %self.def.alias,
                fingerprint = %article.fingerprint,
                "Timeline rejected duplicate status"
            );
            return Err(SendError::DuplicateSubmission);
        }
        Err(SendError::Api(error))
    }

    fn def(&self) -> &OutputDef {
        &self.def
    }
}

/// Read at most `limit` bytes of an error response. A body that fails
/// midway keeps what arrived so far.
async fn read_error_body(response: reqwest::Response, limit: usize) -> Vec<u8> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while body.len() < limit {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let take = chunk.len().min(limit - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read timeline error body");
                break;
            }
            None => break,
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn article(title: &str) -> Article {
        Article {
            fingerprint: "fp".into(),
            title: title.into(),
            link: Some("http://x".into()),
            summary: None,
            author: None,
            published: None,
            tags: vec![],
            feed_id: 1,
            feed_title: "Feed".into(),
        }
    }

    fn provider(server: &MockServer, max_length: Option<&str>) -> Arc<dyn OutputProvider> {
        let mut def = OutputDef::new("social", "timeline")
            .with_prop("endpoint", format!("{}/statuses", server.uri()))
            .with_prop("accessToken", "t0ken")
            .with_prop("format", "{title}");
        if let Some(max) = max_length {
            def = def.with_prop("maxLength", max);
        }
        TimelinePlugin::new(reqwest::Client::new(), NetworkPolicy::AllowPrivate)
            .build(&def)
            .unwrap()
    }

    #[test]
    fn test_decode_error_body() {
        let err = TimelineApiError::from_response(
            403,
            br#"{"errors":[{"code":187,"message":"Status is a duplicate."}]}"#,
        );
        assert_eq!(err.code, Some(187));
        assert_eq!(err.message, "Status is a duplicate.");
        assert!(err.is_duplicate());

        let err = TimelineApiError::from_response(500, b"upstream exploded");
        assert_eq!(err.code, None);
        assert_eq!(err.message, "upstream exploded");
        assert!(!err.is_duplicate());
    }

    #[tokio::test]
    async fn test_post_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/statuses"))
            .and(header("Authorization", "Bearer t0ken"))
            .and(body_string_contains("status=Hello"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server, None).send(&article("Hello")).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_truncated_to_max_length() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let long = "a".repeat(300);
        provider(&server, None).send(&article(&long)).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let form: Vec<(String, String)> = url::form_urlencoded::parse(&requests[0].body)
            .into_owned()
            .collect();
        assert_eq!(form[0].0, "status");
        assert_eq!(form[0].1.chars().count(), 280);
    }

    #[tokio::test]
    async fn test_duplicate_status_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                r#"{"errors":[{"code":187,"message":"Status is a duplicate."}]}"#,
            ))
            .mount(&server)
            .await;

        let result = provider(&server, Some("100")).send(&article("Hello")).await;
        assert!(matches!(result, Err(SendError::DuplicateSubmission)));
    }

    #[tokio::test]
    async fn test_other_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string(
                r#"{"errors":[{"code":89,"message":"Invalid or expired token."}]}"#,
            ))
            .mount(&server)
            .await;

        match provider(&server, None).send(&article("Hello")).await {
            Err(SendError::Api(e)) => {
                assert_eq!(e.status, 401);
                assert_eq!(e.code, Some(89));
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_large_error_body_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("x".repeat(MAX_ERROR_BODY * 4)))
            .mount(&server)
            .await;

        match provider(&server, None).send(&article("Hello")).await {
            Err(SendError::Api(e)) => {
                assert_eq!(e.status, 502);
                assert_eq!(e.code, None);
                assert_eq!(e.message.len(), MAX_ERROR_BODY);
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn test_build_rejects_private_endpoint_when_public_only() {
        let def = OutputDef::new("social", "timeline")
            .with_prop("endpoint", "http://127.0.0.1/statuses")
            .with_prop("accessToken", "t");
        let err = TimelinePlugin::new(reqwest::Client::new(), NetworkPolicy::PublicOnly)
            .build(&def)
            .err();
        assert!(matches!(err, Some(PluginError::InvalidProperty { name, .. }) if name == "endpoint"));
    }

    #[test]
    fn test_build_rejects_zero_max_length() {
        let def = OutputDef::new("social", "timeline")
            .with_prop("endpoint", "https://social.example.com/statuses")
            .with_prop("accessToken", "t")
            .with_prop("maxLength", "0");
        let err = TimelinePlugin::new(reqwest::Client::new(), NetworkPolicy::PublicOnly)
            .build(&def)
            .err();
        assert!(matches!(err, Some(PluginError::InvalidProperty { name, .. }) if name == "maxLength"));
    }
}
