use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;

use super::{build_formatter, OutputPlugin, OutputProvider, PluginError, SendError, FORMAT_PROP};
use crate::format::Formatter;
use crate::model::{Article, OutputDef, PluginKind, PluginSpec, PropSpec, PropType};
use crate::util::{validate_url, NetworkPolicy};

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// POSTs each article as JSON to a configured URL.
pub struct WebhookPlugin {
    client: reqwest::Client,
    policy: NetworkPolicy,
}

impl WebhookPlugin {
    pub fn new(client: reqwest::Client, policy: NetworkPolicy) -> Self {
        Self { client, policy }
    }
}

impl OutputPlugin for WebhookPlugin {
    fn spec(&self) -> PluginSpec {
        PluginSpec {
            name: "http",
            desc: "POST new articles as JSON to a URL",
            kind: PluginKind::Output,
            props: vec![
                PropSpec {
                    name: "url",
                    desc: "Target URL",
                    kind: PropType::Url,
                    required: true,
                },
                PropSpec {
                    name: "contentType",
                    desc: "Content-Type header (default application/json)",
                    kind: PropType::Text,
                    required: false,
                },
                PropSpec {
                    name: "token",
                    desc: "Bearer token sent in the Authorization header",
                    kind: PropType::Password,
                    required: false,
                },
                FORMAT_PROP,
            ],
        }
    }

    fn build(&self, def: &OutputDef) -> Result<Arc<dyn OutputProvider>, PluginError> {
        let url = def
            .props
            .get("url")
            .ok_or_else(|| PluginError::MissingProperty("url".into()))?;
        let url = validate_url(url, self.policy).map_err(|e| PluginError::invalid("url", e.to_string()))?;

        Ok(Arc::new(WebhookOutput {
            def: def.clone(),
            client: self.client.clone(),
            url,
            content_type: def
                .props
                .get("contentType")
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
            token: def.props.get("token").map(|t| SecretString::from(t.to_string())),
            formatter: build_formatter(&def.props)?,
        }))
    }
}

struct WebhookOutput {
    def: OutputDef,
    client: reqwest::Client,
    url: url::Url,
    content_type: String,
    token: Option<SecretString>,
    formatter: Formatter,
}

#[derive(Serialize)]
struct Payload<'a> {
    text: String,
    #[serde(flatten)]
    article: &'a Article,
}

#[async_trait]
impl OutputProvider for WebhookOutput {
    async fn send(&self, article: &Article) -> Result<(), SendError> {
        let payload = Payload {
            text: self.formatter.format(article)?,
            article,
        };
        // Serialized by hand so a custom content type does not get overridden
        let body = serde_json::to_vec(&payload).map_err(std::io::Error::from)?;

        let mut request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", &self.content_type)
            .body(body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SendError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }

    fn def(&self) -> &OutputDef {
        &self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn article() -> Article {
        Article {
            fingerprint: "fp-1".into(),
            title: "A".into(),
            link: Some("http://x".into()),
            summary: None,
            author: None,
            published: None,
            tags: vec!["rust".into()],
            feed_id: 7,
            feed_title: "Feed".into(),
        }
    }

    #[tokio::test]
    async fn test_posts_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("Content-Type", "application/json"))
            .and(header("Authorization", "Bearer s3cret"))
            .and(body_partial_json(serde_json::json!({
                "text": "A\nhttp://x",
                "fingerprint": "fp-1",
                "tags": ["rust"],
                "feed_id": 7
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let def = OutputDef::new("hook", "http")
            .with_prop("url", format!("{}/hook", server.uri()))
            .with_prop("token", "s3cret");
        let provider = WebhookPlugin::new(reqwest::Client::new(), NetworkPolicy::AllowPrivate)
            .build(&def)
            .unwrap();
        provider.send(&article()).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let def = OutputDef::new("hook", "http").with_prop("url", server.uri());
        let provider = WebhookPlugin::new(reqwest::Client::new(), NetworkPolicy::AllowPrivate)
            .build(&def)
            .unwrap();
        assert!(matches!(
            provider.send(&article()).await,
            Err(SendError::HttpStatus(502))
        ));
    }

    #[test]
    fn test_rejects_localhost_when_public_only() {
        let def = OutputDef::new("hook", "http").with_prop("url", "http://localhost:9000/hook");
        let result = WebhookPlugin::new(reqwest::Client::new(), NetworkPolicy::PublicOnly).build(&def);
        assert!(matches!(result, Err(PluginError::InvalidProperty { .. })));
    }
}
