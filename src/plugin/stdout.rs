use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;

use super::{build_formatter, OutputPlugin, OutputProvider, PluginError, SendError, FORMAT_PROP};
use crate::format::Formatter;
use crate::model::{Article, OutputDef, PluginKind, PluginSpec};
use crate::util::strip_control_chars;

/// Writes formatted articles to standard output.
pub struct StdoutPlugin;

impl OutputPlugin for StdoutPlugin {
    fn spec(&self) -> PluginSpec {
        PluginSpec {
            name: "stdout",
            desc: "Print new articles to standard output",
            kind: PluginKind::Output,
            props: vec![FORMAT_PROP],
        }
    }

    fn build(&self, def: &OutputDef) -> Result<Arc<dyn OutputProvider>, PluginError> {
        Ok(Arc::new(StdoutOutput {
            def: def.clone(),
            formatter: build_formatter(&def.props)?,
        }))
    }
}

struct StdoutOutput {
    def: OutputDef,
    formatter: Formatter,
}

#[async_trait]
impl OutputProvider for StdoutOutput {
    async fn send(&self, article: &Article) -> Result<(), SendError> {
        let text = self.formatter.format(article)?;
        let text = strip_control_chars(&text);
        tracing::info!(output = %self.def.alias, fingerprint = %article.fingerprint, "{}", text);

        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}")?;
        stdout.flush()?;
        Ok(())
    }

    fn def(&self) -> &OutputDef {
        &self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_formats_article() {
        let def = OutputDef::new("console", "stdout").with_prop("format", "{feed}: {title}");
        let provider = StdoutPlugin.build(&def).unwrap();
        let article = Article {
            fingerprint: "fp".into(),
            title: "Hello\x1b[31m".into(),
            link: None,
            summary: None,
            author: None,
            published: None,
            tags: vec![],
            feed_id: 1,
            feed_title: "Feed".into(),
        };
        provider.send(&article).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_template_field_fails_send() {
        let def = OutputDef::new("console", "stdout").with_prop("format", "{nope}");
        let provider = StdoutPlugin.build(&def).unwrap();
        let article = Article {
            fingerprint: "fp".into(),
            title: "t".into(),
            link: None,
            summary: None,
            author: None,
            published: None,
            tags: vec![],
            feed_id: 1,
            feed_title: "Feed".into(),
        };
        assert!(matches!(provider.send(&article).await, Err(SendError::Format(_))));
    }
}
