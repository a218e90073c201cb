//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedrelay::config::Config;
use feedrelay::model::{Article, OutputDef, PluginKind, PluginSpec, PropSpec, PropType};
use feedrelay::plugin::{OutputPlugin, OutputProvider, PluginError, PluginRegistry, SendError};
use feedrelay::service::Service;
use feedrelay::storage::Database;

pub type Sent = Arc<Mutex<Vec<Article>>>;

/// Output plugin that records every article it is asked to send.
pub struct RecordingPlugin {
    pub sent: Sent,
}

struct RecordingOutput {
    def: OutputDef,
    sent: Sent,
    delay: Duration,
}

impl OutputPlugin for RecordingPlugin {
    fn spec(&self) -> PluginSpec {
        PluginSpec {
            name: "recording",
            desc: "Records sent articles",
            kind: PluginKind::Output,
            props: vec![PropSpec {
                name: "delayMs",
                desc: "Delay before each send completes",
                kind: PropType::Number,
                required: false,
            }],
        }
    }

    fn build(&self, def: &OutputDef) -> Result<Arc<dyn OutputProvider>, PluginError> {
        let delay_ms = def
            .props
            .get("delayMs")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(Arc::new(RecordingOutput {
            def: def.clone(),
            sent: Arc::clone(&self.sent),
            delay: Duration::from_millis(delay_ms),
        }))
    }
}

#[async_trait]
impl OutputProvider for RecordingOutput {
    async fn send(&self, article: &Article) -> Result<(), SendError> {
        tokio::time::sleep(self.delay).await;
        self.sent.lock().unwrap().push(article.clone());
        Ok(())
    }

    fn def(&self) -> &OutputDef {
        &self.def
    }
}

pub fn test_config() -> Config {
    Config {
        allow_private_networks: true,
        ..Config::default()
    }
}

/// Fresh database file per call. Poll loops, pushes and deliveries write
/// concurrently, which a shared-cache `:memory:` database does not tolerate.
pub async fn temp_db() -> Database {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir: PathBuf = std::env::temp_dir().join(format!("feedrelay_it_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.db", NEXT.fetch_add(1, Ordering::SeqCst)));
    std::fs::remove_file(&path).ok();
    Database::open(path.to_str().unwrap()).await.unwrap()
}

/// Service over a fresh database with the built-ins plus `recording`.
pub async fn service(config: &Config) -> (Service, Sent) {
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let client = reqwest::Client::new();
    let mut registry =
        PluginRegistry::with_builtins(&[], client.clone(), config.network_policy());
    registry
        .register_output(Arc::new(RecordingPlugin {
            sent: Arc::clone(&sent),
        }))
        .unwrap();

    let db = temp_db().await;
    let service = Service::new(config, db, registry, client).await.unwrap();
    (service, sent)
}

pub fn titles(sent: &Sent) -> Vec<String> {
    sent.lock().unwrap().iter().map(|a| a.title.clone()).collect()
}

/// RSS document with one item per `(guid, title)`.
pub fn rss(items: &[(&str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(guid, title)| {
            format!(
                "<item><guid>{guid}</guid><title>{title}</title><link>https://example.com/{guid}</link></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Test Feed</title><link>https://example.com</link><description>d</description>{items}</channel></rss>"#
    )
}

/// Poll `check` until it holds, failing the test after about five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
