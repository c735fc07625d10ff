//! Upstream feed sources.
//!
//! A [`PollingSource`] reads its feed once per unit of demand granted by the
//! coordinator, waiting at least one poll interval between reads.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{SourceAuth, SourceConfig};
use crate::coordinator::SourceLink;
use crate::fetch::auth::{ApiKey, UrlParam};
use crate::fetch::{BasicClient, HttpClient, fetch_bytes};
use crate::merge::Snapshot;
use crate::parser::parse_snapshot;

/// Produces the current snapshot of one feed.
#[async_trait]
pub trait FeedReader: Send + Sync {
    async fn read(&self) -> Result<Snapshot>;
}

/// Feed served over HTTP.
pub struct HttpFeed {
    url: String,
    client: Box<dyn HttpClient>,
}

impl HttpFeed {
    pub fn new(url: impl Into<String>, client: Box<dyn HttpClient>) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl FeedReader for HttpFeed {
    async fn read(&self) -> Result<Snapshot> {
        let bytes = fetch_bytes(self.client.as_ref(), &self.url).await?;
        debug!(bytes = bytes.len(), "Feed bytes received, parsing");
        parse_snapshot(&bytes)
    }
}

/// Feed file on local disk, re-read on every poll.
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedReader for FileFeed {
    async fn read(&self) -> Result<Snapshot> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        parse_snapshot(&bytes)
    }
}

fn env_key(key_env: &str) -> Result<String> {
    std::env::var(key_env).with_context(|| format!("{key_env} must be set"))
}

/// Builds the reader for a configured source, resolving API keys from the
/// environment.
pub fn reader_for(config: &SourceConfig) -> Result<Box<dyn FeedReader>> {
    if !config.url.starts_with("http") {
        return Ok(Box::new(FileFeed::new(&config.url)));
    }

    let basic = BasicClient::new(config.fetch_timeout())?;
    let client: Box<dyn HttpClient> = match &config.auth {
        SourceAuth::None => Box::new(basic),
        SourceAuth::Header {
            header_name,
            key_env,
        } => Box::new(ApiKey::new(basic, header_name, &env_key(key_env)?)?),
        SourceAuth::Bearer { key_env } => Box::new(ApiKey::bearer(basic, &env_key(key_env)?)?),
        SourceAuth::UrlParam {
            param_name,
            key_env,
        } => Box::new(UrlParam::new(basic, param_name, &env_key(key_env)?)?),
    };

    Ok(Box::new(HttpFeed::new(&config.url, client)))
}

pub struct PollingSource {
    name: String,
    interval: Duration,
    reader: Box<dyn FeedReader>,
}

impl PollingSource {
    pub fn new(name: impl Into<String>, interval: Duration, reader: Box<dyn FeedReader>) -> Self {
        Self {
            name: name.into(),
            interval,
            reader,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(Self::new(
            &config.name,
            config.poll_interval(),
            reader_for(config)?,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serves demand until the coordinator cancels the link or stops.
    ///
    /// A failed read is logged and retried on the next interval; it does not
    /// use up demand, so the other sources keep merging.
    #[tracing::instrument(name = "source", skip_all, fields(feed = %self.name, source = %link.id()))]
    pub async fn run(self, mut link: SourceLink) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while let Some(demand) = link.next_demand().await {
            let mut remaining = demand;
            while remaining > 0 {
                ticker.tick().await;

                let read_start = std::time::Instant::now();
                match self.reader.read().await {
                    Ok(snapshot) => {
                        let elapsed = read_start.elapsed();
                        if elapsed > self.interval {
                            warn!(elapsed_ms = elapsed.as_millis() as u64, "Feed read was slow");
                        }
                        debug!(entities = snapshot.len(), "Delivering snapshot");
                        if link.deliver(vec![snapshot]).await.is_err() {
                            info!("Coordinator stopped; source exiting");
                            return;
                        }
                        remaining -= 1;
                    }
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "Feed read failed; retrying next interval");
                    }
                }
            }
        }

        info!("Demand stream closed; source stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Coordinator, CoordinatorSettings};
    use crate::entity::{Entity, TripUpdate};
    use crate::filter::FilterChain;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every other read.
    struct Flaky {
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedReader for Flaky {
        async fn read(&self) -> Result<Snapshot> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                anyhow::bail!("connection reset");
            }
            Ok(Snapshot::new(vec![
                TripUpdate {
                    trip_id: Some(format!("T{n}")),
                    ..Default::default()
                }
                .into(),
            ]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_source_retries_failed_reads() {
        let (mut coordinator, handle) =
            Coordinator::new(CoordinatorSettings::default(), FilterChain::default());
        let mut out = coordinator.attach_consumer();
        let coordinator_task = tokio::spawn(coordinator.run());

        let reads = Arc::new(AtomicUsize::new(0));
        let source = PollingSource::new(
            "flaky",
            Duration::from_secs(5),
            Box::new(Flaky {
                reads: reads.clone(),
            }),
        );
        let link = handle.subscribe().await.unwrap();
        let source_task = tokio::spawn(source.run(link));

        let first = out.recv().await.unwrap();
        assert_eq!(first.iter().filter_map(Entity::trip_id).collect::<Vec<_>>(), vec!["T1"]);
        let second = out.recv().await.unwrap();
        assert_eq!(second.iter().filter_map(Entity::trip_id).collect::<Vec<_>>(), vec!["T3"]);
        assert!(reads.load(Ordering::SeqCst) >= 4);

        handle.shutdown().await.unwrap();
        coordinator_task.await.unwrap().unwrap();
        // the demand channel closes with the coordinator
        source_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_feed_missing_file_errors() {
        let feed = FileFeed::new("/nonexistent/feed.pb");
        let err = feed.read().await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/feed.pb"));
    }

    #[test]
    fn test_reader_for_requires_key_env() {
        let config = SourceConfig {
            name: "secured".to_string(),
            url: "https://example.com/feed.pb".to_string(),
            poll_interval_secs: 5,
            fetch_timeout_secs: 5,
            auth: SourceAuth::Bearer {
                key_env: "GTFS_RT_MERGER_TEST_UNSET_KEY".to_string(),
            },
        };
        let err = reader_for(&config).err().unwrap();
        assert!(err.to_string().contains("GTFS_RT_MERGER_TEST_UNSET_KEY"));
    }
}
