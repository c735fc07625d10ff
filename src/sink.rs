//! Downstream consumers of merged batches.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info};

use crate::config::SinkConfig;
use crate::coordinator::Batch;
use crate::entity::Entity;
use crate::output::{append_record, build_feed, encode_feed, gzip};
use crate::stats::CycleStats;

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> String;

    async fn emit(&self, entities: &[Entity]) -> Result<()>;
}

fn encode(entities: &[Entity], compress: bool) -> Result<Bytes> {
    let timestamp = Utc::now().timestamp().max(0) as u64;
    let encoded = encode_feed(&build_feed(entities, timestamp))?;
    if compress {
        Ok(Bytes::from(gzip(&encoded)?))
    } else {
        Ok(encoded)
    }
}

/// Writes the merged feed to a local file. The file is replaced atomically
/// so readers never see a partial feed.
pub struct FileSink {
    path: PathBuf,
    gzip: bool,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, gzip: bool) -> Self {
        Self {
            path: path.into(),
            gzip,
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn emit(&self, entities: &[Entity]) -> Result<()> {
        let body = encode(entities, self.gzip)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(bytes = body.len(), path = %self.path.display(), "Feed written");
        Ok(())
    }
}

/// Uploads the merged feed to S3 on every cycle.
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    gzip: bool,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: String, key: String, gzip: bool) -> Self {
        Self {
            client,
            bucket,
            key,
            gzip,
        }
    }
}

#[async_trait]
impl Sink for S3Sink {
    fn name(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    async fn emit(&self, entities: &[Entity]) -> Result<()> {
        let body = encode(entities, self.gzip)?;

        let mut put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type("application/x-protobuf")
            .body(ByteStream::from(body));
        if self.gzip {
            put = put.content_encoding("gzip");
        }
        put.send()
            .await
            .with_context(|| format!("S3 PutObject failed for '{}'", self.key))?;

        Ok(())
    }
}

/// Appends one [`CycleStats`] row per cycle to a CSV file. Writes run on
/// the blocking pool.
pub struct StatsSink {
    path: PathBuf,
}

impl StatsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Sink for StatsSink {
    fn name(&self) -> String {
        format!("stats:{}", self.path.display())
    }

    async fn emit(&self, entities: &[Entity]) -> Result<()> {
        let stats = CycleStats::from_entities(entities);
        let path = self
            .path
            .to_str()
            .with_context(|| format!("non UTF-8 stats path {}", self.path.display()))?
            .to_string();

        // csv writes through std::fs
        tokio::task::spawn_blocking(move || append_record(&path, &stats))
            .await
            .context("stats writer task failed")?
    }
}

/// Builds a sink from its configuration. S3 sinks load AWS settings from the
/// environment.
pub async fn sink_from_config(config: &SinkConfig) -> Result<Box<dyn Sink>> {
    Ok(match config {
        SinkConfig::File { path, gzip } => Box::new(FileSink::new(path, *gzip)),
        SinkConfig::S3 { bucket, key, gzip } => {
            let aws = aws_config::load_from_env().await;
            Box::new(S3Sink::new(
                aws_sdk_s3::Client::new(&aws),
                bucket.clone(),
                key.clone(),
                *gzip,
            ))
        }
        SinkConfig::Stats { path } => Box::new(StatsSink::new(path)),
    })
}

/// Feeds every batch from `batches` into `sink` until the coordinator stops.
/// Write failures are logged; the next cycle is attempted regardless.
pub fn spawn_sink(sink: Box<dyn Sink>, mut batches: mpsc::Receiver<Batch>) -> JoinHandle<()> {
    let span = tracing::info_span!("sink", sink = %sink.name());
    tokio::spawn(
        async move {
            while let Some(batch) = batches.recv().await {
                match sink.emit(&batch).await {
                    Ok(()) => debug!(entities = batch.len(), "Batch written"),
                    Err(e) => error!(error = %format!("{e:#}"), "Sink write failed"),
                }
            }
            info!("Sink stopped");
        }
        .instrument(span),
    )
}
