//! Metrics collaborator: asynchronous persistence of tracking events.
//!
//! The annotator records points through `MetricsSink::record`, which never
//! blocks. `InfluxSink` batches points on a background thread and writes them
//! as InfluxDB line protocol over HTTP; `NullSink` discards everything.

use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError};

use crate::annotate::labels::ObjectLabel;
use crate::registry::ChannelId;
use crate::tracking::Collision;

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_RETRY: Duration = Duration::from_secs(1);
const QUEUE_CAPACITY: usize = 4096;
const MAX_BATCH: usize = 500;

#[derive(Clone, Debug, PartialEq)]
pub enum MetricPoint {
    ObjectCount {
        channel: ChannelId,
        label: ObjectLabel,
        count: usize,
    },
    Collision(Collision),
}

impl MetricPoint {
    /// Render as one line of InfluxDB line protocol.
    pub fn to_line(&self, timestamp_ms: u128) -> String {
        match self {
            MetricPoint::ObjectCount {
                channel,
                label,
                count,
            } => format!(
                "objects,channel=channel{},label={} count={}i {}",
                channel, label, count, timestamp_ms
            ),
            MetricPoint::Collision(c) => format!(
                "collision,channel=channel{},first_label={},second_label={} first_id={}i,second_id={}i,x={},y={} {}",
                c.channel,
                c.labels.0,
                c.labels.1,
                c.first,
                c.second,
                c.position.0,
                c.position.1,
                timestamp_ms
            ),
        }
    }
}

pub trait MetricsSink: Send + Sync {
    /// Queue a point for persistence. Must not block.
    fn record(&self, point: MetricPoint);
}

/// Sink that drops every point.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&self, _point: MetricPoint) {}
}

/// Sink that keeps points in memory; used in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<Vec<MetricPoint>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, point: MetricPoint) {
        if let Ok(mut points) = self.points.lock() {
            points.push(point);
        }
    }
}

#[derive(Clone, Debug)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://influxdb:8086`.
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub flush_interval: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            database: "itm_metadata".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            flush_interval: Duration::from_secs(1),
        }
    }
}

pub struct InfluxSink {
    tx: Option<Sender<MetricPoint>>,
    join: Option<JoinHandle<()>>,
}

impl InfluxSink {
    /// Wait for the server, recreate the database, start the writer thread.
    pub fn connect(config: InfluxConfig) -> Result<Self> {
        url::Url::parse(&config.url)
            .with_context(|| format!("invalid influxdb url '{}'", config.url))?;

        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match query(&config, &format!("DROP DATABASE \"{}\"", config.database)) {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    log::info!(
                        "influxdb not reachable yet (attempt {}/{}), retrying...",
                        attempt,
                        CONNECT_ATTEMPTS
                    );
                    last_err = Some(err);
                    std::thread::sleep(CONNECT_RETRY);
                }
            }
        }
        if let Some(err) = last_err {
            return Err(err.context(format!("can't connect to influxdb at {}", config.url)));
        }
        query(&config, &format!("CREATE DATABASE \"{}\"", config.database))?;
        log::info!("influxdb database '{}' ready at {}", config.database, config.url);

        let (tx, rx) = crossbeam_channel::bounded::<MetricPoint>(QUEUE_CAPACITY);
        let join = std::thread::Builder::new()
            .name("influx-writer".to_string())
            .spawn(move || {
                let mut batch: Vec<String> = Vec::with_capacity(MAX_BATCH);
                let mut last_flush = Instant::now();
                loop {
                    let disconnected = match rx.recv_timeout(config.flush_interval) {
                        Ok(point) => {
                            batch.push(point.to_line(now_ms()));
                            false
                        }
                        Err(RecvTimeoutError::Timeout) => false,
                        Err(RecvTimeoutError::Disconnected) => true,
                    };
                    let due = batch.len() >= MAX_BATCH
                        || last_flush.elapsed() >= config.flush_interval;
                    if !batch.is_empty() && (due || disconnected) {
                        if let Err(err) = write_lines(&config, &batch) {
                            log::warn!("influxdb write of {} point(s) failed: {}", batch.len(), err);
                        }
                        batch.clear();
                        last_flush = Instant::now();
                    }
                    if disconnected {
                        break;
                    }
                }
            })
            .context("spawn influx writer thread")?;

        Ok(Self {
            tx: Some(tx),
            join: Some(join),
        })
    }

    /// Flush pending points and stop the writer thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.tx.take();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("influx writer thread panicked"))?;
        }
        Ok(())
    }
}

impl MetricsSink for InfluxSink {
    fn record(&self, point: MetricPoint) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(point) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::debug!("influx queue full, point dropped"),
            Err(TrySendError::Disconnected(_)) => log::debug!("influx writer stopped, point dropped"),
        }
    }
}

impl Drop for InfluxSink {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("influx sink shutdown: {}", err);
        }
    }
}

fn query(config: &InfluxConfig, q: &str) -> Result<()> {
    ureq::post(&format!("{}/query", config.url.trim_end_matches('/')))
        .query("u", &config.username)
        .query("p", &config.password)
        .query("q", q)
        .timeout(Duration::from_secs(3))
        .call()
        .with_context(|| format!("influxdb query '{}'", q))?;
    Ok(())
}

fn write_lines(config: &InfluxConfig, lines: &[String]) -> Result<()> {
    ureq::post(&format!("{}/write", config.url.trim_end_matches('/')))
        .query("db", &config.database)
        .query("u", &config.username)
        .query("p", &config.password)
        .query("precision", "ms")
        .timeout(Duration::from_secs(5))
        .send_string(&lines.join("\n"))
        .context("influxdb write")?;
    Ok(())
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_count_line_protocol() {
        let point = MetricPoint::ObjectCount {
            channel: 3,
            label: ObjectLabel::Car,
            count: 2,
        };
        assert_eq!(point.to_line(1000), "objects,channel=channel3,label=car count=2i 1000");
    }

    #[test]
    fn collision_line_protocol() {
        let point = MetricPoint::Collision(Collision {
            channel: 0,
            first: 4,
            second: 9,
            labels: (ObjectLabel::Car, ObjectLabel::Bicycle),
            position: (10.5, 20.0),
        });
        assert_eq!(
            point.to_line(7),
            "collision,channel=channel0,first_label=car,second_label=bicycle first_id=4i,second_id=9i,x=10.5,y=20 7"
        );
    }

    #[test]
    fn memory_sink_collects_points() {
        let sink = MemorySink::new();
        sink.record(MetricPoint::ObjectCount {
            channel: 0,
            label: ObjectLabel::Person,
            count: 1,
        });
        assert_eq!(sink.points().len(), 1);
    }

    #[test]
    fn invalid_url_fails_fast() {
        let cfg = InfluxConfig {
            url: "not a url".to_string(),
            ..InfluxConfig::default()
        };
        assert!(InfluxSink::connect(cfg).is_err());
    }
}
