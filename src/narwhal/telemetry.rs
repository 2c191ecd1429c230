use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs the process-wide Prometheus recorder. Call once at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// Which end of the tunnel a relay runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaySide {
    /// Public connection spliced to a data connection.
    Server,
    /// Data connection spliced to the local service.
    Client,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    pub id: String,
    pub sid: String,
    pub side: RelaySide,
    pub port: u16,
    pub peer: String,
    pub started_at_unix_ms: u64,
}

impl RelayInfo {
    pub fn new(sid: impl Into<String>, side: RelaySide, port: u16, peer: impl Into<String>) -> Self {
        Self {
            id: new_id("r"),
            sid: sid.into(),
            side,
            port,
            peer: peer.into(),
            started_at_unix_ms: now_unix_ms(),
        }
    }
}

/// Live relays, keyed by relay id.
#[derive(Debug, Default)]
pub struct RelayRegistry {
    relays: DashMap<String, RelayInfo>,
}

pub type SharedRelays = Arc<RelayRegistry>;

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, r: RelayInfo) {
        self.relays.insert(r.id.clone(), r);
    }

    pub fn remove(&self, id: &str) {
        self.relays.remove(id);
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn snapshot(&self) -> Vec<RelayInfo> {
        let mut out: Vec<RelayInfo> = self.relays.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Process-unique id such as `s12` or `r7`.
pub fn new_id(prefix: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{n}")
}
