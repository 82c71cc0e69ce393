//! Remote key-value backend (valkey/redis).
//!
//! Layout: `fp:{source}:{digest}` → `1` with native TTL, sorted set
//! `fp_idx:{source}` scored by creation time for LRU trimming, and
//! `state:{source}` → epoch seconds of the last successful scrape end.

use super::{ScrapeStore, StoreError, MAX_INSERT_BATCH};
use crate::config::ValkeyStoreConfig;
use crate::fingerprint::hex_digest;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashSet;

const FP_PREFIX: &str = "fp";
const INDEX_PREFIX: &str = "fp_idx";
const STATE_PREFIX: &str = "state";

pub struct ValkeyStore {
    conn: ConnectionManager,
}

impl ValkeyStore {
    pub async fn connect(cfg: &ValkeyStoreConfig) -> Result<Self, StoreError> {
        let password = match &cfg.password {
            Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                StoreError::Unavailable(format!(
                    "valkey password environment variable '{}' is not set",
                    env_name
                ))
            })?),
            None => None,
        };
        let addr = if cfg.ssl {
            redis::ConnectionAddr::TcpTls {
                host: cfg.host.clone(),
                port: cfg.port,
                insecure: false,
                tls_params: None,
            }
        } else {
            redis::ConnectionAddr::Tcp(cfg.host.clone(), cfg.port)
        };
        let info = redis::ConnectionInfo {
            addr,
            redis: redis::RedisConnectionInfo {
                db: cfg.db,
                username: None,
                password,
                protocol: redis::ProtocolVersion::RESP2,
            },
        };
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn fp_key(source: &str, digest: &[u8]) -> String {
        format!("{}:{}:{}", FP_PREFIX, source, hex_digest(digest))
    }

    fn index_key(source: &str) -> String {
        format!("{}:{}", INDEX_PREFIX, source)
    }

    fn state_key(source: &str) -> String {
        format!("{}:{}", STATE_PREFIX, source)
    }

    async fn scan_sources(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", INDEX_PREFIX);
        let mut keys = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        Ok(keys
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(&format!("{}:", INDEX_PREFIX))
                    .map(str::to_string)
            })
            .collect())
    }
}

#[async_trait]
impl ScrapeStore for ValkeyStore {
    async fn load_last_success(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.conn.clone();
        let epoch: Option<i64> = conn.get(Self::state_key(source)).await?;
        Ok(epoch.and_then(|e| Utc.timestamp_opt(e, 0).single()))
    }

    async fn save_last_success(&self, source: &str, end: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(Self::state_key(source), end.timestamp()).await?;
        Ok(())
    }

    async fn seen(&self, source: &str, digest: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(Self::fp_key(source, digest)).await?;
        Ok(exists)
    }

    async fn insert_many(
        &self,
        source: &str,
        digests: &[Vec<u8>],
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        if digests.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp() as f64;
        let index_key = Self::index_key(source);
        for chunk in digests.chunks(MAX_INSERT_BATCH) {
            let mut pipe = redis::pipe();
            for digest in chunk {
                pipe.set_ex(Self::fp_key(source, digest), 1, ttl_seconds)
                    .ignore();
                pipe.zadd(&index_key, hex_digest(digest), now).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn enforce_cap(&self, source: &str, max_entries: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let index_key = Self::index_key(source);
        let size: u64 = conn.zcard(&index_key).await?;
        if size <= max_entries {
            return Ok(0);
        }
        let overflow = (size - max_entries) as isize;
        let victims: Vec<String> = conn.zrange(&index_key, 0, overflow - 1).await?;
        if victims.is_empty() {
            return Ok(0);
        }
        let fp_keys: Vec<String> = victims
            .iter()
            .map(|hex| format!("{}:{}:{}", FP_PREFIX, source, hex))
            .collect();
        let _: () = conn.del(fp_keys).await?;
        let _: () = conn.zrem(&index_key, victims.clone()).await?;
        Ok(victims.len() as u64)
    }

    /// The value keys expire natively; this prunes index members whose value
    /// key is gone.
    async fn gc_expired(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let mut removed = 0u64;
        for source in self.scan_sources().await? {
            let index_key = Self::index_key(&source);
            let members: Vec<String> = conn.zrange(&index_key, 0, -1).await?;
            if members.is_empty() {
                continue;
            }
            let mut missing = Vec::new();
            for member in &members {
                let key = format!("{}:{}:{}", FP_PREFIX, source, member);
                let exists: bool = conn.exists(key).await?;
                if !exists {
                    missing.push(member.clone());
                }
            }
            if !missing.is_empty() {
                removed += missing.len() as u64;
                let _: () = conn.zrem(&index_key, missing).await?;
            }
        }
        Ok(removed)
    }

    async fn gc_orphans(&self, live_sources: &HashSet<String>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let mut removed = 0u64;
        for source in self.scan_sources().await? {
            if live_sources.contains(&source) {
                continue;
            }
            let index_key = Self::index_key(&source);
            let members: Vec<String> = conn.zrange(&index_key, 0, -1).await?;
            if !members.is_empty() {
                removed += members.len() as u64;
                let fp_keys: Vec<String> = members
                    .iter()
                    .map(|hex| format!("{}:{}:{}", FP_PREFIX, source, hex))
                    .collect();
                let _: () = conn.del(fp_keys).await?;
            }
            let _: () = conn.del(&index_key).await?;
            let _: () = conn.del(Self::state_key(&source)).await?;
        }
        Ok(removed)
    }
}
