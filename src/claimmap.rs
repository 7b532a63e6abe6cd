//! Expiring claim map (§4.2): `file_path -> { client_id -> expiry }`, safe
//! for concurrent `add`/`remove`/`count` from many servlet connection
//! handlers plus a periodic expiry sweep, with lazy-write, atomic-rename,
//! bz2-compressed-JSON persistence (grounded on `persistent_dict.py`'s
//! `write()`/`lazy_write()`/`.busted`-quarantine pattern).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::support::elapsed::ElapsedTimer;

#[derive(Serialize, Deserialize, Default)]
struct OnDisk {
    /// path -> client_id -> expiry (unix seconds)
    claims: BTreeMap<String, BTreeMap<String, i64>>,
}

pub struct ExpiringClaimMap {
    path: PathBuf,
    claims: DashMap<String, DashMap<String, SystemTime>>,
    lazy_write: Duration,
    timer: Mutex<ElapsedTimer>,
}

impl ExpiringClaimMap {
    pub fn load(path: impl Into<PathBuf>, lazy_write: Duration) -> Self {
        let path = path.into();
        let claims = DashMap::new();
        match std::fs::File::open(&path) {
            Ok(f) => match Self::decode(f) {
                Ok(on_disk) => {
                    for (file_path, claimants) in on_disk.claims {
                        let inner = DashMap::new();
                        for (client, expiry_secs) in claimants {
                            inner.insert(client, UNIX_EPOCH + Duration::from_secs(expiry_secs.max(0) as u64));
                        }
                        claims.insert(file_path, inner);
                    }
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "claim map decode failed, quarantining and starting fresh");
                    let busted = busted_path(&path);
                    let _ = std::fs::rename(&path, &busted);
                }
            },
            Err(_) => {}
        }
        Self { path, claims, lazy_write, timer: Mutex::new(ElapsedTimer::new()) }
    }

    fn decode(f: std::fs::File) -> anyhow::Result<OnDisk> {
        let mut decoder = BzDecoder::new(f);
        let on_disk: OnDisk = serde_json::from_reader(&mut decoder)?;
        Ok(on_disk)
    }

    /// `add(path, client, ttl)`: `claimants[path][client] = now + ttl`.
    pub fn add(&self, path: &str, client: &str, ttl: Duration) {
        let inner = self.claims.entry(path.to_string()).or_default();
        inner.insert(client.to_string(), SystemTime::now() + ttl);
        drop(inner);
        self.maybe_persist();
    }

    pub fn remove(&self, path: &str, client: &str) {
        if let Some(inner) = self.claims.get(path) {
            inner.remove(client);
        }
        self.maybe_persist();
    }

    /// Removes every entry carrying `client`, across every file, atomically
    /// with respect to concurrent requests (each file's inner map has its
    /// own shard lock via `DashMap`; holding no path lock across files is
    /// fine here since entries are independent of each other).
    pub fn remove_all(&self, client: &str) {
        for entry in self.claims.iter() {
            entry.value().remove(client);
        }
        self.maybe_persist();
    }

    /// `active(path) -> set(client)`, transparently dropping expired
    /// entries it encounters.
    pub fn active(&self, path: &str) -> Vec<String> {
        let now = SystemTime::now();
        match self.claims.get(path) {
            Some(inner) => {
                let expired: Vec<String> = inner
                    .iter()
                    .filter(|e| *e.value() <= now)
                    .map(|e| e.key().clone())
                    .collect();
                for client in &expired {
                    inner.remove(client);
                }
                inner.iter().map(|e| e.key().clone()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn count(&self, path: &str) -> usize {
        self.active(path).len()
    }

    /// Sweeps every path's expired entries; called by the Servlet's `list`
    /// handler before it counts claimants (§4.3 "Expiry").
    pub fn sweep_expired(&self) {
        for entry in self.claims.iter() {
            let _ = self.active(entry.key());
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, i64>> {
        let mut out = BTreeMap::new();
        for entry in self.claims.iter() {
            let mut inner = BTreeMap::new();
            for c in entry.value().iter() {
                let secs = c.value().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
                inner.insert(c.key().clone(), secs);
            }
            out.insert(entry.key().clone(), inner);
        }
        out
    }

    fn maybe_persist(&self) {
        let mut timer = self.timer.lock().unwrap();
        if self.lazy_write.is_zero() || timer.elapsed() > self.lazy_write {
            drop(timer);
            if let Err(e) = self.write() {
                warn!(error = %e, path = %self.path.display(), "failed to persist claim map");
            }
            self.timer.lock().unwrap().reset();
        }
    }

    pub fn write(&self) -> anyhow::Result<()> {
        let on_disk = OnDisk { claims: self.snapshot() };
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp = tmp_path(&self.path);
        {
            let f = std::fs::File::create(&tmp)?;
            let mut encoder = BzEncoder::new(f, Compression::best());
            serde_json::to_writer(&mut encoder, &on_disk)?;
            encoder.finish()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

fn busted_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".busted");
    PathBuf::from(s)
}
