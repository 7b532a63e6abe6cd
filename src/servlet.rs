//! Servlet (§4.3): owns one `source_context` and one root path, maintains a
//! [`DirScanner`], an [`ExpiringClaimMap`], and coverage counters; answers
//! the five source-side RPCs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::claimmap::ExpiringClaimMap;
use crate::scanner::{DirScanner, Inventory};
use crate::support::error_tracker::ConsecutiveErrorTracker;
use crate::transport::Value;

#[derive(Default)]
struct Counters {
    claims: AtomicU64,
    unclaims: AtomicU64,
    premature_drops: AtomicU64,
    files_listed: AtomicU64,
}

pub struct Servlet {
    pub source_context: String,
    pub root: PathBuf,
    pub copies: u32,
    pub rescan: Duration,
    scanner: Mutex<DirScanner>,
    inventory: RwLock<Inventory>,
    claims: ExpiringClaimMap,
    ready: AtomicBool,
    counters: Counters,
    drop_tracker: ConsecutiveErrorTracker,
}

impl Servlet {
    pub fn new(
        source_context: String,
        root: PathBuf,
        copies: u32,
        rescan: Duration,
        ignore_suffixes: Vec<String>,
        claims_path: PathBuf,
        lazy_write: Duration,
    ) -> Self {
        Self {
            source_context,
            scanner: Mutex::new(DirScanner::new(&root, ignore_suffixes)),
            root,
            copies,
            rescan,
            inventory: RwLock::new(Inventory::new()),
            claims: ExpiringClaimMap::load(claims_path, lazy_write),
            ready: AtomicBool::new(false),
            counters: Counters::default(),
            drop_tracker: ConsecutiveErrorTracker::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Every `rescan` seconds: rescan the local tree, sleep. Files missing
    /// from the latest scan are forgotten for good (invariant 5) — next
    /// `list()` simply won't mention them, since the inventory snapshot is
    /// replaced wholesale.
    pub async fn run_scan_loop(&self) {
        loop {
            let (current, vanished) = {
                let mut scanner = self.scanner.lock().unwrap();
                match scanner.scan() {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(source = %self.source_context, error = %e, "scan failed");
                        (Inventory::new(), Vec::new())
                    }
                }
            };
            if !vanished.is_empty() {
                debug!(source = %self.source_context, count = vanished.len(), "files vanished since last scan");
            }
            *self.inventory.write().await = current;
            if !self.ready.swap(true, Ordering::Relaxed) {
                info!(source = %self.source_context, "servlet ready");
            }
            sleep(self.rescan).await;
        }
    }

    pub fn metadata(&self) -> Value {
        let mut m = BTreeMap::new();
        m.insert("copies".to_string(), Value::Int(self.copies as i64));
        m.insert("rescan".to_string(), Value::Int(self.rescan.as_secs() as i64));
        Value::Map(m)
    }

    /// `list`: snapshot of current inventory with live claim counts. Forces
    /// an expiry sweep first so stale clients are invisible.
    pub async fn list(&self) -> Value {
        self.claims.sweep_expired();
        let inventory = self.inventory.read().await;
        let mut out = BTreeMap::new();
        for (path, size) in inventory.iter() {
            let nclaimants = self.claims.count(path);
            out.insert(path.clone(), Value::List(vec![Value::Int(*size as i64), Value::Int(nclaimants as i64)]));
        }
        self.counters.files_listed.fetch_add(out.len() as u64, Ordering::Relaxed);
        Value::Map(out)
    }

    pub fn claim(&self, client_id: &str, paths: &[String]) -> Value {
        for path in paths {
            self.claims.add(path, client_id, self.rescan);
            self.counters.claims.fetch_add(1, Ordering::Relaxed);
        }
        Value::ack()
    }

    /// `unclaim`: for each path held by this client, remove the entry; if
    /// the file still exists in the inventory and wasn't overserved, log a
    /// premature drop (§8 scenario 4).
    pub async fn unclaim(&self, client_id: &str, paths: &[String]) -> Value {
        let inventory = self.inventory.read().await;
        for path in paths {
            let was_claimed = self.claims.active(path).contains(&client_id.to_string());
            if !was_claimed {
                continue;
            }
            self.claims.remove(path, client_id);
            self.counters.unclaims.fetch_add(1, Ordering::Relaxed);
            if inventory.contains_key(path) && self.claims.count(path) < self.copies as usize {
                self.counters.premature_drops.fetch_add(1, Ordering::Relaxed);
                if self.drop_tracker.record_error() {
                    warn!(source = %self.source_context, %path, client = %client_id, "premature drop: file now underserved");
                }
            }
        }
        Value::ack()
    }

    pub fn unclaim_all(&self, client_id: &str) -> Value {
        self.claims.remove_all(client_id);
        Value::ack()
    }

    pub fn audit_line(&self) -> String {
        format!(
            "servlet {} claims={} unclaims={} premature_drops={} files_listed={}",
            self.source_context,
            self.counters.claims.load(Ordering::Relaxed),
            self.counters.unclaims.load(Ordering::Relaxed),
            self.counters.premature_drops.load(Ordering::Relaxed),
            self.counters.files_listed.load(Ordering::Relaxed),
        )
    }

    pub fn premature_drop_count(&self) -> u64 {
        self.counters.premature_drops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn servlet(dir: &std::path::Path, copies: u32) -> Servlet {
        Servlet::new(
            "deadbeef".to_string(),
            dir.to_path_buf(),
            copies,
            Duration::from_secs(60),
            vec![],
            dir.join(".claims.json.bz2"),
            Duration::from_secs(0),
        )
    }

    #[tokio::test]
    async fn metadata_reports_copies_and_rescan() {
        let dir = tempdir().unwrap();
        let s = servlet(dir.path(), 2);
        let meta = s.metadata();
        let m = meta.as_map().unwrap();
        assert_eq!(m.get("copies").unwrap().as_i64(), Some(2));
        assert_eq!(m.get("rescan").unwrap().as_i64(), Some(60));
    }

    #[tokio::test]
    async fn claim_then_list_shows_claimant() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let s = servlet(dir.path(), 1);
        s.scanner.lock().unwrap().scan().unwrap();
        *s.inventory.write().await = {
            let mut m = Inventory::new();
            m.insert("a.txt".to_string(), 5);
            m
        };

        s.claim("client1", &["a.txt".to_string()]);
        let listing = s.list().await;
        let m = listing.as_map().unwrap();
        let entry = m.get("a.txt").unwrap().as_list().unwrap();
        assert_eq!(entry[1].as_i64(), Some(1));
    }

    #[tokio::test]
    async fn unclaim_all_clears_every_file() {
        let dir = tempdir().unwrap();
        let s = servlet(dir.path(), 1);
        *s.inventory.write().await = {
            let mut m = Inventory::new();
            m.insert("a.txt".to_string(), 1);
            m.insert("b.txt".to_string(), 1);
            m
        };
        s.claim("client1", &["a.txt".to_string(), "b.txt".to_string()]);
        s.unclaim_all("client1");
        let listing = s.list().await;
        let m = listing.as_map().unwrap();
        for (_, v) in m.iter() {
            assert_eq!(v.as_list().unwrap()[1].as_i64(), Some(0));
        }
    }

    #[tokio::test]
    async fn premature_drop_is_counted() {
        let dir = tempdir().unwrap();
        let s = servlet(dir.path(), 2);
        *s.inventory.write().await = {
            let mut m = Inventory::new();
            m.insert("a.txt".to_string(), 1);
            m
        };
        s.claim("client1", &["a.txt".to_string()]);
        s.unclaim("client1", &["a.txt".to_string()]).await;
        assert_eq!(s.premature_drop_count(), 1);
    }
}
