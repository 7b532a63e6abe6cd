//! Clientlet (§4.5): one per local backup context, polls its sources, runs
//! the pure [`planner`], and commits the resulting plan (claim, copy,
//! drop) each cycle. Grounded on `original_source/client_lite.py`'s
//! `Clientlet` class; the algorithmic core lives in [`planner`], this
//! module is the I/O shell around it.

pub mod planner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::claimmap::ExpiringClaimMap;
use crate::config::{host_for, path_for, Config, ContextDecl, GLOBAL};
use crate::scanner::DirScanner;
use crate::support::diskfree::disk_free_bytes;
use crate::support::elapsed::ElapsedTimer;
use crate::transfer::{self, TransferReport};
use crate::transport::{value::envelope, Connection, Value};

const DEFAULT_RSYNC_TIMEOUT: Duration = Duration::from_secs(180);

/// §4.5's "monotonic time-in-state accumulator": the current label plus a
/// running total per label, matching `client_lite.py`'s `self.states` dict
/// (`self.states[self.current_state] += self.state_timer.elapsed()`,
/// surfaced via `show_states()`). Purely informational, per spec.md.
struct StateTracker {
    current: &'static str,
    since: ElapsedTimer,
    totals: BTreeMap<&'static str, Duration>,
}

impl StateTracker {
    fn new(initial: &'static str) -> Self {
        Self { current: initial, since: ElapsedTimer::new(), totals: BTreeMap::new() }
    }

    fn restate(&mut self, label: &'static str) {
        *self.totals.entry(self.current).or_insert(Duration::ZERO) += self.since.elapsed();
        self.current = label;
        self.since.reset();
    }

    fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .totals
            .iter()
            .map(|(label, total)| format!("{label}={}", crate::support::duration::to_string(*total)))
            .collect();
        let current_elapsed = self.since.elapsed();
        parts.push(format!("{}={} (current)", self.current, crate::support::duration::to_string(current_elapsed)));
        parts.join(" ")
    }
}

/// Either a fixed byte budget or a dynamic free-space reservation (§4.5
/// "Allocation"). Exactly one is configured per backup context.
#[derive(Debug, Clone, Copy)]
pub enum Allocation {
    Size(u64),
    Reserve(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastCopy {
    Success,
    NotEnoughSpace,
    Unknown,
}

struct SourceRuntime {
    context: String,
    address: String,
    copies: u32,
    rescan: Duration,
    scanner: DirScanner,
}

impl SourceRuntime {
    fn local_root(&self, backup_root: &std::path::Path) -> PathBuf {
        backup_root.join(&self.context)
    }
}

pub struct Clientlet {
    client_id: String,
    backup_context: String,
    backup_root: PathBuf,
    allocation: Allocation,
    port: u16,
    compressed: bool,
    sources: Vec<SourceRuntime>,
    renewals: ExpiringClaimMap,
    state: Mutex<StateTracker>,
    last_copy: LastCopy,
    bail: Arc<AtomicBool>,
    rsync_timeout: Duration,
}

impl Clientlet {
    /// Builds a Clientlet for one backup context from its slice of the
    /// config: its declared sources (minus any `ignore source` prefixes),
    /// `size`/`reserve`, and the global `PORT`/`LAZY WRITE` settings.
    pub fn from_config(cfg: &Config, backup: &ContextDecl, client_id: String) -> Self {
        let backup_root = path_for(&backup.address);
        let port = cfg.get_int(&backup.context, "PORT", 5005) as u16;
        let compressed = cfg.get_int(&backup.context, "compressed", 1) != 0;
        let lazy_write = cfg.get_duration(&backup.context, "LAZY WRITE", Duration::from_secs(30));
        let ignore_prefixes = cfg.get_list(&backup.context, "ignore source");

        let allocation = match cfg.get(&backup.context, "reserve") {
            Some(_) => Allocation::Reserve(cfg.get_size(&backup.context, "reserve", 0)),
            None => Allocation::Size(cfg.get_size(&backup.context, "size", 0)),
        };

        let sources = cfg
            .sources()
            .into_iter()
            .filter(|s| !ignore_prefixes.iter().any(|p| s.address.starts_with(p.as_str())))
            .map(|decl| {
                let copies = cfg.get_int(&decl.context, "copies", 1).max(1) as u32;
                let rescan = cfg.get_duration(&decl.context, "rescan", Duration::from_secs(3600));
                let ignore_suffixes = cfg.get_list(&decl.context, "ignore suffix");
                let root = backup_root.join(&decl.context);
                SourceRuntime {
                    context: decl.context,
                    address: decl.address,
                    copies,
                    rescan,
                    scanner: DirScanner::new(root, ignore_suffixes),
                }
            })
            .collect::<Vec<_>>();

        let renewals_path = backup_root.join(format!(".{}.renewals.json.bz2", backup.context));
        let rsync_timeout = cfg.get_duration(GLOBAL, "RSYNC TIMEOUT", DEFAULT_RSYNC_TIMEOUT);

        Self {
            client_id,
            backup_context: backup.context.clone(),
            backup_root,
            allocation,
            port,
            compressed,
            sources,
            renewals: ExpiringClaimMap::load(renewals_path, lazy_write),
            state: Mutex::new(StateTracker::new("startup")),
            last_copy: LastCopy::Unknown,
            bail: Arc::new(AtomicBool::new(false)),
            rsync_timeout,
        }
    }

    pub fn backup_context(&self) -> &str {
        &self.backup_context
    }

    /// A shared handle that, once set, makes [`Clientlet::should_bail`]
    /// return `true` — §5's cooperative stop: checked between cycles, not
    /// inside one, so a running `run_cycle` always finishes its commit.
    pub fn bail_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.bail)
    }

    pub fn should_bail(&self) -> bool {
        self.bail.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> &'static str {
        self.state.lock().unwrap().current
    }

    /// Time accumulated in each of the six states so far, plus time spent
    /// in the current one — §4.5's "monotonic time-in-state accumulator".
    pub fn state_summary(&self) -> String {
        self.state.lock().unwrap().summary()
    }

    fn restate(&self, label: &'static str) {
        self.state.lock().unwrap().restate(label);
    }

    fn min_rescan(&self) -> Duration {
        self.sources.iter().map(|s| s.rescan).min().unwrap_or(Duration::from_secs(3600))
    }

    async fn connect(&self, address: &str) -> Result<Connection<TcpStream>, crate::transport::Error> {
        let host = host_for(address);
        let stream = TcpStream::connect((host, self.port)).await?;
        Ok(Connection::new(stream, self.compressed).with_read_timeout(crate::transport::DEFAULT_READ_TIMEOUT))
    }

    async fn rpc(&self, source: &str, address: &str, action: &str, args: Vec<Value>) -> Option<Value> {
        let mut conn = match self.connect(address).await {
            Ok(c) => c,
            Err(e) => {
                warn!(%source, error = %e, "could not reach source");
                return None;
            }
        };
        let request = envelope(action, source, &self.client_id, args);
        if let Err(e) = conn.send(&request).await {
            warn!(%source, %action, error = %e, "send failed");
            return None;
        }
        match conn.receive().await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(%source, %action, error = %e, "receive failed");
                None
            }
        }
    }

    /// Step 1 of the run-forever cycle: scan local subdirectories,
    /// `unclaim_all` every source, then `claim` everything found on disk.
    pub async fn startup(&mut self) {
        self.restate("startup");
        for source in &mut self.sources {
            let _ = source.scanner.scan();
        }
        let addresses: Vec<(String, String)> =
            self.sources.iter().map(|s| (s.context.clone(), s.address.clone())).collect();
        for (context, address) in &addresses {
            self.rpc(context, address, "unclaim all", vec![]).await;
        }

        for source in &self.sources {
            let root = source.local_root(&self.backup_root);
            let mut owned = DirScanner::new(root, vec![]);
            if let Ok((inventory, _)) = owned.scan() {
                let paths: Vec<String> = inventory.keys().cloned().collect();
                if !paths.is_empty() {
                    let args = vec![Value::List(paths.iter().cloned().map(Value::from).collect())];
                    self.rpc(&source.context, &source.address, "claim", args).await;
                }
            }
        }
    }

    /// §4.5's run-forever cycle body: rescan, crawl, randomized sleep.
    pub async fn run_cycle(&mut self) {
        for source in &mut self.sources {
            let _ = source.scanner.scan();
        }
        self.crawl().await;

        let rescan = self.min_rescan();
        let lo = rescan / 4;
        let hi = (rescan / 2).max(lo + Duration::from_secs(1));
        let jitter = rand::thread_rng().gen_range(lo.as_secs()..=hi.as_secs());
        sleep(Duration::from_secs(jitter)).await;
    }

    /// §4.5 `crawl()`: fetch metadata + inventories, build the plan, commit.
    async fn crawl(&mut self) {
        self.restate("scanning");

        // Fetch metadata/list for every source before touching
        // `self.sources` mutably — `rpc` borrows `&self` across an await
        // point, which can't overlap a `&mut self.sources` iteration.
        let snapshot: Vec<(String, String)> = self.sources.iter().map(|s| (s.context.clone(), s.address.clone())).collect();
        let mut metas: BTreeMap<String, Option<Value>> = BTreeMap::new();
        let mut listings: BTreeMap<String, Option<Value>> = BTreeMap::new();
        for (context, address) in &snapshot {
            metas.insert(context.clone(), self.rpc(context, address, "metadata", vec![]).await);
            listings.insert(context.clone(), self.rpc(context, address, "list", vec![]).await);
        }

        for source in &mut self.sources {
            if let Some(Some(m)) = metas.get(&source.context).map(|v| v.as_ref().and_then(Value::as_map)) {
                if let Some(copies) = m.get("copies").and_then(Value::as_i64) {
                    source.copies = copies.max(1) as u32;
                }
                if let Some(rescan) = m.get("rescan").and_then(Value::as_i64) {
                    source.rescan = Duration::from_secs(rescan.max(1) as u64);
                }
            }
        }

        let mut inventories: BTreeMap<String, BTreeMap<String, (u64, u32)>> = BTreeMap::new();
        for (context, listing) in listings {
            let mut files = BTreeMap::new();
            if let Some(Value::Map(m)) = listing {
                for (path, v) in m {
                    if let Some(items) = v.as_list() {
                        if let (Some(size), Some(nclaimants)) = (items.first().and_then(Value::as_i64), items.get(1).and_then(Value::as_i64)) {
                            files.insert(path, (size.max(0) as u64, nclaimants.max(0) as u32));
                        }
                    }
                }
            }
            inventories.insert(context, files);
        }

        // Step 3: planned state starts as current on-disk state.
        let mut owned: std::collections::BTreeSet<(String, String)> = std::collections::BTreeSet::new();
        let mut consumption: i64 = 0;
        for source in &mut self.sources {
            if let Ok((current, _)) = source.scanner.scan() {
                for (path, size) in &current {
                    owned.insert((source.context.clone(), path.clone()));
                    consumption += *size as i64;
                }
            }
        }

        // Step 4: priority list.
        let mut list = Vec::new();
        for (source_ctx, files) in &inventories {
            let copies = self.sources.iter().find(|s| &s.context == source_ctx).map(|s| s.copies).unwrap_or(1);
            for (path, (size, nclaimants)) in files {
                list.push(planner::Uri::new(source_ctx.clone(), path.clone(), *size, *nclaimants, copies));
            }
        }

        let allocation = self.current_allocation(consumption);
        let probable_free = allocation - consumption;
        let mut state = planner::PlannerState::new(list, owned, probable_free);

        self.restate("selecting files");
        planner::pseudo_copy(&mut state);

        self.restate("rebalancing files");
        let drops = planner::pseudo_rebalance(&mut state);

        self.restate("copying & claiming");
        self.commit(&state, &drops).await;

        self.restate("resting");
    }

    fn current_allocation(&self, consumption: i64) -> i64 {
        match self.allocation {
            Allocation::Size(bytes) => bytes as i64,
            Allocation::Reserve(reserve) => {
                let free = disk_free_bytes(&self.backup_root) as i64;
                (consumption + free - reserve as i64).max(0)
            }
        }
    }

    /// Step 7 ("Commit"): delete and `unclaim` every dropped path *first* —
    /// matching `client_lite.py`'s `crawl()`, where `pseudo_rebalance`'s
    /// drops (`pseudo_drop_uri`'s `os.remove`) land before
    /// `rsync_everything()` runs — so the rebalance pass actually frees the
    /// disk space a tight/`reserve`-constrained copy was counting on; then
    /// batch-claim every planned path per source, sync files in place,
    /// rescan, and re-claim.
    async fn commit(&mut self, state: &planner::PlannerState, drops: &[(String, String)]) {
        self.apply_drops(drops).await;

        let mut by_source: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (source, path) in &state.owned {
            by_source.entry(source.clone()).or_default().push(path.clone());
        }

        self.claim_everything(&by_source).await;

        let mut any_failed = false;
        for source in &self.sources {
            let Some(paths) = by_source.get(&source.context) else { continue };
            let dst = source.local_root(&self.backup_root);
            // A remote (different-host) source is out of scope for in-place
            // copy; `path_for` still resolves to *some* local path, and
            // `sync_files` reports it unavailable when that path doesn't
            // exist here, so the cycle just retries next time.
            let src_root = path_for(&source.address);
            let report = self.sync_with_timeout(src_root, dst, paths.clone()).await;
            if !report.failed.is_empty() {
                any_failed = true;
                warn!(source = %source.context, failed = report.failed.len(), "some files did not transfer");
            }
        }
        self.last_copy = if any_failed { LastCopy::NotEnoughSpace } else { LastCopy::Success };

        for source in &mut self.sources {
            let _ = source.scanner.scan();
        }
        self.claim_everything(&by_source).await;
    }

    /// Runs `transfer::sync_files` (blocking, potentially large) on the
    /// blocking-task pool, bounded by `RSYNC TIMEOUT` — §5: "`rsync`-style
    /// copies inherit a configurable timeout". A blown timeout counts every
    /// requested path as failed for this cycle; the underlying copy keeps
    /// running in the background and the planner simply retries next time.
    async fn sync_with_timeout(&self, src_root: PathBuf, dst_root: PathBuf, paths: Vec<String>) -> TransferReport {
        let fallback_failed = paths.clone();
        let task = tokio::task::spawn_blocking(move || transfer::sync_files(&src_root, &dst_root, &paths));
        match tokio::time::timeout(self.rsync_timeout, task).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                warn!(error = %e, "transfer task panicked");
                TransferReport { succeeded: Vec::new(), failed: fallback_failed }
            }
            Err(_) => {
                warn!(timeout = ?self.rsync_timeout, "transfer exceeded RSYNC TIMEOUT");
                TransferReport { succeeded: Vec::new(), failed: fallback_failed }
            }
        }
    }

    async fn claim_everything(&self, by_source: &BTreeMap<String, Vec<String>>) {
        for source in &self.sources {
            let Some(paths) = by_source.get(&source.context) else { continue };
            if paths.is_empty() {
                continue;
            }
            let args = vec![Value::List(paths.iter().cloned().map(Value::from).collect())];
            let resp = self.rpc(&source.context, &source.address, "claim", args).await;
            match resp {
                Some(v) if v.is_ack() => {
                    debug!(source = %source.context, "renewing claims");
                    for path in paths {
                        let key = format!("{}:{}", source.context, path);
                        self.renewals.add(&key, &self.client_id, source.rescan);
                    }
                }
                _ => warn!(source = %source.context, "claim failed, not renewing"),
            }
        }
    }

    async fn apply_drops(&mut self, drops: &[(String, String)]) {
        let mut by_source: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (source, path) in drops {
            by_source.entry(source.clone()).or_default().push(path.clone());
        }
        for source in &self.sources {
            let Some(paths) = by_source.get(&source.context) else { continue };
            let root = source.local_root(&self.backup_root);
            for path in paths {
                let full = root.join(path);
                if let Err(e) = std::fs::remove_file(&full) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %full.display(), error = %e, "could not remove dropped file");
                    }
                }
                let key = format!("{}:{}", source.context, path);
                self.renewals.remove(&key, &self.client_id);
            }
            let args = vec![Value::List(paths.iter().cloned().map(Value::from).collect())];
            self.rpc(&source.context, &source.address, "unclaim", args).await;
        }
    }

    pub fn audit_line(&self) -> String {
        format!(
            "clientlet {} state={} last_copy={:?} states=[{}]",
            self.backup_context,
            self.state(),
            self.last_copy,
            self.state_summary()
        )
    }
}
