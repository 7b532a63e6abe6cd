//! Client (§4.6): per host, supervises one [`Clientlet`] per local backup
//! context, staggering their startup and periodically logging status.
//! Grounded on `original_source/client_lite.py`'s `Client` class.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::info;

use crate::clientlet::Clientlet;
use crate::config::Config;

const STAGGER: Duration = Duration::from_secs(30);
const AUDIT_INTERVAL: Duration = Duration::from_secs(60);

pub struct Client {
    clientlets: Vec<Arc<Mutex<Clientlet>>>,
    bail_handles: Vec<Arc<std::sync::atomic::AtomicBool>>,
}

impl Client {
    /// Enumerates local backup contexts (addresses whose host matches
    /// `hostname`) and builds one Clientlet per context. Per §3, a
    /// clientlet's `client_id` is simply its own `backup_context` — no
    /// second hash.
    pub fn new(cfg: &Config, hostname: &str) -> Self {
        let built: Vec<Clientlet> = cfg
            .local_contexts("backup", hostname)
            .into_iter()
            .map(|decl| {
                let client_id = decl.context.clone();
                Clientlet::from_config(cfg, &decl, client_id)
            })
            .collect();
        let bail_handles = built.iter().map(Clientlet::bail_handle).collect();
        let clientlets = built.into_iter().map(|c| Arc::new(Mutex::new(c))).collect();
        Self { clientlets, bail_handles }
    }

    pub fn is_empty(&self) -> bool {
        self.clientlets.is_empty()
    }

    /// Flips every clientlet's bail flag; each one stops between cycles,
    /// never mid-commit.
    pub fn request_shutdown(&self) {
        for flag in &self.bail_handles {
            flag.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Spawns one supervising task per clientlet, staggered by
    /// [`STAGGER`], plus a periodic status-audit task; runs until every
    /// clientlet's bail flag is set (or forever, if none ever is).
    pub async fn run(self) {
        let this = Arc::new(self);
        let mut handles = Vec::new();
        for (i, clientlet) in this.clientlets.iter().cloned().enumerate() {
            let delay = STAGGER * i as u32;
            handles.push(tokio::spawn(async move {
                sleep(delay).await;
                clientlet.lock().await.startup().await;
                loop {
                    let mut guard = clientlet.lock().await;
                    if guard.should_bail() {
                        break;
                    }
                    guard.run_cycle().await;
                }
            }));
        }

        let audit = Arc::clone(&this);
        handles.push(tokio::spawn(async move { audit.audit_loop().await }));

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn audit_loop(&self) {
        loop {
            sleep(AUDIT_INTERVAL).await;
            for clientlet in &self.clientlets {
                info!("{}", clientlet.lock().await.audit_line());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_two_local_backups() -> Config {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetmesh.conf");
        std::fs::write(
            &path,
            "PORT: 5005\n\n\
             source: alpha:/srv/media\ncopies: 1\n\n\
             backup: here:/mnt/b1\nsize: 1gb\n\n\
             backup: here:/mnt/b2\nsize: 1gb\n",
        )
        .unwrap();
        Config::load(&path).unwrap()
    }

    #[tokio::test]
    async fn request_shutdown_flips_every_clientlet() {
        let cfg = config_with_two_local_backups();
        let client = Client::new(&cfg, "here");
        assert_eq!(client.clientlets.len(), 2);
        for c in &client.clientlets {
            assert!(!c.lock().await.should_bail());
        }

        client.request_shutdown();

        for c in &client.clientlets {
            assert!(c.lock().await.should_bail());
        }
    }
}
