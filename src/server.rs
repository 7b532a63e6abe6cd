//! Server (§4.4): per host, accepts connections and dispatches requests by
//! `source_context` to the matching [`Servlet`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::servlet::Servlet;
use crate::transport::{Connection, Value};

pub struct Server {
    servlets: BTreeMap<String, Arc<Servlet>>,
    compressed: bool,
}

impl Server {
    pub fn new(servlets: BTreeMap<String, Arc<Servlet>>, compressed: bool) -> Self {
        Self { servlets, compressed }
    }

    pub async fn run(self: Arc<Self>, bind_addr: &str) -> std::io::Result<()> {
        for servlet in self.servlets.values() {
            let servlet = Arc::clone(servlet);
            tokio::spawn(async move { servlet.run_scan_loop().await });
        }

        let this = Arc::clone(&self);
        tokio::spawn(async move { this.audit_loop().await });

        let listener = TcpListener::bind(bind_addr).await?;
        info!(addr = %bind_addr, "server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    warn!(%peer, error = %e, "connection handler exited");
                }
            });
        }
    }

    async fn audit_loop(&self) {
        loop {
            sleep(Duration::from_secs(15)).await;
            for servlet in self.servlets.values() {
                info!("{}", servlet.audit_line());
            }
        }
    }

    /// Receives, dispatches, responds, repeats — until the peer closes.
    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let mut conn = Connection::new(stream, self.compressed).with_read_timeout(crate::transport::DEFAULT_READ_TIMEOUT);
        loop {
            let request = match conn.receive().await {
                Ok(v) => v,
                Err(e) if e.is_not_connected() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let response = self.dispatch(request).await;
            conn.send(&response).await?;
        }
    }

    /// Routes by `source_context`; an unknown context or action returns
    /// null rather than erroring the connection (§4.4).
    async fn dispatch(&self, request: Value) -> Value {
        let Some(items) = request.as_list() else { return Value::Null };
        if items.len() < 3 {
            return Value::Null;
        }
        let (Some(action), Some(source_context), Some(client_id)) =
            (items[0].as_str(), items[1].as_str(), items[2].as_str())
        else {
            return Value::Null;
        };
        let Some(servlet) = self.servlets.get(source_context) else { return Value::Null };
        let args = &items[3..];

        match action {
            "metadata" => servlet.metadata(),
            "list" => servlet.list().await,
            "claim" => servlet.claim(client_id, &paths_arg(args)),
            "unclaim" => servlet.unclaim(client_id, &paths_arg(args)).await,
            "unclaim all" => servlet.unclaim_all(client_id),
            _ => Value::Null,
        }
    }
}

fn paths_arg(args: &[Value]) -> Vec<String> {
    args.first()
        .and_then(|v| v.as_list())
        .map(|list| list.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_servlet(dir: &std::path::Path) -> Arc<Servlet> {
        Arc::new(Servlet::new(
            "deadbeef".to_string(),
            dir.to_path_buf(),
            1,
            Duration::from_secs(60),
            vec![],
            dir.join(".claims.json.bz2"),
            Duration::from_secs(0),
        ))
    }

    #[tokio::test]
    async fn dispatch_unknown_context_returns_null() {
        let dir = tempdir().unwrap();
        let mut servlets = BTreeMap::new();
        servlets.insert("deadbeef".to_string(), make_servlet(dir.path()));
        let server = Server::new(servlets, false);

        let req = Value::List(vec![Value::from("metadata"), Value::from("unknownctx"), Value::from("client1")]);
        let resp = server.dispatch(req).await;
        assert!(resp.is_null());
    }

    #[tokio::test]
    async fn dispatch_unknown_action_returns_null() {
        let dir = tempdir().unwrap();
        let mut servlets = BTreeMap::new();
        servlets.insert("deadbeef".to_string(), make_servlet(dir.path()));
        let server = Server::new(servlets, false);

        let req = Value::List(vec![Value::from("frobnicate"), Value::from("deadbeef"), Value::from("client1")]);
        let resp = server.dispatch(req).await;
        assert!(resp.is_null());
    }

    #[tokio::test]
    async fn dispatch_claim_then_list() {
        let dir = tempdir().unwrap();
        let servlet = make_servlet(dir.path());
        let mut servlets = BTreeMap::new();
        servlets.insert("deadbeef".to_string(), servlet.clone());
        let server = Server::new(servlets, false);

        let claim = Value::List(vec![
            Value::from("claim"),
            Value::from("deadbeef"),
            Value::from("client1"),
            Value::List(vec![Value::from("a.txt")]),
        ]);
        let resp = server.dispatch(claim).await;
        assert!(resp.is_ack());
    }

    #[test]
    fn malformed_envelope_is_null_not_a_panic() {
        assert!(paths_arg(&[]).is_empty());
    }
}
