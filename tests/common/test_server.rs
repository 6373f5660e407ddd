//! In-process runpad service bound to an ephemeral port

use anyhow::Result;
use runpad_cli::{start_server, AppState};
use runpad_sandbox::{ExecutionCoordinator, SandboxConfig};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A running service; shut down on drop
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl TestServer {
    /// Start the service on 127.0.0.1 with a random port
    pub async fn start(config: SandboxConfig, max_concurrent_runs: usize) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = AppState::new(ExecutionCoordinator::new(config), max_concurrent_runs);

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(start_server(listener, state, async {
            let _ = rx.await;
        }));

        Ok(Self {
            addr,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop accepting requests and wait for in-flight ones
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
