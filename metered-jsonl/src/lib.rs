//! JSONL audit sink for `metered-core`. Appends one event per line.
//! Always writes; bring your own path.

use async_trait::async_trait;
use metered_core::audit::{AuditEvent, AuditSink};
use metered_core::error::StoreError;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    // Serializes appends so concurrent lines never interleave.
    write_lock: Arc<Mutex<()>>,
}

impl JsonlAuditSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into(), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn append(&self, event: &AuditEvent) -> io::Result<()> {
        let line = serde_json::to_string(event)? + "\n";
        let _guard = self.write_lock.lock().await;
        let mut file =
            tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.append(&event).await.map_err(|e| {
            tracing::warn!(
                target: "metered::audit",
                path = %self.path.display(),
                error = %e,
                "jsonl append failed"
            );
            StoreError::Backend(format!("audit log write: {e}"))
        })
    }
}

impl tower_service::Service<AuditEvent> for JsonlAuditSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AuditEvent) -> Self::Future {
        let sink = self.clone();
        Box::pin(async move { sink.append(&event).await })
    }
}
