use crate::engine::EngineHandle;
use attend_core::{CsvDayStore, Gallery, Ledger, Method, RecordOutcome};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.attend.Attendance1";
pub const OBJECT_PATH: &str = "/org/attend/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.attend.Attendance1
/// Object path: /org/attend/Attendance1
pub struct AttendanceService {
    pub engines: Vec<EngineHandle>,
    pub gallery: Arc<Gallery>,
    pub ledger: Arc<Ledger<CsvDayStore>>,
}

impl AttendanceService {
    async fn with_ledger<R, F>(&self, op: F) -> zbus::fdo::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Ledger<CsvDayStore>) -> Result<R, attend_core::LedgerError> + Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || op(&ledger))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("ledger task failed: {e}")))?
            .map_err(|e| {
                tracing::error!(error = %e, "ledger operation failed");
                zbus::fdo::Error::Failed(e.to_string())
            })
    }
}

#[interface(name = "org.attend.Attendance1")]
impl AttendanceService {
    /// Per-camera loop status, gallery summary and today's count, as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let mut cameras = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            let entry = match engine.status().await {
                Ok(snapshot) => serde_json::json!({
                    "device": engine.device(),
                    "running": true,
                    "loop": snapshot,
                }),
                Err(_) => serde_json::json!({
                    "device": engine.device(),
                    "running": false,
                }),
            };
            cameras.push(entry);
        }

        let today = chrono::Local::now().date_naive();
        let present = self.with_ledger(move |l| l.present(today)).await?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "cameras": cameras,
            "gallery": {
                "entries": self.gallery.len(),
                "identities": self.gallery.identities(),
            },
            "date": today.to_string(),
            "present_count": present.len(),
        })
        .to_string())
    }

    /// Today's attendance records in write order, as a JSON array.
    async fn present(&self) -> zbus::fdo::Result<String> {
        let today = chrono::Local::now().date_naive();
        let records = self.with_ledger(move |l| l.present(today)).await?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Mark `identity` present through an external path (manual entry, card reader).
    ///
    /// Returns `true` if a row was written, `false` if already present today.
    async fn mark(&self, identity: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(identity, "external mark requested");
        let identity = identity.to_string();
        let now = chrono::Local::now().naive_local();
        let outcome = self
            .with_ledger(move |l| l.record(&identity, now, Method::External))
            .await?;
        Ok(matches!(outcome, RecordOutcome::Recorded(_)))
    }
}
