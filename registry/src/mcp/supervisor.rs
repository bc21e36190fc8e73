//! Process supervision for registered MCP servers
//!
//! Each registered server id owns a slot holding at most one
//! [`ManagedProcess`]. All lifecycle operations for an id are serialized on
//! that slot's lock, so a stop can never interleave with a start or an
//! in-flight discovery. Slots are created on first use of a registered id and
//! released when the record is removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::discovery::ToolEndpoint;
use super::process::{LaunchSpec, LaunchTimeouts, ManagedProcess};
use crate::config::SupervisorSection;
use crate::db::{Database, ServerRecord, ServerStatus};
use crate::error::{RegistryError, RegistryResult};

const NOT_SUPERVISED: &str = "process is not supervised by this registry instance";

impl From<&SupervisorSection> for LaunchTimeouts {
    fn from(section: &SupervisorSection) -> Self {
        Self {
            startup_timeout: section.startup_timeout(),
            startup_probe: section.startup_probe(),
            stop_grace: section.stop_grace(),
        }
    }
}

type ProcessHandle = Arc<AsyncMutex<Option<ManagedProcess>>>;
type ProcessGuard = OwnedMutexGuard<Option<ManagedProcess>>;

#[derive(Default)]
struct ProcessSlot {
    starting: AtomicBool,
    process: ProcessHandle,
}

/// Clears the slot's `starting` flag when a start attempt ends
struct StartingGuard<'a>(&'a AtomicBool);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Exclusive access to a running server's process
///
/// Holding a lease blocks stop and delete for the same id until it is dropped.
pub struct ProcessLease {
    guard: ProcessGuard,
}

impl ProcessLease {
    pub fn endpoint(&self) -> Option<ToolEndpoint> {
        (*self.guard).as_ref().and_then(ManagedProcess::endpoint)
    }
}

/// Owns the OS processes backing `running` server records
pub struct ProcessSupervisor {
    db: Database,
    timeouts: LaunchTimeouts,
    slots: Mutex<HashMap<String, Arc<ProcessSlot>>>,
}

impl ProcessSupervisor {
    pub fn new(db: Database, timeouts: LaunchTimeouts) -> Self {
        Self {
            db,
            timeouts,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> RegistryResult<MutexGuard<'_, HashMap<String, Arc<ProcessSlot>>>> {
        self.slots
            .lock()
            .map_err(|_| RegistryError::Internal(anyhow::anyhow!("Process table lock poisoned")))
    }

    /// Slot for a registered id; unknown ids never get one
    fn slot(&self, id: &str) -> RegistryResult<Arc<ProcessSlot>> {
        let mut slots = self.slots()?;
        if let Some(slot) = slots.get(id) {
            return Ok(slot.clone());
        }
        // Checked under the table lock so a concurrent remove cannot slip in
        self.require_record(id)?;
        Ok(slots.entry(id.to_string()).or_default().clone())
    }

    fn is_current(&self, id: &str, slot: &Arc<ProcessSlot>) -> RegistryResult<bool> {
        Ok(self
            .slots()?
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, slot)))
    }

    /// Lock the slot for `id`, retrying if it was released while waiting
    async fn lock(&self, id: &str) -> RegistryResult<ProcessGuard> {
        loop {
            let slot = self.slot(id)?;
            let guard = slot.process.clone().lock_owned().await;
            if self.is_current(id, &slot)? {
                return Ok(guard);
            }
        }
    }

    fn require_record(&self, id: &str) -> RegistryResult<ServerRecord> {
        self.db
            .get_server(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Launch the process for `id` and mark the record running
    ///
    /// Fails if the server is already running or another start is in flight.
    /// A failed launch leaves the record in `error` with the failure detail.
    pub async fn start(&self, id: &str) -> RegistryResult<ServerRecord> {
        let slot = self.slot(id)?;
        if slot.starting.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::start(id, "server is already starting"));
        }
        let _starting = StartingGuard(&slot.starting);

        let mut process = slot.process.lock().await;
        let record = self.require_record(id)?;
        if !self.is_current(id, &slot)? {
            return Err(RegistryError::start(id, "server was re-registered while starting"));
        }

        if self.reconcile_locked(&record, &mut process)? {
            return Err(RegistryError::start(id, "server is already running"));
        }

        let spec = match LaunchSpec::from_record(&record) {
            Ok(spec) => spec,
            Err(message) => return Err(self.record_start_failure(id, message)),
        };

        tracing::info!(
            server = %id,
            command = %spec.command,
            connection_type = %spec.connection_type,
            "Starting MCP server"
        );

        let launched = match ManagedProcess::launch(&spec, &self.timeouts).await {
            Ok(launched) => launched,
            Err(message) => return Err(self.record_start_failure(id, message)),
        };

        match self.db.set_server_status(id, ServerStatus::Running, None) {
            Ok(true) => {}
            Ok(false) => {
                // Record vanished outside the registry while launching
                let _ = launched.terminate(self.timeouts.stop_grace).await;
                return Err(RegistryError::NotFound(id.to_string()));
            }
            Err(e) => {
                let _ = launched.terminate(self.timeouts.stop_grace).await;
                return Err(e.into());
            }
        }

        tracing::info!(server = %id, pid = ?launched.pid(), "MCP server running");
        *process = Some(launched);

        self.require_record(id)
    }

    fn record_start_failure(&self, id: &str, message: String) -> RegistryError {
        tracing::warn!(server = %id, "Failed to start MCP server: {}", message);
        if let Err(e) = self
            .db
            .set_server_status(id, ServerStatus::Error, Some(&message))
        {
            tracing::error!(server = %id, "Failed to record start failure: {:#}", e);
        }
        RegistryError::start(id, message)
    }

    /// Terminate the process for `id` and mark the record stopped
    ///
    /// Succeeds without doing anything when the server is already stopped.
    pub async fn stop(&self, id: &str) -> RegistryResult<ServerRecord> {
        let mut process = self.lock(id).await?;
        let record = self.require_record(id)?;

        if process.is_some() {
            self.terminate_locked(id, &mut process).await?;
        } else if record.status == ServerStatus::Stopped {
            return Ok(record);
        }

        self.db.set_server_status(id, ServerStatus::Stopped, None)?;
        tracing::info!(server = %id, "MCP server stopped");
        self.require_record(id)
    }

    /// Stop the server, delete its record and release its slot
    ///
    /// The slot stays locked throughout, so nothing else for the id can run
    /// between the stop and the delete.
    pub async fn remove(&self, id: &str) -> RegistryResult<()> {
        let mut process = self.lock(id).await?;
        self.require_record(id)?;

        if process.is_some() {
            self.terminate_locked(id, &mut process).await?;
        }
        if !self.db.delete_server(id)? {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.slots()?.remove(id);
        Ok(())
    }

    async fn terminate_locked(
        &self,
        id: &str,
        process: &mut Option<ManagedProcess>,
    ) -> RegistryResult<()> {
        let Some(running) = process.take() else {
            return Ok(());
        };
        tracing::info!(server = %id, pid = ?running.pid(), "Stopping MCP server");
        if let Err(message) = running.terminate(self.timeouts.stop_grace).await {
            tracing::error!(server = %id, "Failed to stop MCP server: {}", message);
            self.db
                .set_server_status(id, ServerStatus::Error, Some(&message))?;
            return Err(RegistryError::stop(id, message));
        }
        Ok(())
    }

    /// Authoritative liveness check
    ///
    /// A process that died on its own is released here and its record moves
    /// to `error`. Waits for any operation in flight on the same id.
    pub async fn is_running(&self, id: &str) -> RegistryResult<bool> {
        let mut process = self.lock(id).await?;
        let record = self.require_record(id)?;
        self.reconcile_locked(&record, &mut process)
    }

    /// Reconcile `id` only if its slot is free
    ///
    /// A busy slot belongs to a start, stop or lease, which leaves the record
    /// consistent when it finishes.
    pub fn try_reconcile(&self, id: &str) -> RegistryResult<()> {
        let slots = self.slots()?;
        let Some(slot) = slots.get(id).cloned() else {
            // Never launched here; the table lock keeps a start out meanwhile
            if let Some(record) = self.db.get_server(id)? {
                self.reconcile_locked(&record, &mut None)?;
            }
            return Ok(());
        };
        drop(slots);

        let Ok(mut process) = slot.process.try_lock() else {
            tracing::debug!(server = %id, "Process slot busy, skipping reconciliation");
            return Ok(());
        };
        if let Some(record) = self.db.get_server(id)? {
            self.reconcile_locked(&record, &mut process)?;
        }
        Ok(())
    }

    /// Lock a running server's process for the duration of a discovery call
    pub async fn lease(&self, id: &str) -> RegistryResult<ProcessLease> {
        let mut guard = self.lock(id).await?;
        let record = self.require_record(id)?;
        if !self.reconcile_locked(&record, &mut guard)? {
            return Err(RegistryError::ServerNotRunning(id.to_string()));
        }
        Ok(ProcessLease { guard })
    }

    /// Bring the record's status in line with the process slot
    ///
    /// Returns whether a live process is held for the record.
    fn reconcile_locked(
        &self,
        record: &ServerRecord,
        process: &mut Option<ManagedProcess>,
    ) -> RegistryResult<bool> {
        let id = record.id.as_str();

        if let Some(running) = process.as_mut() {
            let exited = match running.exit_status() {
                Ok(None) => return Ok(true),
                Ok(Some(status)) => format!("process exited unexpectedly ({})", status),
                Err(e) => format!("process exited unexpectedly (wait failed: {})", e),
            };
            let message = format!("{}{}", exited, running.output_summary());
            tracing::warn!(server = %id, "{}", message);
            *process = None;
            self.db
                .set_server_status(id, ServerStatus::Error, Some(&message))?;
            return Ok(false);
        }

        if record.status == ServerStatus::Running {
            tracing::warn!(server = %id, "Record marked running without a process");
            self.db
                .set_server_status(id, ServerStatus::Error, Some(NOT_SUPERVISED))?;
        }
        Ok(false)
    }

    /// Terminate every supervised process
    ///
    /// Record statuses are left as they are so the next boot knows which
    /// servers were running.
    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Arc<ProcessSlot>)> = match self.slots() {
            Ok(slots) => slots
                .iter()
                .map(|(id, slot)| (id.clone(), slot.clone()))
                .collect(),
            Err(e) => {
                tracing::error!("Failed to terminate MCP servers: {}", e);
                return;
            }
        };

        for (id, slot) in slots {
            let running = slot.process.lock().await.take();
            if let Some(running) = running {
                tracing::info!(server = %id, "Terminating MCP server for shutdown");
                if let Err(message) = running.terminate(self.timeouts.stop_grace).await {
                    tracing::error!(server = %id, "Failed to terminate MCP server: {}", message);
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::db::{ConnectionType, NewServer};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (Arc<ProcessSupervisor>, Database, TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open_at(dir.path().join("test.db")).unwrap();
        let timeouts = LaunchTimeouts {
            startup_timeout: Duration::from_secs(5),
            startup_probe: Duration::from_millis(150),
            stop_grace: Duration::from_secs(1),
        };
        let supervisor = Arc::new(ProcessSupervisor::new(db.clone(), timeouts));
        (supervisor, db, dir)
    }

    /// Register an sse-type record so a plain command can stand in for a server
    fn register(db: &Database, id: &str, command: &str, args: &str) {
        db.create_server(NewServer {
            id: id.to_string(),
            description: String::new(),
            command: command.to_string(),
            args: args.to_string(),
            connection_type: ConnectionType::Sse,
            url: Some("http://127.0.0.1:1/sse".to_string()),
            env: BTreeMap::new(),
        })
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (supervisor, db, _dir) = setup();
        register(&db, "sleeper", "sleep", "30");

        let record = supervisor.start("sleeper").await.unwrap();
        assert_eq!(record.status, ServerStatus::Running);
        assert!(record.error_message.is_none());
        assert!(supervisor.is_running("sleeper").await.unwrap());

        let record = supervisor.stop("sleeper").await.unwrap();
        assert_eq!(record.status, ServerStatus::Stopped);
        assert!(!supervisor.is_running("sleeper").await.unwrap());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (supervisor, db, _dir) = setup();
        register(&db, "sleeper", "sleep", "30");

        supervisor.start("sleeper").await.unwrap();
        let err = supervisor.start("sleeper").await.unwrap_err();
        assert!(matches!(err, RegistryError::Start { .. }));
        assert!(err.to_string().contains("already running"));

        // The original process is untouched
        assert!(supervisor.is_running("sleeper").await.unwrap());
        assert_eq!(
            db.get_server("sleeper").unwrap().unwrap().status,
            ServerStatus::Running
        );
        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_start_fails_fast() {
        let (supervisor, db, _dir) = setup();
        register(&db, "sleeper", "sleep", "30");

        let first = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start("sleeper").await })
        };
        // Let the first start reach its startup probe
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = supervisor.start("sleeper").await.unwrap_err();
        assert!(err.to_string().contains("already starting"), "{}", err);

        first.await.unwrap().unwrap();
        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_records_error() {
        let (supervisor, db, _dir) = setup();
        register(&db, "broken", "/nonexistent/server-binary", "");

        let err = supervisor.start("broken").await.unwrap_err();
        assert!(matches!(err, RegistryError::Start { .. }));

        let record = db.get_server("broken").unwrap().unwrap();
        assert_eq!(record.status, ServerStatus::Error);
        assert!(record.error_message.unwrap().contains("command not found"));
        assert!(!supervisor.is_running("broken").await.unwrap());
    }

    #[tokio::test]
    async fn test_crash_is_detected() {
        let (supervisor, db, _dir) = setup();
        register(&db, "short", "sleep", "0.4");

        supervisor.start("short").await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(!supervisor.is_running("short").await.unwrap());
        let record = db.get_server("short").unwrap().unwrap();
        assert_eq!(record.status, ServerStatus::Error);
        assert!(record
            .error_message
            .unwrap()
            .contains("process exited unexpectedly"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (supervisor, db, _dir) = setup();
        register(&db, "idle", "sleep", "30");

        let record = supervisor.stop("idle").await.unwrap();
        assert_eq!(record.status, ServerStatus::Stopped);
        let record = supervisor.stop("idle").await.unwrap();
        assert_eq!(record.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_clears_error() {
        let (supervisor, db, _dir) = setup();
        register(&db, "broken", "/nonexistent/server-binary", "");
        let _ = supervisor.start("broken").await;

        let record = supervisor.stop("broken").await.unwrap();
        assert_eq!(record.status, ServerStatus::Stopped);
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn test_unsupervised_running_record() {
        let (supervisor, db, _dir) = setup();
        register(&db, "orphan", "sleep", "30");
        db.set_server_status("orphan", ServerStatus::Running, None)
            .unwrap();

        assert!(!supervisor.is_running("orphan").await.unwrap());
        let record = db.get_server("orphan").unwrap().unwrap();
        assert_eq!(record.status, ServerStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some(NOT_SUPERVISED));
    }

    #[tokio::test]
    async fn test_lease_requires_running() {
        let (supervisor, db, _dir) = setup();
        register(&db, "sleeper", "sleep", "30");

        let err = supervisor.lease("sleeper").await.err().unwrap();
        assert!(matches!(err, RegistryError::ServerNotRunning(_)));

        supervisor.start("sleeper").await.unwrap();
        let lease = supervisor.lease("sleeper").await.unwrap();
        assert!(matches!(lease.endpoint(), Some(ToolEndpoint::Sse(_))));
        drop(lease);

        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let (supervisor, _db, _dir) = setup();
        assert!(matches!(
            supervisor.start("missing").await.unwrap_err(),
            RegistryError::NotFound(_)
        ));
        assert!(matches!(
            supervisor.stop("missing").await.unwrap_err(),
            RegistryError::NotFound(_)
        ));
    }

    fn slot_count(supervisor: &ProcessSupervisor) -> usize {
        supervisor.slots.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_unknown_ids_get_no_slot() {
        let (supervisor, _db, _dir) = setup();
        for i in 0..100 {
            let id = format!("missing-{}", i);
            assert!(supervisor.stop(&id).await.is_err());
            assert!(supervisor.start(&id).await.is_err());
            assert!(supervisor.lease(&id).await.is_err());
            assert!(supervisor.is_running(&id).await.is_err());
            supervisor.try_reconcile(&id).unwrap();
        }
        assert_eq!(slot_count(&supervisor), 0);
    }

    #[tokio::test]
    async fn test_remove_releases_slot() {
        let (supervisor, db, _dir) = setup();
        register(&db, "sleeper", "sleep", "30");

        supervisor.start("sleeper").await.unwrap();
        assert_eq!(slot_count(&supervisor), 1);

        supervisor.remove("sleeper").await.unwrap();
        assert_eq!(slot_count(&supervisor), 0);
        assert!(db.get_server("sleeper").unwrap().is_none());
        assert!(matches!(
            supervisor.remove("sleeper").await.unwrap_err(),
            RegistryError::NotFound(_)
        ));

        // Same id registered again starts from a fresh slot
        register(&db, "sleeper", "sleep", "30");
        supervisor.start("sleeper").await.unwrap();
        assert!(supervisor.is_running("sleeper").await.unwrap());
        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn test_try_reconcile_skips_busy_slot() {
        let (supervisor, db, _dir) = setup();
        register(&db, "short", "sleep", "0.3");
        supervisor.start("short").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let held = supervisor.lock("short").await.unwrap();
        supervisor.try_reconcile("short").unwrap();
        assert_eq!(
            db.get_server("short").unwrap().unwrap().status,
            ServerStatus::Running
        );
        drop(held);

        supervisor.try_reconcile("short").unwrap();
        assert_eq!(
            db.get_server("short").unwrap().unwrap().status,
            ServerStatus::Error
        );
    }

    #[tokio::test]
    async fn test_try_reconcile_unsupervised_record() {
        let (supervisor, db, _dir) = setup();
        register(&db, "orphan", "sleep", "30");
        db.set_server_status("orphan", ServerStatus::Running, None)
            .unwrap();

        supervisor.try_reconcile("orphan").unwrap();
        let record = db.get_server("orphan").unwrap().unwrap();
        assert_eq!(record.status, ServerStatus::Error);
        assert_eq!(slot_count(&supervisor), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_keeps_status() {
        let (supervisor, db, _dir) = setup();
        register(&db, "sleeper", "sleep", "30");
        supervisor.start("sleeper").await.unwrap();

        supervisor.shutdown_all().await;

        assert_eq!(
            db.get_server("sleeper").unwrap().unwrap().status,
            ServerStatus::Running
        );
        assert_eq!(db.reset_running_servers().unwrap(), vec!["sleeper"]);
    }
}
