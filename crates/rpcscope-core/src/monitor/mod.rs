//! Live RPC call monitoring.
//!
//! A real-time trace session delivers client-call records through a
//! channel; a labeling thread resolves each record against the service
//! registry and appends the labeled event to a shared log. The OS tracing
//! facility sits behind the [`TraceBackend`] trait so the state machine and
//! the labeling path run (and test) anywhere.
//!
//! Lifecycle is `Idle -> Started -> Idle` via [`CallMonitor::start`] /
//! [`CallMonitor::stop`]; both transitions are guarded, double-start is an
//! error, not a no-op. The trace pump thread is fire-and-forget: `stop()`
//! tears the session down and the pump exits on its own when it observes
//! end-of-trace, dropping its channel sender; the labeler drains and exits
//! on disconnect.

#[cfg(windows)]
pub mod etw;

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use tracing::debug;

use crate::error::{Error, Result};
use crate::guid::InterfaceId;
use crate::registry::ServiceRegistry;

/// Raw fields pulled from one client-call trace record, before labeling.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub process_id: u32,
    pub thread_id: u32,
    pub timestamp_ticks: u64,
    pub interface_uuid: InterfaceId,
    pub opnum: u32,
    pub endpoint: String,
    pub protocol: String,
}

/// One labeled entry in the shared event log. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEvent {
    pub process_id: u32,
    pub thread_id: u32,
    pub timestamp_ticks: u64,
    pub interface_uuid: String,
    pub opnum: u32,
    pub endpoint: String,
    pub protocol: String,
    pub file_name: Option<String>,
    pub service_display_name: Option<String>,
    pub service_name: Option<String>,
    pub procedure_name: Option<String>,
}

// =============================================================================
// Event Log
// =============================================================================

/// Shared append-only event log. The lock is held only for the single
/// push or clone, never across an OS call.
#[derive(Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<Vec<RpcEvent>>>,
}

impl EventLog {
    pub fn append(&self, event: RpcEvent) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Snapshot copy of the log. Readers never see a half-written record
    /// and never block the producer longer than the copy.
    pub fn snapshot(&self) -> Vec<RpcEvent> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// OS Seam
// =============================================================================

/// Control handle for a running trace session.
pub trait TraceControl {
    /// Issue the session-stop control call. The pump thread observes
    /// end-of-trace and exits on its own; this does not wait for it.
    fn stop(&mut self) -> Result<()>;
}

/// The system tracing facility: starts a real-time session that delivers
/// filtered client-call records into `sender` until stopped.
pub trait TraceBackend {
    type Session: TraceControl + Send;

    fn start_session(&self, sender: Sender<CallRecord>) -> Result<Self::Session>;
}

// =============================================================================
// Monitor
// =============================================================================

enum State<S> {
    Idle,
    Started(S),
}

/// Live call monitor owning one trace session at a time.
pub struct CallMonitor<B: TraceBackend> {
    backend: B,
    registry: Arc<ServiceRegistry>,
    log: EventLog,
    state: State<B::Session>,
}

impl<B: TraceBackend> CallMonitor<B> {
    pub fn new(backend: B, registry: ServiceRegistry) -> Self {
        Self {
            backend,
            registry: Arc::new(registry),
            log: EventLog::default(),
            state: State::Idle,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, State::Started(_))
    }

    /// Handle to the shared log; stays valid across stop/restart.
    pub fn log(&self) -> EventLog {
        self.log.clone()
    }

    /// Start the trace session and the labeling thread. Starting an
    /// already-started monitor is rejected; a backend failure leaves the
    /// monitor `Idle`.
    pub fn start(&mut self) -> Result<()> {
        if self.is_started() {
            return Err(Error::MonitorAlreadyStarted);
        }

        let (sender, receiver) = mpsc::channel();
        let mut session = self.backend.start_session(sender)?;

        let registry = Arc::clone(&self.registry);
        let log = self.log.clone();
        let spawned = thread::Builder::new()
            .name("rpc-labeler".into())
            .spawn(move || label_loop(receiver, registry, log));
        if let Err(err) = spawned {
            let _ = session.stop();
            return Err(Error::Io(err));
        }

        self.state = State::Started(session);
        Ok(())
    }

    /// Tear down the session. A failed control call is reported, but the
    /// monitor still returns to `Idle`.
    pub fn stop(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => Err(Error::MonitorNotStarted),
            State::Started(mut session) => session.stop(),
        }
    }

    /// Snapshot of everything captured so far.
    pub fn get_events(&self) -> Vec<RpcEvent> {
        self.log.snapshot()
    }
}

fn label_loop(receiver: Receiver<CallRecord>, registry: Arc<ServiceRegistry>, log: EventLog) {
    while let Ok(record) = receiver.recv() {
        log.append(label_record(&registry, record));
    }
    debug!("call channel disconnected, labeler exiting");
}

/// Resolve a raw call record against the registry.
pub fn label_record(registry: &ServiceRegistry, record: CallRecord) -> RpcEvent {
    let uuid = record.interface_uuid.to_string();
    let info = registry.get_rpc_info(&uuid, i64::from(record.opnum));

    let (file_name, service_display_name, service_name, procedure_name) = match info {
        Some(info) => (
            Some(info.file_name),
            info.service_display_name,
            info.service_name,
            info.procedure_name,
        ),
        None => (None, None, None, None),
    };

    RpcEvent {
        process_id: record.process_id,
        thread_id: record.thread_id,
        timestamp_ticks: record.timestamp_ticks,
        interface_uuid: uuid,
        opnum: record.opnum,
        endpoint: record.endpoint,
        protocol: record.protocol,
        file_name,
        service_display_name,
        service_name,
        procedure_name,
    }
}
