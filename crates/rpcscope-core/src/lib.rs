//! RPC endpoint discovery, identity resolution, and live call monitoring.
//!
//! Three subsystems, wired together by the CLI:
//! - the discovery engine ([`pe`], [`scan`]) finds which binaries on disk
//!   carry which RPC interface identifiers;
//! - the query engine ([`epm`]) asks a host's endpoint mapper what is
//!   actually registered, per transport;
//! - the live monitor ([`monitor`]) captures client-call activity and
//!   labels it through the [`registry`].
//!
//! Everything algorithmic is host-independent; the modules that consume
//! Win32 surfaces (`epm::os`, `monitor::etw`, the SCM half of
//! [`services`]) are compiled on Windows only and implement the same
//! traits the tests fake.

pub mod crawler;
pub mod epm;
pub mod error;
pub mod guid;
pub mod monitor;
pub mod pe;
pub mod registry;
pub mod scan;
pub mod services;

pub use error::{Error, Result};
pub use guid::InterfaceId;
pub use monitor::{CallMonitor, EventLog, RpcEvent};
pub use registry::{RpcInfo, ServiceRegistry};
pub use scan::{EndpointMap, EndpointScanner, ScanOptions, ScanStatus};
