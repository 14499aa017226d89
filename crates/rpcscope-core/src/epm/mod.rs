//! Endpoint-mapper query engine.
//!
//! Enumerates the interfaces a host's RPC endpoint mapper has registered,
//! per transport, and inquires interface-ID sets, principal names, and call
//! statistics per element. The OS management API is consumed through the
//! [`RpcMgmt`] trait, one method per management call, so the engine logic
//! is host-independent and the release discipline is testable with a
//! counting fake. Every handle the engine acquires is held by a scoped
//! guard and released on drop; no control path frees by hand.

#[cfg(windows)]
pub mod os;

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::guid::InterfaceId;

// =============================================================================
// Transports
// =============================================================================

/// A transport the endpoint mapper can be asked over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    NamedPipe,
    NetBios,
    Http,
    Local,
}

impl Protocol {
    /// The fixed order the engine probes transports in.
    pub const ALL: [Protocol; 5] = [
        Protocol::Tcp,
        Protocol::NamedPipe,
        Protocol::NetBios,
        Protocol::Http,
        Protocol::Local,
    ];

    /// RPC protocol sequence string.
    pub fn sequence(self) -> &'static str {
        match self {
            Protocol::Tcp => "ncacn_ip_tcp",
            Protocol::NamedPipe => "ncacn_np",
            Protocol::NetBios => "ncacn_nb_tcp",
            Protocol::Http => "ncacn_http",
            Protocol::Local => "ncalrpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sequence())
    }
}

// =============================================================================
// Enumeration Results
// =============================================================================

/// One interface as the endpoint mapper reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub uuid: InterfaceId,
    pub version_major: u16,
    pub version_minor: u16,
    pub annotation: Option<String>,
}

/// Management counter kinds, in the order the statistics vector reports
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Call,
    CallFail,
    CallAsync,
    CallFailAsync,
    Send,
    Receive,
    Packet,
    PacketRetry,
    CallLocal,
    CallFailLocal,
    SendLocal,
    ReceiveLocal,
    PacketLocal,
    PacketRetryLocal,
    Unknown(u32),
}

impl From<u32> for StatKind {
    fn from(index: u32) -> Self {
        match index {
            0 => StatKind::Call,
            1 => StatKind::CallFail,
            2 => StatKind::CallAsync,
            3 => StatKind::CallFailAsync,
            4 => StatKind::Send,
            5 => StatKind::Receive,
            6 => StatKind::Packet,
            7 => StatKind::PacketRetry,
            8 => StatKind::CallLocal,
            9 => StatKind::CallFailLocal,
            10 => StatKind::SendLocal,
            11 => StatKind::ReceiveLocal,
            12 => StatKind::PacketLocal,
            13 => StatKind::PacketRetryLocal,
            other => StatKind::Unknown(other),
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatKind::Call => f.write_str("Call"),
            StatKind::CallFail => f.write_str("Call Fail"),
            StatKind::CallAsync => f.write_str("Call Async"),
            StatKind::CallFailAsync => f.write_str("Call Fail Async"),
            StatKind::Send => f.write_str("Send"),
            StatKind::Receive => f.write_str("Receive"),
            StatKind::Packet => f.write_str("Packet"),
            StatKind::PacketRetry => f.write_str("Packet Retry"),
            StatKind::CallLocal => f.write_str("Call Local"),
            StatKind::CallFailLocal => f.write_str("Call Fail Local"),
            StatKind::SendLocal => f.write_str("Send Local"),
            StatKind::ReceiveLocal => f.write_str("Receive Local"),
            StatKind::PacketLocal => f.write_str("Packet Local"),
            StatKind::PacketRetryLocal => f.write_str("Packet Retry Local"),
            StatKind::Unknown(index) => write!(f, "Unknown({index})"),
        }
    }
}

/// One counter sample from a live binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSample {
    pub kind: StatKind,
    pub value: u32,
}

// =============================================================================
// OS Seam
// =============================================================================

/// The endpoint-mapper management surface, one method per consumed call.
///
/// Handle types are opaque to the engine; implementations own their real
/// representation (OS handles on Windows, counting tokens in tests). The
/// engine pairs every acquisition with exactly one matching free via
/// scoped guards.
pub trait RpcMgmt {
    type StringBinding;
    type Binding;
    type Inquiry;
    type IfIdVector;
    type StatsVector;

    /// Compose a transport-qualified string binding for `server`.
    fn compose_string_binding(
        &self,
        protocol: Protocol,
        server: &str,
    ) -> Result<Self::StringBinding>;

    /// Convert a composed string into a live binding handle.
    fn binding_from_string(&self, binding: &Self::StringBinding) -> Result<Self::Binding>;

    /// Open an enumeration cursor over all registered elements.
    fn begin_inquiry(&self, binding: &Self::Binding) -> Result<Self::Inquiry>;

    /// One enumeration step. `Ok(None)` is the mapper's end-of-elements
    /// signal; any error status also ends the iteration at the engine.
    fn next_element(
        &self,
        inquiry: &mut Self::Inquiry,
    ) -> Result<Option<(InterfaceDescriptor, Self::Binding, InterfaceId)>>;

    /// Re-parse an element binding against the real server address so the
    /// interface-ID inquiry does not go to a loopback-style local address.
    /// Refuses local-only bindings.
    fn rebind_to_server(&self, binding: &Self::Binding, server: &str) -> Result<Self::Binding>;

    fn inquire_interface_ids(&self, binding: &Self::Binding) -> Result<Self::IfIdVector>;
    fn interface_ids(&self, vector: &Self::IfIdVector) -> Vec<InterfaceDescriptor>;

    /// Authenticated principal name of the server behind `binding`.
    fn inquire_principal_name(&self, binding: &Self::Binding) -> Result<String>;

    fn inquire_stats(&self, binding: &Self::Binding) -> Result<Self::StatsVector>;
    fn stats(&self, vector: &Self::StatsVector) -> Vec<StatsSample>;

    fn free_string_binding(&self, binding: Self::StringBinding);
    fn free_binding(&self, binding: Self::Binding);
    fn close_inquiry(&self, inquiry: Self::Inquiry);
    fn free_if_id_vector(&self, vector: Self::IfIdVector);
    fn free_stats_vector(&self, vector: Self::StatsVector);
}

// =============================================================================
// Scoped Guards
// =============================================================================

struct StringGuard<'a, A: RpcMgmt> {
    api: &'a A,
    value: Option<A::StringBinding>,
}

impl<'a, A: RpcMgmt> StringGuard<'a, A> {
    fn new(api: &'a A, value: A::StringBinding) -> Self {
        Self {
            api,
            value: Some(value),
        }
    }

    fn get(&self) -> &A::StringBinding {
        self.value.as_ref().unwrap()
    }
}

impl<A: RpcMgmt> Drop for StringGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.api.free_string_binding(value);
        }
    }
}

struct BindingGuard<'a, A: RpcMgmt> {
    api: &'a A,
    value: Option<A::Binding>,
}

impl<'a, A: RpcMgmt> BindingGuard<'a, A> {
    fn new(api: &'a A, value: A::Binding) -> Self {
        Self {
            api,
            value: Some(value),
        }
    }

    fn get(&self) -> &A::Binding {
        self.value.as_ref().unwrap()
    }
}

impl<A: RpcMgmt> Drop for BindingGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.api.free_binding(value);
        }
    }
}

struct InquiryGuard<'a, A: RpcMgmt> {
    api: &'a A,
    value: Option<A::Inquiry>,
}

impl<'a, A: RpcMgmt> InquiryGuard<'a, A> {
    fn new(api: &'a A, value: A::Inquiry) -> Self {
        Self {
            api,
            value: Some(value),
        }
    }

    fn get_mut(&mut self) -> &mut A::Inquiry {
        self.value.as_mut().unwrap()
    }
}

impl<A: RpcMgmt> Drop for InquiryGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.api.close_inquiry(value);
        }
    }
}

struct IfVectorGuard<'a, A: RpcMgmt> {
    api: &'a A,
    value: Option<A::IfIdVector>,
}

impl<'a, A: RpcMgmt> IfVectorGuard<'a, A> {
    fn new(api: &'a A, value: A::IfIdVector) -> Self {
        Self {
            api,
            value: Some(value),
        }
    }

    fn get(&self) -> &A::IfIdVector {
        self.value.as_ref().unwrap()
    }
}

impl<A: RpcMgmt> Drop for IfVectorGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.api.free_if_id_vector(value);
        }
    }
}

struct StatsVectorGuard<'a, A: RpcMgmt> {
    api: &'a A,
    value: Option<A::StatsVector>,
}

impl<'a, A: RpcMgmt> StatsVectorGuard<'a, A> {
    fn new(api: &'a A, value: A::StatsVector) -> Self {
        Self {
            api,
            value: Some(value),
        }
    }

    fn get(&self) -> &A::StatsVector {
        self.value.as_ref().unwrap()
    }
}

impl<A: RpcMgmt> Drop for StatsVectorGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.api.free_stats_vector(value);
        }
    }
}

// =============================================================================
// Query Engine
// =============================================================================

/// Sequential endpoint-mapper enumeration over one management surface.
pub struct QueryEngine<'a, A: RpcMgmt> {
    api: &'a A,
    verbosity: u8,
}

impl<'a, A: RpcMgmt> QueryEngine<'a, A> {
    pub fn new(api: &'a A, verbosity: u8) -> Self {
        Self { api, verbosity }
    }

    /// Enumerate everything the target's endpoint mapper has registered
    /// over one transport. Per-step failures abandon only that step;
    /// returns the number of elements seen, and zero is a valid outcome.
    pub fn query_protocol(&self, server: &str, protocol: Protocol) -> usize {
        let string = match self.api.compose_string_binding(protocol, server) {
            Ok(string) => StringGuard::new(self.api, string),
            Err(err) => {
                warn!(%protocol, %err, "failed to compose string binding");
                return 0;
            }
        };
        let binding = match self.api.binding_from_string(string.get()) {
            Ok(binding) => BindingGuard::new(self.api, binding),
            Err(err) => {
                warn!(%protocol, %err, "failed to convert to binding handle");
                return 0;
            }
        };
        let mut inquiry = match self.api.begin_inquiry(binding.get()) {
            Ok(inquiry) => InquiryGuard::new(self.api, inquiry),
            Err(err) => {
                warn!(%protocol, %err, "failed to begin endpoint inquiry");
                return 0;
            }
        };

        let mut found = 0;
        loop {
            let (descriptor, element, object) = match self.api.next_element(inquiry.get_mut()) {
                Ok(Some(step)) => step,
                Ok(None) => break,
                Err(err) => {
                    // Any status besides "no more elements" also ends the
                    // iteration; it is not fatal to the scan.
                    debug!(%protocol, %err, "enumeration ended");
                    break;
                }
            };
            let element = BindingGuard::new(self.api, element);
            found += 1;

            info!(
                uuid = %descriptor.uuid,
                version_major = descriptor.version_major,
                version_minor = descriptor.version_minor,
                object = %object,
                annotation = descriptor.annotation.as_deref().unwrap_or(""),
                "registered interface"
            );

            if self.verbosity >= 1 {
                self.inquire_interfaces(&element, server);
            }
            if self.verbosity >= 2 {
                match self.api.inquire_principal_name(element.get()) {
                    Ok(name) => info!(principal = %name, "server principal"),
                    Err(err) => warn!(%err, "failed to inquire server principal name"),
                }
            }
            match self.api.inquire_stats(element.get()) {
                Ok(vector) => {
                    let vector = StatsVectorGuard::new(self.api, vector);
                    for sample in self.api.stats(vector.get()) {
                        info!(kind = %sample.kind, value = sample.value, "endpoint stats");
                    }
                }
                Err(err) => warn!(%err, "failed to inquire stats"),
            }
        }

        found
    }

    /// Probe every transport in the fixed order and sum the elements seen.
    pub fn query_all(&self, server: &str) -> usize {
        let mut total = 0;
        for protocol in Protocol::ALL {
            let found = self.query_protocol(server, protocol);
            if found > 0 {
                info!(%protocol, found, "endpoints found");
            }
            total += found;
        }
        total
    }

    fn inquire_interfaces(&self, element: &BindingGuard<'_, A>, server: &str) {
        let rebound = match self.api.rebind_to_server(element.get(), server) {
            Ok(binding) => BindingGuard::new(self.api, binding),
            Err(err) => {
                warn!(%err, "failed to parse binding handle");
                return;
            }
        };
        match self.api.inquire_interface_ids(rebound.get()) {
            Ok(vector) => {
                let vector = IfVectorGuard::new(self.api, vector);
                for descriptor in self.api.interface_ids(vector.get()) {
                    info!(
                        uuid = %descriptor.uuid,
                        version_major = descriptor.version_major,
                        version_minor = descriptor.version_minor,
                        "visible interface"
                    );
                }
            }
            Err(err) => debug!(%err, "failed to inquire interface ids"),
        }
    }
}

#[cfg(test)]
mod tests;
