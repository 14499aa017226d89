//! Engine tests over a counting fake of the management surface.
//!
//! The fake hands out unique tokens for every acquired handle and records
//! every free, so each test can assert exact acquire/release balance under
//! injected failure at any step.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;

use super::*;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum HandleKind {
    String,
    Binding,
    Inquiry,
    IfVector,
    StatsVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailPoint {
    Compose,
    Bind,
    Begin,
    Rebind,
    IfIds,
    Principal,
    Stats,
}

#[derive(Default)]
struct Ledger {
    live: HashSet<(HandleKind, u32)>,
    acquired: Vec<HandleKind>,
    double_free: bool,
    probed: Vec<Protocol>,
}

struct FakeRpc {
    elements: usize,
    fail: Option<FailPoint>,
    next_token: Cell<u32>,
    ledger: RefCell<Ledger>,
}

struct FakeInquiry {
    token: u32,
    index: usize,
}

impl FakeRpc {
    fn new(elements: usize) -> Self {
        Self {
            elements,
            fail: None,
            next_token: Cell::new(0),
            ledger: RefCell::new(Ledger::default()),
        }
    }

    fn failing(elements: usize, fail: FailPoint) -> Self {
        Self {
            fail: Some(fail),
            ..Self::new(elements)
        }
    }

    fn acquire(&self, kind: HandleKind) -> u32 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        let mut ledger = self.ledger.borrow_mut();
        ledger.live.insert((kind, token));
        ledger.acquired.push(kind);
        token
    }

    fn release(&self, kind: HandleKind, token: u32) {
        let mut ledger = self.ledger.borrow_mut();
        if !ledger.live.remove(&(kind, token)) {
            ledger.double_free = true;
        }
    }

    fn fails_at(&self, point: FailPoint, operation: &'static str) -> Result<()> {
        if self.fail == Some(point) {
            Err(Error::Rpc {
                operation,
                status: 1,
            })
        } else {
            Ok(())
        }
    }

    fn acquired_count(&self, kind: HandleKind) -> usize {
        self.ledger
            .borrow()
            .acquired
            .iter()
            .filter(|k| **k == kind)
            .count()
    }

    fn assert_balanced(&self) {
        let ledger = self.ledger.borrow();
        assert!(!ledger.double_free, "a handle was freed twice");
        assert!(
            ledger.live.is_empty(),
            "leaked handles: {:?}",
            ledger.live
        );
    }
}

fn element_id(index: usize) -> InterfaceId {
    InterfaceId {
        data1: index as u32 + 1,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    }
}

impl RpcMgmt for FakeRpc {
    type StringBinding = u32;
    type Binding = u32;
    type Inquiry = FakeInquiry;
    type IfIdVector = u32;
    type StatsVector = u32;

    fn compose_string_binding(&self, protocol: Protocol, _server: &str) -> Result<u32> {
        self.ledger.borrow_mut().probed.push(protocol);
        self.fails_at(FailPoint::Compose, "compose")?;
        Ok(self.acquire(HandleKind::String))
    }

    fn binding_from_string(&self, _binding: &u32) -> Result<u32> {
        self.fails_at(FailPoint::Bind, "bind")?;
        Ok(self.acquire(HandleKind::Binding))
    }

    fn begin_inquiry(&self, _binding: &u32) -> Result<FakeInquiry> {
        self.fails_at(FailPoint::Begin, "begin inquiry")?;
        Ok(FakeInquiry {
            token: self.acquire(HandleKind::Inquiry),
            index: 0,
        })
    }

    fn next_element(
        &self,
        inquiry: &mut FakeInquiry,
    ) -> Result<Option<(InterfaceDescriptor, u32, InterfaceId)>> {
        if inquiry.index >= self.elements {
            return Ok(None);
        }
        let index = inquiry.index;
        inquiry.index += 1;
        let descriptor = InterfaceDescriptor {
            uuid: element_id(index),
            version_major: 1,
            version_minor: 0,
            annotation: Some(format!("element {index}")),
        };
        Ok(Some((
            descriptor,
            self.acquire(HandleKind::Binding),
            element_id(index),
        )))
    }

    fn rebind_to_server(&self, _binding: &u32, _server: &str) -> Result<u32> {
        self.fails_at(FailPoint::Rebind, "rebind")?;
        Ok(self.acquire(HandleKind::Binding))
    }

    fn inquire_interface_ids(&self, _binding: &u32) -> Result<u32> {
        self.fails_at(FailPoint::IfIds, "interface ids")?;
        Ok(self.acquire(HandleKind::IfVector))
    }

    fn interface_ids(&self, _vector: &u32) -> Vec<InterfaceDescriptor> {
        vec![InterfaceDescriptor {
            uuid: element_id(99),
            version_major: 2,
            version_minor: 1,
            annotation: None,
        }]
    }

    fn inquire_principal_name(&self, _binding: &u32) -> Result<String> {
        self.fails_at(FailPoint::Principal, "principal name")?;
        Ok("host/server".to_string())
    }

    fn inquire_stats(&self, _binding: &u32) -> Result<u32> {
        self.fails_at(FailPoint::Stats, "stats")?;
        Ok(self.acquire(HandleKind::StatsVector))
    }

    fn stats(&self, _vector: &u32) -> Vec<StatsSample> {
        vec![
            StatsSample {
                kind: StatKind::Call,
                value: 12,
            },
            StatsSample {
                kind: StatKind::Packet,
                value: 34,
            },
        ]
    }

    fn free_string_binding(&self, binding: u32) {
        self.release(HandleKind::String, binding);
    }

    fn free_binding(&self, binding: u32) {
        self.release(HandleKind::Binding, binding);
    }

    fn close_inquiry(&self, inquiry: FakeInquiry) {
        self.release(HandleKind::Inquiry, inquiry.token);
    }

    fn free_if_id_vector(&self, vector: u32) {
        self.release(HandleKind::IfVector, vector);
    }

    fn free_stats_vector(&self, vector: u32) {
        self.release(HandleKind::StatsVector, vector);
    }
}

#[test]
fn three_elements_enumerated_with_balanced_releases() {
    let api = FakeRpc::new(3);
    let count = QueryEngine::new(&api, 0).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 3);
    // One composed binding plus one per element, every one released.
    assert_eq!(api.acquired_count(HandleKind::Binding), 4);
    api.assert_balanced();
}

#[test]
fn zero_elements_is_a_valid_outcome() {
    let api = FakeRpc::new(0);
    let count = QueryEngine::new(&api, 2).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 0);
    api.assert_balanced();
}

#[test]
fn verbose_enumeration_acquires_and_releases_vectors() {
    let api = FakeRpc::new(2);
    let count = QueryEngine::new(&api, 2).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 2);
    // Main binding, two element bindings, two rebinds.
    assert_eq!(api.acquired_count(HandleKind::Binding), 5);
    assert_eq!(api.acquired_count(HandleKind::IfVector), 2);
    assert_eq!(api.acquired_count(HandleKind::StatsVector), 2);
    api.assert_balanced();
}

#[test]
fn compose_failure_aborts_attempt_without_acquisitions() {
    let api = FakeRpc::failing(3, FailPoint::Compose);
    let count = QueryEngine::new(&api, 2).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 0);
    assert_eq!(api.acquired_count(HandleKind::Binding), 0);
    api.assert_balanced();
}

#[test]
fn bind_failure_releases_composed_string() {
    let api = FakeRpc::failing(3, FailPoint::Bind);
    let count = QueryEngine::new(&api, 2).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 0);
    assert_eq!(api.acquired_count(HandleKind::String), 1);
    api.assert_balanced();
}

#[test]
fn begin_failure_releases_string_and_binding() {
    let api = FakeRpc::failing(3, FailPoint::Begin);
    let count = QueryEngine::new(&api, 2).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 0);
    assert_eq!(api.acquired_count(HandleKind::String), 1);
    assert_eq!(api.acquired_count(HandleKind::Binding), 1);
    api.assert_balanced();
}

#[test]
fn rebind_failure_keeps_enumerating() {
    let api = FakeRpc::failing(3, FailPoint::Rebind);
    let count = QueryEngine::new(&api, 1).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 3);
    assert_eq!(api.acquired_count(HandleKind::IfVector), 0);
    api.assert_balanced();
}

#[test]
fn interface_id_failure_releases_rebound_binding() {
    let api = FakeRpc::failing(2, FailPoint::IfIds);
    let count = QueryEngine::new(&api, 1).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 2);
    // Main + two elements + two rebinds, all released.
    assert_eq!(api.acquired_count(HandleKind::Binding), 5);
    api.assert_balanced();
}

#[test]
fn principal_failure_does_not_stop_stats() {
    let api = FakeRpc::failing(2, FailPoint::Principal);
    let count = QueryEngine::new(&api, 2).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 2);
    assert_eq!(api.acquired_count(HandleKind::StatsVector), 2);
    api.assert_balanced();
}

#[test]
fn stats_failure_is_per_element() {
    let api = FakeRpc::failing(2, FailPoint::Stats);
    let count = QueryEngine::new(&api, 0).query_protocol("server", Protocol::Tcp);

    assert_eq!(count, 2);
    assert_eq!(api.acquired_count(HandleKind::StatsVector), 0);
    api.assert_balanced();
}

#[test]
fn query_all_probes_transports_in_fixed_order() {
    let api = FakeRpc::new(1);
    let total = QueryEngine::new(&api, 0).query_all("server");

    assert_eq!(total, Protocol::ALL.len());
    assert_eq!(api.ledger.borrow().probed, Protocol::ALL.to_vec());
    api.assert_balanced();
}

#[test]
fn protocol_sequences_match_the_transport_set() {
    let sequences: Vec<&str> = Protocol::ALL.iter().map(|p| p.sequence()).collect();
    assert_eq!(
        sequences,
        ["ncacn_ip_tcp", "ncacn_np", "ncacn_nb_tcp", "ncacn_http", "ncalrpc"]
    );
}

#[test]
fn stat_kinds_follow_vector_order() {
    assert_eq!(StatKind::from(0), StatKind::Call);
    assert_eq!(StatKind::from(13), StatKind::PacketRetryLocal);
    assert_eq!(StatKind::from(99), StatKind::Unknown(99));
}
