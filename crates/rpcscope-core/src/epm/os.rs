//! Windows implementation of the endpoint-mapper management surface.
//!
//! One trait method per `Win32::System::Rpc` management call. Strings the
//! runtime hands back are converted (and freed) here; handles cross the
//! trait boundary raw and are freed through the matching trait method, so
//! the engine's guards own the release discipline.

use std::ffi::c_void;
use std::ptr;

use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::System::Rpc::{
    RpcBindingFree, RpcBindingFromStringBindingW, RpcBindingToStringBindingW, RpcIfIdVectorFree,
    RpcMgmtEpEltInqBegin, RpcMgmtEpEltInqDone, RpcMgmtEpEltInqNextW, RpcMgmtInqIfIds,
    RpcMgmtInqServerPrincNameW, RpcMgmtInqStats, RpcMgmtStatsVectorFree, RpcStringBindingComposeW,
    RpcStringBindingParseW, RpcStringFreeW, RPC_C_EP_ALL_ELTS, RPC_IF_ID, RPC_IF_ID_VECTOR,
    RPC_S_OK, RPC_STATS_VECTOR, RPC_STATUS,
};

use crate::epm::{InterfaceDescriptor, Protocol, RpcMgmt, StatKind, StatsSample};
use crate::error::{Error, Result};
use crate::guid::InterfaceId;

/// NTLM authentication service, for the principal-name inquiry.
const RPC_C_AUTHN_WINNT: u32 = 10;

fn check(operation: &'static str, status: RPC_STATUS) -> Result<()> {
    if status == RPC_S_OK {
        Ok(())
    } else {
        Err(Error::Rpc {
            operation,
            status: status.0 as u32,
        })
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

fn from_guid(guid: &GUID) -> InterfaceId {
    InterfaceId {
        data1: guid.data1,
        data2: guid.data2,
        data3: guid.data3,
        data4: guid.data4,
    }
}

/// Owned copy of a runtime string; frees the runtime's buffer immediately.
fn take_rpc_string(mut raw: PWSTR) -> String {
    if raw.is_null() {
        return String::new();
    }
    let text = unsafe { raw.to_string() }.unwrap_or_default();
    unsafe {
        let _ = RpcStringFreeW(&mut raw);
    }
    text
}

/// Scoped runtime string for the multi-step rebind sequence.
struct RpcStr(PWSTR);

impl RpcStr {
    fn as_text(&self) -> String {
        if self.0.is_null() {
            String::new()
        } else {
            unsafe { self.0.to_string() }.unwrap_or_default()
        }
    }
}

impl Drop for RpcStr {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                let _ = RpcStringFreeW(&mut self.0);
            }
        }
    }
}

/// The live RPC runtime on this host.
pub struct WindowsRpc;

impl RpcMgmt for WindowsRpc {
    type StringBinding = PWSTR;
    type Binding = *mut c_void;
    type Inquiry = *mut c_void;
    type IfIdVector = *mut RPC_IF_ID_VECTOR;
    type StatsVector = *mut RPC_STATS_VECTOR;

    fn compose_string_binding(&self, protocol: Protocol, server: &str) -> Result<PWSTR> {
        let protseq = to_wide(protocol.sequence());
        let server = to_wide(server);
        let mut composed = PWSTR::null();
        let status = unsafe {
            RpcStringBindingComposeW(
                PCWSTR::null(),
                PCWSTR(protseq.as_ptr()),
                PCWSTR(server.as_ptr()),
                PCWSTR::null(),
                PCWSTR::null(),
                Some(&mut composed),
            )
        };
        check("RpcStringBindingCompose", status)?;
        Ok(composed)
    }

    fn binding_from_string(&self, binding: &PWSTR) -> Result<*mut c_void> {
        let mut handle: *mut c_void = ptr::null_mut();
        let status = unsafe { RpcBindingFromStringBindingW(PCWSTR(binding.0), &mut handle) };
        check("RpcBindingFromStringBinding", status)?;
        Ok(handle)
    }

    fn begin_inquiry(&self, binding: &*mut c_void) -> Result<*mut c_void> {
        let mut inquiry: *mut c_void = ptr::null_mut();
        let status = unsafe {
            RpcMgmtEpEltInqBegin(*binding, RPC_C_EP_ALL_ELTS, None, 0, None, &mut inquiry)
        };
        check("RpcMgmtEpEltInqBegin", status)?;
        Ok(inquiry)
    }

    fn next_element(
        &self,
        inquiry: &mut *mut c_void,
    ) -> Result<Option<(InterfaceDescriptor, *mut c_void, InterfaceId)>> {
        let mut if_id = RPC_IF_ID::default();
        let mut binding: *mut c_void = ptr::null_mut();
        let mut object = GUID::zeroed();
        let mut annotation = PWSTR::null();
        let status = unsafe {
            RpcMgmtEpEltInqNextW(
                *inquiry,
                &mut if_id,
                Some(&mut binding),
                Some(&mut object),
                Some(&mut annotation),
            )
        };
        if status != RPC_S_OK {
            // The runtime's no-more-elements status and every other
            // terminal status both end the enumeration at the engine.
            return Ok(None);
        }

        let annotation = take_rpc_string(annotation);
        let descriptor = InterfaceDescriptor {
            uuid: from_guid(&if_id.Uuid),
            version_major: if_id.VersMajor,
            version_minor: if_id.VersMinor,
            annotation: if annotation.is_empty() {
                None
            } else {
                Some(annotation)
            },
        };
        Ok(Some((descriptor, binding, from_guid(&object))))
    }

    fn rebind_to_server(&self, binding: &*mut c_void, server: &str) -> Result<*mut c_void> {
        let mut raw = PWSTR::null();
        let status = unsafe { RpcBindingToStringBindingW(*binding, &mut raw) };
        check("RpcBindingToStringBinding", status)?;
        let full = RpcStr(raw);

        // Local-only bindings have no address worth substituting.
        if full.as_text().contains("ncalrpc") {
            return Err(Error::Rpc {
                operation: "RpcBindingToStringBinding",
                status: 0,
            });
        }

        let mut object = PWSTR::null();
        let mut protseq = PWSTR::null();
        let mut address = PWSTR::null();
        let mut endpoint = PWSTR::null();
        let mut options = PWSTR::null();
        let status = unsafe {
            RpcStringBindingParseW(
                PCWSTR(full.0.0),
                Some(&mut object),
                Some(&mut protseq),
                Some(&mut address),
                Some(&mut endpoint),
                Some(&mut options),
            )
        };
        check("RpcStringBindingParse", status)?;
        let object = RpcStr(object);
        let protseq = RpcStr(protseq);
        let address = RpcStr(address);
        let endpoint = RpcStr(endpoint);
        let options = RpcStr(options);

        // NetBIOS bindings keep their own address; everything else gets
        // the real server in place of the element's loopback address.
        let target = if protseq.as_text() == "ncacn_nb_tcp" {
            address.as_text()
        } else {
            server.to_string()
        };
        let target = to_wide(&target);

        let mut composed = PWSTR::null();
        let status = unsafe {
            RpcStringBindingComposeW(
                PCWSTR(object.0.0),
                PCWSTR(protseq.0.0),
                PCWSTR(target.as_ptr()),
                PCWSTR(endpoint.0.0),
                PCWSTR(options.0.0),
                Some(&mut composed),
            )
        };
        check("RpcStringBindingCompose", status)?;
        let composed = RpcStr(composed);

        let mut handle: *mut c_void = ptr::null_mut();
        let status = unsafe { RpcBindingFromStringBindingW(PCWSTR(composed.0.0), &mut handle) };
        check("RpcBindingFromStringBinding", status)?;
        Ok(handle)
    }

    fn inquire_interface_ids(&self, binding: &*mut c_void) -> Result<*mut RPC_IF_ID_VECTOR> {
        let mut vector: *mut RPC_IF_ID_VECTOR = ptr::null_mut();
        let status = unsafe { RpcMgmtInqIfIds(*binding, &mut vector) };
        check("RpcMgmtInqIfIds", status)?;
        Ok(vector)
    }

    fn interface_ids(&self, vector: &*mut RPC_IF_ID_VECTOR) -> Vec<InterfaceDescriptor> {
        let Some(vector) = (unsafe { vector.as_ref() }) else {
            return Vec::new();
        };
        let entries =
            unsafe { std::slice::from_raw_parts(vector.IfId.as_ptr(), vector.Count as usize) };
        entries
            .iter()
            .filter_map(|entry| unsafe { entry.as_ref() })
            .map(|if_id| InterfaceDescriptor {
                uuid: from_guid(&if_id.Uuid),
                version_major: if_id.VersMajor,
                version_minor: if_id.VersMinor,
                annotation: None,
            })
            .collect()
    }

    fn inquire_principal_name(&self, binding: &*mut c_void) -> Result<String> {
        let mut name = PWSTR::null();
        let status =
            unsafe { RpcMgmtInqServerPrincNameW(*binding, RPC_C_AUTHN_WINNT, &mut name) };
        check("RpcMgmtInqServerPrincName", status)?;
        Ok(take_rpc_string(name))
    }

    fn inquire_stats(&self, binding: &*mut c_void) -> Result<*mut RPC_STATS_VECTOR> {
        let mut vector: *mut RPC_STATS_VECTOR = ptr::null_mut();
        let status = unsafe { RpcMgmtInqStats(*binding, &mut vector) };
        check("RpcMgmtInqStats", status)?;
        Ok(vector)
    }

    fn stats(&self, vector: &*mut RPC_STATS_VECTOR) -> Vec<StatsSample> {
        let Some(vector) = (unsafe { vector.as_ref() }) else {
            return Vec::new();
        };
        let values =
            unsafe { std::slice::from_raw_parts(vector.Stats.as_ptr(), vector.Count as usize) };
        values
            .iter()
            .enumerate()
            .map(|(index, value)| StatsSample {
                kind: StatKind::from(index as u32),
                value: *value,
            })
            .collect()
    }

    fn free_string_binding(&self, mut binding: PWSTR) {
        unsafe {
            let _ = RpcStringFreeW(&mut binding);
        }
    }

    fn free_binding(&self, mut binding: *mut c_void) {
        unsafe {
            let _ = RpcBindingFree(&mut binding);
        }
    }

    fn close_inquiry(&self, mut inquiry: *mut c_void) {
        unsafe {
            let _ = RpcMgmtEpEltInqDone(&mut inquiry);
        }
    }

    fn free_if_id_vector(&self, mut vector: *mut RPC_IF_ID_VECTOR) {
        unsafe {
            let _ = RpcIfIdVectorFree(&mut vector);
        }
    }

    fn free_stats_vector(&self, mut vector: *mut RPC_STATS_VECTOR) {
        unsafe {
            let _ = RpcMgmtStatsVectorFree(&mut vector);
        }
    }
}
