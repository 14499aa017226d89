//! ETW backend for the live call monitor.
//!
//! Starts a real-time session against the system logger with network
//! capture enabled, consumes it in per-event-record mode, and forwards
//! decoded client-call records into the monitor's channel. The callback
//! does no registry work; it must return quickly, so decoding is the only
//! thing that happens on the pump thread.

use std::ffi::c_void;
use std::mem::size_of;
use std::sync::mpsc::Sender;
use std::thread;

use tracing::{debug, warn};
use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::Foundation::ERROR_SUCCESS;
use windows::Win32::System::Diagnostics::Etw::{
    CloseTrace, ControlTraceW, OpenTraceW, ProcessTrace, StartTraceW, CONTROLTRACE_HANDLE,
    EVENT_RECORD, EVENT_TRACE_CONTROL_STOP, EVENT_TRACE_FLAG_NETWORK_TCPIP,
    EVENT_TRACE_LOGFILEW, EVENT_TRACE_PROPERTIES, EVENT_TRACE_REAL_TIME_MODE,
    PROCESS_TRACE_MODE_EVENT_RECORD, PROCESS_TRACE_MODE_REAL_TIME, WNODE_FLAG_TRACED_GUID,
};

use crate::error::{Error, Result};
use crate::guid::InterfaceId;
use crate::monitor::{CallRecord, TraceBackend, TraceControl};

/// Control GUID of the system trace session.
const SYSTEM_TRACE_CONTROL_GUID: GUID = GUID::from_u128(0x9e814c01_5b65_11d0_8f20_00aa003e0000);

/// The session name the system logger mandates.
const SYSTEM_LOGGER_NAME: &str = "NT Kernel Logger";

/// Event id of an RPC client call in the consumed provider.
const RPC_CLIENT_CALL_EVENT_ID: u16 = 5;

/// Fixed-size prefix of the client-call payload: interface UUID, procedure
/// ordinal, protocol-sequence code.
const CLIENT_CALL_PREFIX_LEN: usize = InterfaceId::SIZE + 4 + 4;

struct PumpContext {
    sender: Sender<CallRecord>,
}

/// Raw pointer moved into the pump thread.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

fn logger_name_wide() -> Vec<u16> {
    SYSTEM_LOGGER_NAME.encode_utf16().chain(Some(0)).collect()
}

/// Zeroed properties block sized for the session name, as the control
/// calls require.
fn properties_block(name_len: usize) -> Vec<u8> {
    vec![0u8; size_of::<EVENT_TRACE_PROPERTIES>() + name_len * 2]
}

pub struct EtwBackend;

pub struct EtwSession {
    handle: CONTROLTRACE_HANDLE,
    logger_name: Vec<u16>,
}

// The control handle is a plain token; the control call itself is
// thread-safe.
unsafe impl Send for EtwSession {}

impl TraceBackend for EtwBackend {
    type Session = EtwSession;

    fn start_session(&self, sender: Sender<CallRecord>) -> Result<EtwSession> {
        let logger_name = logger_name_wide();

        let mut block = properties_block(logger_name.len());
        let properties = block.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES;
        unsafe {
            (*properties).Wnode.BufferSize = block.len() as u32;
            (*properties).Wnode.Flags = WNODE_FLAG_TRACED_GUID;
            (*properties).Wnode.ClientContext = 1;
            (*properties).Wnode.Guid = SYSTEM_TRACE_CONTROL_GUID;
            (*properties).EnableFlags = EVENT_TRACE_FLAG_NETWORK_TCPIP;
            (*properties).LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
            (*properties).LoggerNameOffset = size_of::<EVENT_TRACE_PROPERTIES>() as u32;
        }

        let mut handle = CONTROLTRACE_HANDLE::default();
        let status = unsafe {
            StartTraceW(&mut handle, PCWSTR(logger_name.as_ptr()), properties)
        };
        if status != ERROR_SUCCESS {
            return Err(Error::Trace(format!(
                "failed to start trace session (status {})",
                status.0
            )));
        }

        // The callback context owns the channel sender; the pump thread
        // reclaims it after ProcessTrace returns so the labeler sees the
        // channel close exactly when the session ends.
        let context = Box::into_raw(Box::new(PumpContext { sender }));

        let mut logfile = EVENT_TRACE_LOGFILEW::default();
        logfile.LoggerName = PWSTR(logger_name.as_ptr() as *mut u16);
        logfile.Anonymous1.ProcessTraceMode =
            PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(event_record_callback);
        logfile.Context = context as *mut c_void;

        let trace = unsafe { OpenTraceW(&mut logfile) };
        if trace.Value == u64::MAX {
            unsafe { drop(Box::from_raw(context)) };
            let mut stop_block = properties_block(logger_name.len());
            let stop_properties = stop_block.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES;
            unsafe {
                (*stop_properties).Wnode.BufferSize = stop_block.len() as u32;
                (*stop_properties).LoggerNameOffset = size_of::<EVENT_TRACE_PROPERTIES>() as u32;
                let _ = ControlTraceW(
                    handle,
                    PCWSTR(logger_name.as_ptr()),
                    stop_properties,
                    EVENT_TRACE_CONTROL_STOP,
                );
            }
            return Err(Error::Trace("failed to open trace consumer".into()));
        }

        // Fire-and-forget pump: ProcessTrace blocks until the session is
        // stopped, then the consumer handle and the callback context are
        // torn down here, never joined by stop().
        let context = SendPtr(context);
        let spawn = thread::Builder::new().name("etw-pump".into()).spawn(move || {
            let context = context;
            let status = unsafe { ProcessTrace(&[trace], None, None) };
            if status != ERROR_SUCCESS {
                warn!(status = status.0, "trace processing ended with status");
            }
            unsafe {
                let _ = CloseTrace(trace);
                drop(Box::from_raw(context.0));
            }
        });
        if let Err(err) = spawn {
            let mut session = EtwSession {
                handle,
                logger_name,
            };
            let _ = session.stop();
            return Err(Error::Io(err));
        }

        Ok(EtwSession {
            handle,
            logger_name,
        })
    }
}

impl TraceControl for EtwSession {
    fn stop(&mut self) -> Result<()> {
        let mut block = properties_block(self.logger_name.len());
        let properties = block.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES;
        let status = unsafe {
            (*properties).Wnode.BufferSize = block.len() as u32;
            (*properties).LoggerNameOffset = size_of::<EVENT_TRACE_PROPERTIES>() as u32;
            ControlTraceW(
                self.handle,
                PCWSTR(self.logger_name.as_ptr()),
                properties,
                EVENT_TRACE_CONTROL_STOP,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(Error::Trace(format!(
                "failed to stop trace session (status {})",
                status.0
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Event Decoding
// =============================================================================

unsafe extern "system" fn event_record_callback(record: *mut EVENT_RECORD) {
    if record.is_null() {
        return;
    }
    let record = unsafe { &*record };
    if record.EventHeader.EventDescriptor.Id != RPC_CLIENT_CALL_EVENT_ID {
        return;
    }
    let context = record.UserContext as *const PumpContext;
    if context.is_null() || record.UserData.is_null() {
        return;
    }

    let data = unsafe {
        std::slice::from_raw_parts(record.UserData as *const u8, record.UserDataLength as usize)
    };
    if let Some(call) = decode_client_call(
        record.EventHeader.ProcessId,
        record.EventHeader.ThreadId,
        record.EventHeader.TimeStamp as u64,
        data,
    ) {
        // A send failure means the monitor is tearing down; drop the event.
        let _ = unsafe { &(*context).sender }.send(call);
    }
}

/// Decode the client-call payload per the provider manifest: interface
/// UUID, procedure ordinal (u32), protocol-sequence code (u32), then
/// null-terminated UTF-16 network address and endpoint strings.
fn decode_client_call(
    process_id: u32,
    thread_id: u32,
    timestamp_ticks: u64,
    data: &[u8],
) -> Option<CallRecord> {
    if data.len() < CLIENT_CALL_PREFIX_LEN {
        debug!(len = data.len(), "client-call payload too short");
        return None;
    }

    let mut uuid = [0u8; InterfaceId::SIZE];
    uuid.copy_from_slice(&data[..InterfaceId::SIZE]);
    let opnum = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
    let protocol_code = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);

    let (_network_address, next) = read_utf16z(data, CLIENT_CALL_PREFIX_LEN);
    let (endpoint, _) = read_utf16z(data, next);

    Some(CallRecord {
        process_id,
        thread_id,
        timestamp_ticks,
        interface_uuid: InterfaceId::from_le_bytes(uuid),
        opnum,
        endpoint,
        protocol: protocol_name(protocol_code),
    })
}

/// Protocol-sequence codes the provider manifest defines.
fn protocol_name(code: u32) -> String {
    match code {
        0 => "ncalrpc".to_string(),
        1 => "ncacn_np".to_string(),
        2 => "ncacn_ip_tcp".to_string(),
        3 => "ncacn_http".to_string(),
        other => format!("protocol-{other}"),
    }
}

/// Read a null-terminated UTF-16 string at `offset`; returns the string
/// and the offset past its terminator.
fn read_utf16z(data: &[u8], offset: usize) -> (String, usize) {
    let mut units = Vec::new();
    let mut at = offset;
    while at + 1 < data.len() {
        let unit = u16::from_le_bytes([data[at], data[at + 1]]);
        at += 2;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    (String::from_utf16_lossy(&units), at)
}
