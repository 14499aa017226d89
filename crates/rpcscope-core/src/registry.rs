//! Known RPC server registry.
//!
//! Loads the JSON description of known RPC servers and answers
//! `(interface UUID, procedure ordinal) -> identity` lookups for the live
//! call monitor. The registry is immutable after load; a malformed or
//! unreadable source fails the load outright rather than producing a
//! partial registry.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::error::Result;
use crate::guid::InterfaceId;

/// On-disk record shape. Interface UUIDs appear without braces in the
/// source; keys are canonicalized on load.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServerRecord {
    interface_uuid: String,
    file_name: String,
    #[serde(default)]
    service_display_name: String,
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    procedures: Vec<ProcedureRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcedureRecord {
    name: String,
}

/// Identity of one known RPC server, immutable after load.
#[derive(Debug, Clone)]
pub struct RpcServerMetadata {
    pub file_name: String,
    pub service_display_name: Option<String>,
    pub service_name: Option<String>,
    /// Procedure names indexed by ordinal.
    pub procedures: Vec<String>,
}

/// Result of a lookup against a known interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcInfo {
    pub file_name: String,
    pub service_display_name: Option<String>,
    pub service_name: Option<String>,
    pub procedure_name: Option<String>,
}

/// Lookup table keyed by canonical braced interface UUID.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    servers: HashMap<String, RpcServerMetadata>,
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

impl ServiceRegistry {
    /// Load the registry from a JSON file. Any read or parse failure, or a
    /// record with an unparseable UUID, fails the whole load.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let records: Vec<ServerRecord> = serde_json::from_str(&text)?;

        let mut servers = HashMap::with_capacity(records.len());
        for record in records {
            let id = InterfaceId::from_str(&record.interface_uuid)?;
            servers.insert(
                id.to_string(),
                RpcServerMetadata {
                    file_name: record.file_name,
                    service_display_name: none_if_empty(record.service_display_name),
                    service_name: none_if_empty(record.service_name),
                    procedures: record.procedures.into_iter().map(|p| p.name).collect(),
                },
            );
        }
        debug!(servers = servers.len(), path = %path.display(), "service registry loaded");
        Ok(Self { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Pure lookup. Unknown or unparseable UUIDs yield `None`; a known
    /// interface with an out-of-range ordinal yields its metadata without a
    /// procedure name.
    pub fn get_rpc_info(&self, interface_uuid: &str, opnum: i64) -> Option<RpcInfo> {
        let key = InterfaceId::from_str(interface_uuid).ok()?.to_string();
        let server = self.servers.get(&key)?;

        let procedure_name = usize::try_from(opnum)
            .ok()
            .and_then(|ordinal| server.procedures.get(ordinal))
            .cloned();

        Some(RpcInfo {
            file_name: server.file_name.clone(),
            service_display_name: server.service_display_name.clone(),
            service_name: server.service_name.clone(),
            procedure_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const UUID: &str = "AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE";

    fn sample() -> ServiceRegistry {
        load_json(
            r#"[{
                "InterfaceUuid": "AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE",
                "FileName": "svc.dll",
                "ServiceDisplayName": "",
                "ServiceName": "Svc",
                "Procedures": [{"Name": "Open"}, {"Name": "Close"}]
            }]"#,
        )
        .unwrap()
    }

    fn load_json(text: &str) -> Result<ServiceRegistry> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        ServiceRegistry::load(&path)
    }

    #[test]
    fn known_interface_and_ordinal_resolve() {
        let registry = sample();
        let info = registry
            .get_rpc_info(&format!("{{{UUID}}}"), 1)
            .expect("known uuid");

        assert_eq!(info.file_name, "svc.dll");
        assert_eq!(info.service_name.as_deref(), Some("Svc"));
        assert_eq!(info.service_display_name, None);
        assert_eq!(info.procedure_name.as_deref(), Some("Close"));
    }

    #[test]
    fn unknown_interface_is_none() {
        let registry = sample();
        assert_eq!(
            registry.get_rpc_info("{11111111-2222-3333-4444-555555555555}", 0),
            None
        );
        assert_eq!(registry.get_rpc_info("garbage", 0), None);
    }

    #[test]
    fn ordinal_out_of_bounds_omits_procedure_name() {
        let registry = sample();
        for opnum in [-1i64, 2, i64::MAX] {
            let info = registry
                .get_rpc_info(&format!("{{{UUID}}}"), opnum)
                .expect("known uuid");
            assert_eq!(info.procedure_name, None);
            assert_eq!(info.file_name, "svc.dll");
        }
    }

    #[test]
    fn lookup_is_case_and_brace_insensitive() {
        let registry = sample();
        let lowered = UUID.to_ascii_lowercase();
        assert!(registry.get_rpc_info(&lowered, 0).is_some());
    }

    #[test]
    fn malformed_json_fails_load() {
        assert!(load_json("{ not json").is_err());
    }

    #[test]
    fn malformed_uuid_fails_load() {
        let result = load_json(r#"[{"InterfaceUuid": "nope", "FileName": "x.dll"}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn unreadable_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ServiceRegistry::load(&dir.path().join("missing.json")).is_err());
    }
}
