//! Installed-service identity lookup.
//!
//! Maps an executable path to the identity of the installed OS service
//! configured to run it. The trait keeps probes that depend on this
//! testable off Windows; the real implementation enumerates the service
//! control manager.

use std::path::Path;

/// Identity of an installed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service_name: String,
    pub display_name: String,
}

pub trait ServiceDirectory {
    /// Identity of the service whose configured binary path is `exe`, if
    /// any.
    fn service_for_binary(&self, exe: &Path) -> Option<ServiceIdentity>;
}

#[cfg(windows)]
pub use scm::ScmDirectory;

#[cfg(windows)]
mod scm {
    use std::path::Path;

    use tracing::warn;
    use windows::core::PCWSTR;
    use windows::Win32::Security::SC_HANDLE;
    use windows::Win32::System::Services::{
        CloseServiceHandle, EnumServicesStatusExW, OpenSCManagerW, OpenServiceW,
        QueryServiceConfigW, ENUM_SERVICE_STATUS_PROCESSW, QUERY_SERVICE_CONFIGW,
        SC_ENUM_PROCESS_INFO, SC_MANAGER_ENUMERATE_SERVICE, SERVICE_QUERY_CONFIG,
        SERVICE_STATE_ALL, SERVICE_WIN32,
    };

    use super::{ServiceDirectory, ServiceIdentity};

    /// Scoped service control manager handle.
    struct ScGuard(SC_HANDLE);

    impl Drop for ScGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseServiceHandle(self.0);
            }
        }
    }

    fn wide_to_string(ptr: PCWSTR) -> String {
        if ptr.is_null() {
            return String::new();
        }
        unsafe { ptr.to_string() }.unwrap_or_default()
    }

    /// The local service control manager.
    pub struct ScmDirectory;

    impl ScmDirectory {
        fn enumerate(&self, exe: &Path) -> Option<ServiceIdentity> {
            let wanted = exe.to_string_lossy().to_ascii_lowercase();

            let manager = match unsafe {
                OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), SC_MANAGER_ENUMERATE_SERVICE)
            } {
                Ok(handle) => ScGuard(handle),
                Err(err) => {
                    warn!(%err, "failed to open service control manager");
                    return None;
                }
            };

            // First pass sizes the buffer, second fills it.
            let mut needed = 0u32;
            let mut count = 0u32;
            let _ = unsafe {
                EnumServicesStatusExW(
                    manager.0,
                    SC_ENUM_PROCESS_INFO,
                    SERVICE_WIN32,
                    SERVICE_STATE_ALL,
                    None,
                    &mut needed,
                    &mut count,
                    None,
                    PCWSTR::null(),
                )
            };
            if needed == 0 {
                return None;
            }
            let mut buffer = vec![0u8; needed as usize];
            if unsafe {
                EnumServicesStatusExW(
                    manager.0,
                    SC_ENUM_PROCESS_INFO,
                    SERVICE_WIN32,
                    SERVICE_STATE_ALL,
                    Some(&mut buffer),
                    &mut needed,
                    &mut count,
                    None,
                    PCWSTR::null(),
                )
            }
            .is_err()
            {
                warn!("failed to enumerate services");
                return None;
            }

            let services = unsafe {
                std::slice::from_raw_parts(
                    buffer.as_ptr() as *const ENUM_SERVICE_STATUS_PROCESSW,
                    count as usize,
                )
            };
            for service in services {
                if let Some(identity) = self.match_service(&manager, service, &wanted) {
                    return Some(identity);
                }
            }
            None
        }

        fn match_service(
            &self,
            manager: &ScGuard,
            service: &ENUM_SERVICE_STATUS_PROCESSW,
            wanted: &str,
        ) -> Option<ServiceIdentity> {
            let name = PCWSTR(service.lpServiceName.as_ptr());
            let handle = match unsafe { OpenServiceW(manager.0, name, SERVICE_QUERY_CONFIG) } {
                Ok(handle) => ScGuard(handle),
                Err(_) => return None,
            };

            let mut needed = 0u32;
            let _ = unsafe { QueryServiceConfigW(handle.0, None, 0, &mut needed) };
            if needed == 0 {
                return None;
            }
            let mut buffer = vec![0u8; needed as usize];
            let config = buffer.as_mut_ptr() as *mut QUERY_SERVICE_CONFIGW;
            if unsafe { QueryServiceConfigW(handle.0, Some(config), needed, &mut needed) }.is_err()
            {
                return None;
            }

            let image = wide_to_string(PCWSTR(unsafe { (*config).lpBinaryPathName.as_ptr() }))
                .to_ascii_lowercase();
            if image == wanted {
                Some(ServiceIdentity {
                    service_name: wide_to_string(PCWSTR(service.lpServiceName.as_ptr())),
                    display_name: wide_to_string(PCWSTR(service.lpDisplayName.as_ptr())),
                })
            } else {
                None
            }
        }
    }

    impl ServiceDirectory for ScmDirectory {
        fn service_for_binary(&self, exe: &Path) -> Option<ServiceIdentity> {
            self.enumerate(exe)
        }
    }
}
