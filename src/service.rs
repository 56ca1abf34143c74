//! Windows service host
//!
//! Installs, removes, starts and stops the MRVPN service through the
//! Service Control Manager, and runs the core under the service control
//! dispatcher with proper status reporting. Also registers the service as
//! an event-log source so Info/Warning/Error records resolve in Event
//! Viewer.

use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{ERROR_CALL_NOT_IMPLEMENTED, ERROR_FAILED_SERVICE_CONTROLLER_CONNECT, NO_ERROR};
use windows::Win32::System::Services::{
    ChangeServiceConfig2W, CloseServiceHandle, ControlService, CreateServiceW, DeleteService,
    OpenSCManagerW, OpenServiceW, QueryServiceStatus, RegisterServiceCtrlHandlerExW,
    SetServiceStatus, StartServiceCtrlDispatcherW, StartServiceW, SC_HANDLE,
    SC_MANAGER_ALL_ACCESS, SERVICE_ACCEPT_SHUTDOWN, SERVICE_ACCEPT_STOP, SERVICE_ALL_ACCESS,
    SERVICE_AUTO_START, SERVICE_CONFIG_DESCRIPTION, SERVICE_CONTROL_INTERROGATE,
    SERVICE_CONTROL_SHUTDOWN, SERVICE_CONTROL_STOP, SERVICE_DESCRIPTIONW, SERVICE_ERROR_NORMAL,
    SERVICE_QUERY_STATUS, SERVICE_RUNNING, SERVICE_START_PENDING, SERVICE_STATUS,
    SERVICE_STATUS_CURRENT_STATE, SERVICE_STATUS_HANDLE, SERVICE_STOP, SERVICE_STOPPED,
    SERVICE_STOP_PENDING, SERVICE_TABLE_ENTRYW, SERVICE_WIN32_OWN_PROCESS,
};

const SERVICE_NAME: &str = "MRVPN";
const SERVICE_DISPLAY: &str = "MRVPN Service";
const SERVICE_DESCRIPTION: &str = "MRVPN backend service - manages VPN connections via sing-box";

/// Event-log source registration key.
const EVENT_LOG_KEY: &str = r"SYSTEM\CurrentControlSet\Services\EventLog\Application\MRVPN";

/// Grace period after sending Stop during uninstall.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Service host errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service already exists")]
    AlreadyInstalled,

    #[error("service not found")]
    NotInstalled,

    #[error("failed to resolve executable path: {0}")]
    ExePath(#[from] std::io::Error),

    #[error("service manager error: {0}")]
    Scm(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// The core entry point handed to the dispatcher; cancelling the token asks
/// the core to unwind.
type RunFn = Box<dyn FnOnce(CancellationToken) + Send>;

static SERVICE_RUN: Mutex<Option<RunFn>> = Mutex::new(None);
static STOP_SIGNAL: Mutex<Option<std::sync::mpsc::Sender<()>>> = Mutex::new(None);
static STATUS_HANDLE: AtomicIsize = AtomicIsize::new(0);

/// Owned SCM handle, closed on drop.
struct ScHandle(SC_HANDLE);

impl Drop for ScHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseServiceHandle(self.0);
            }
        }
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn open_manager() -> ServiceResult<ScHandle> {
    unsafe {
        OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), SC_MANAGER_ALL_ACCESS)
            .map(ScHandle)
            .map_err(|e| ServiceError::Scm(format!("failed to connect to service manager: {e}")))
    }
}

/// Install the service with automatic start and the `service` argument.
pub fn install() -> ServiceResult<()> {
    let exe_path = std::env::current_exe()?;
    let bin_path = format!("\"{}\" service", exe_path.display());

    let manager = open_manager()?;
    let name_wide = wide(SERVICE_NAME);

    // Refuse to clobber an existing registration.
    if let Ok(existing) =
        unsafe { OpenServiceW(manager.0, PCWSTR(name_wide.as_ptr()), SERVICE_QUERY_STATUS) }
    {
        let _existing = ScHandle(existing);
        return Err(ServiceError::AlreadyInstalled);
    }

    let display_wide = wide(SERVICE_DISPLAY);
    let bin_path_wide = wide(&bin_path);

    let service = unsafe {
        CreateServiceW(
            manager.0,
            PCWSTR(name_wide.as_ptr()),
            PCWSTR(display_wide.as_ptr()),
            SERVICE_ALL_ACCESS,
            SERVICE_WIN32_OWN_PROCESS,
            SERVICE_AUTO_START,
            SERVICE_ERROR_NORMAL,
            PCWSTR(bin_path_wide.as_ptr()),
            None,
            None,
            None,
            None,
            None,
        )
        .map(ScHandle)
        .map_err(|e| ServiceError::Scm(format!("failed to create service: {e}")))?
    };

    // Attach the description shown in services.msc.
    let mut description_wide = wide(SERVICE_DESCRIPTION);
    let description = SERVICE_DESCRIPTIONW {
        lpDescription: PWSTR(description_wide.as_mut_ptr()),
    };
    unsafe {
        if let Err(e) = ChangeServiceConfig2W(
            service.0,
            SERVICE_CONFIG_DESCRIPTION,
            Some(&description as *const _ as *const c_void),
        ) {
            log::warn!("failed to set service description: {e}");
        }
    }

    if let Err(e) = register_event_source(&exe_path) {
        log::warn!("failed to set up event logging: {e}");
    }

    log::info!("service {SERVICE_NAME} installed successfully");
    Ok(())
}

/// Remove the service, stopping it first when running.
pub fn uninstall() -> ServiceResult<()> {
    let manager = open_manager()?;
    let name_wide = wide(SERVICE_NAME);

    let service = unsafe {
        OpenServiceW(manager.0, PCWSTR(name_wide.as_ptr()), SERVICE_ALL_ACCESS)
            .map(ScHandle)
            .map_err(|_| ServiceError::NotInstalled)?
    };

    unsafe {
        let mut status = SERVICE_STATUS::default();
        if QueryServiceStatus(service.0, &mut status).is_ok()
            && status.dwCurrentState != SERVICE_STOPPED
        {
            let _ = ControlService(service.0, SERVICE_CONTROL_STOP, &mut status);
            std::thread::sleep(STOP_GRACE);
        }

        DeleteService(service.0)
            .map_err(|e| ServiceError::Scm(format!("failed to delete service: {e}")))?;
    }

    remove_event_source();

    log::info!("service {SERVICE_NAME} uninstalled successfully");
    Ok(())
}

/// Start the service through the SCM.
pub fn start() -> ServiceResult<()> {
    let manager = open_manager()?;
    let name_wide = wide(SERVICE_NAME);

    let service = unsafe {
        OpenServiceW(manager.0, PCWSTR(name_wide.as_ptr()), SERVICE_ALL_ACCESS)
            .map(ScHandle)
            .map_err(|_| ServiceError::NotInstalled)?
    };

    unsafe {
        StartServiceW(service.0, None)
            .map_err(|e| ServiceError::Scm(format!("failed to start service: {e}")))
    }
}

/// Stop the service through the SCM.
pub fn stop() -> ServiceResult<()> {
    let manager = open_manager()?;
    let name_wide = wide(SERVICE_NAME);

    let service = unsafe {
        OpenServiceW(manager.0, PCWSTR(name_wide.as_ptr()), SERVICE_STOP)
            .map(ScHandle)
            .map_err(|_| ServiceError::NotInstalled)?
    };

    unsafe {
        let mut status = SERVICE_STATUS::default();
        ControlService(service.0, SERVICE_CONTROL_STOP, &mut status)
            .map_err(|e| ServiceError::Scm(format!("failed to stop service: {e}")))
    }
}

/// Run under the service control dispatcher.
///
/// Returns `Ok(true)` after the service has run to completion, `Ok(false)`
/// when the process was not started by the SCM (caller should fall back to
/// interactive mode).
pub fn run_as_service(run: impl FnOnce(CancellationToken) + Send + 'static) -> ServiceResult<bool> {
    *SERVICE_RUN.lock() = Some(Box::new(run));

    let mut name_wide = wide(SERVICE_NAME);
    let table = [
        SERVICE_TABLE_ENTRYW {
            lpServiceName: PWSTR(name_wide.as_mut_ptr()),
            lpServiceProc: Some(service_main),
        },
        SERVICE_TABLE_ENTRYW::default(),
    ];

    let result = unsafe { StartServiceCtrlDispatcherW(table.as_ptr()) };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.code() == ERROR_FAILED_SERVICE_CONTROLLER_CONNECT.to_hresult() => {
            *SERVICE_RUN.lock() = None;
            Ok(false)
        }
        Err(e) => {
            *SERVICE_RUN.lock() = None;
            Err(ServiceError::Scm(format!("service dispatcher failed: {e}")))
        }
    }
}

unsafe extern "system" fn service_main(_argc: u32, _argv: *mut PWSTR) {
    let name_wide = wide(SERVICE_NAME);
    let handle = match RegisterServiceCtrlHandlerExW(
        PCWSTR(name_wide.as_ptr()),
        Some(control_handler),
        None,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("failed to register service control handler: {e}");
            return;
        }
    };
    STATUS_HANDLE.store(handle.0 as isize, Ordering::SeqCst);

    report_status(SERVICE_START_PENDING, 0);

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    *STOP_SIGNAL.lock() = Some(stop_tx);

    let token = CancellationToken::new();
    let run = SERVICE_RUN.lock().take();
    let worker = {
        let token = token.clone();
        std::thread::spawn(move || {
            if let Some(run) = run {
                run(token);
            }
        })
    };

    report_status(SERVICE_RUNNING, SERVICE_ACCEPT_STOP | SERVICE_ACCEPT_SHUTDOWN);

    // Block until the SCM asks us to stop or shut down.
    let _ = stop_rx.recv();

    report_status(SERVICE_STOP_PENDING, 0);
    token.cancel();
    let _ = worker.join();

    report_status(SERVICE_STOPPED, 0);
}

unsafe extern "system" fn control_handler(
    control: u32,
    _event_type: u32,
    _event_data: *mut c_void,
    _context: *mut c_void,
) -> u32 {
    match control {
        SERVICE_CONTROL_STOP | SERVICE_CONTROL_SHUTDOWN => {
            if let Some(stop) = STOP_SIGNAL.lock().take() {
                let _ = stop.send(());
            }
            NO_ERROR.0
        }
        SERVICE_CONTROL_INTERROGATE => NO_ERROR.0,
        _ => ERROR_CALL_NOT_IMPLEMENTED.0,
    }
}

fn report_status(state: SERVICE_STATUS_CURRENT_STATE, controls_accepted: u32) {
    let raw = STATUS_HANDLE.load(Ordering::SeqCst);
    if raw == 0 {
        return;
    }
    let handle = SERVICE_STATUS_HANDLE(raw as *mut c_void);

    let status = SERVICE_STATUS {
        dwServiceType: SERVICE_WIN32_OWN_PROCESS,
        dwCurrentState: state,
        dwControlsAccepted: controls_accepted,
        dwWin32ExitCode: NO_ERROR.0,
        dwServiceSpecificExitCode: 0,
        dwCheckPoint: 0,
        dwWaitHint: 0,
    };

    unsafe {
        if let Err(e) = SetServiceStatus(handle, &status) {
            log::warn!("SetServiceStatus failed: {e}");
        }
    }
}

/// Register as an event-log source so Info/Warning/Error records resolve.
fn register_event_source(exe_path: &Path) -> std::io::Result<()> {
    use winreg::enums::HKEY_LOCAL_MACHINE;
    use winreg::RegKey;

    let (key, _) = RegKey::predef(HKEY_LOCAL_MACHINE).create_subkey(EVENT_LOG_KEY)?;
    key.set_value(
        "EventMessageFile",
        &exe_path.to_string_lossy().into_owned(),
    )?;
    // Error | Warning | Info
    key.set_value("TypesSupported", &7u32)?;
    Ok(())
}

fn remove_event_source() {
    use winreg::enums::HKEY_LOCAL_MACHINE;
    use winreg::RegKey;

    let _ = RegKey::predef(HKEY_LOCAL_MACHINE).delete_subkey_all(EVENT_LOG_KEY);
}
