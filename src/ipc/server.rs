//! Named-pipe IPC server
//!
//! Listens on `\\.\pipe\MRVPN` for the desktop UI. Each connection reads
//! newline-delimited JSON requests, dispatches them in arrival order, and
//! writes responses back on the same connection through a per-connection
//! outbox so broadcasts may interleave without reordering responses.

use std::collections::HashMap;
use std::ffi::c_void;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::handler::Handler;
use super::protocol::{Notification, Request, Response, ERR_PARSE};

/// Pipe address shared with the UI.
pub const PIPE_NAME: &str = r"\\.\pipe\MRVPN";

/// Full access for SYSTEM and Administrators, read/write for Interactive
/// Users.
const PIPE_SDDL: &str = "D:P(A;;GA;;;SY)(A;;GA;;;BA)(A;;GRGW;;;IU)";

/// Connected-client cap; connections beyond it are closed immediately.
const MAX_CLIENTS: usize = 10;

/// Maximum accepted line length.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Rolling per-message read deadline.
const READ_DEADLINE: Duration = Duration::from_secs(5 * 60);

const INPUT_BUFFER_SIZE: u32 = 64 * 1024;
// App list with icons can be large.
const OUTPUT_BUFFER_SIZE: u32 = 1024 * 1024;

struct ServerState {
    clients: HashMap<u64, mpsc::UnboundedSender<String>>,
    next_client_id: u64,
    had_client: bool,
    drained_tx: Option<oneshot::Sender<()>>,
}

/// The named-pipe IPC server.
pub struct Server {
    handler: Arc<Handler>,
    state: Mutex<ServerState>,
    drained_rx: Mutex<Option<oneshot::Receiver<()>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Server {
    /// Create a new IPC server around the given handler.
    pub fn new(handler: Arc<Handler>) -> Self {
        let (drained_tx, drained_rx) = oneshot::channel();
        Self {
            handler,
            state: Mutex::new(ServerState {
                clients: HashMap::new(),
                next_client_id: 0,
                had_client: false,
                drained_tx: Some(drained_tx),
            }),
            drained_rx: Mutex::new(Some(drained_rx)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Begin listening on the named pipe.
    pub fn start(self: Arc<Self>) -> io::Result<()> {
        let first = create_pipe_instance(true)?;
        let server = Arc::clone(&self);
        self.tasks.spawn(async move { server.accept_loop(first).await });
        log::info!("IPC server listening on {PIPE_NAME}");
        Ok(())
    }

    /// Shut down: stop accepting, close all connections, wait for the
    /// connection tasks to drain.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        log::info!("IPC server stopped");
    }

    /// Signal that fires once all clients have disconnected after at least
    /// one was ever connected. Fires at most once.
    pub fn clients_drained(&self) -> Option<oneshot::Receiver<()>> {
        self.drained_rx.lock().take()
    }

    /// Send a notification to every live connection.
    ///
    /// A connection whose writer fails is torn down and removed from the
    /// set by its own task.
    pub fn broadcast(&self, notification: &Notification) {
        let line = match encode_line(notification) {
            Some(line) => line,
            None => return,
        };

        let state = self.state.lock();
        for sender in state.clients.values() {
            let _ = sender.send(line.clone());
        }
    }

    async fn accept_loop(self: Arc<Self>, mut instance: NamedPipeServer) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                connected = instance.connect() => {
                    if let Err(e) = connected {
                        log::error!("accept error: {e}");
                        match create_pipe_instance(false) {
                            Ok(fresh) => {
                                instance = fresh;
                                continue;
                            }
                            Err(e) => {
                                log::error!("failed to recreate pipe instance: {e}");
                                return;
                            }
                        }
                    }
                }
            }

            // Hand the connected instance off and stand up the next one
            // before serving, so a new client can always connect.
            let connected = match create_pipe_instance(false) {
                Ok(next) => std::mem::replace(&mut instance, next),
                Err(e) => {
                    log::error!("failed to create next pipe instance: {e}");
                    let connected = instance;
                    Arc::clone(&self).register_client(connected);
                    return;
                }
            };
            Arc::clone(&self).register_client(connected);
        }
    }

    /// Admit a connected pipe, enforcing the client cap.
    fn register_client(self: Arc<Self>, pipe: NamedPipeServer) {
        let (sender, outbox) = mpsc::unbounded_channel();

        let client_id = {
            let mut state = self.state.lock();
            if state.clients.len() >= MAX_CLIENTS {
                log::warn!("rejecting IPC connection: max clients ({MAX_CLIENTS}) reached");
                drop(state);
                drop(pipe);
                return;
            }
            let id = state.next_client_id;
            state.next_client_id += 1;
            state.clients.insert(id, sender.clone());
            state.had_client = true;
            id
        };

        let server = Arc::clone(&self);
        self.tasks.spawn(async move {
            server.serve_client(client_id, pipe, sender, outbox).await;
        });
    }

    async fn serve_client(
        self: Arc<Self>,
        client_id: u64,
        pipe: NamedPipeServer,
        sender: mpsc::UnboundedSender<String>,
        mut outbox: mpsc::UnboundedReceiver<String>,
    ) {
        let (reader, mut writer) = tokio::io::split(pipe);
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE));

        // Writer task: drains the outbox so responses keep arrival order
        // while broadcasts interleave freely.
        let mut writer_task = tokio::spawn(async move {
            while let Some(line) = outbox.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    log::warn!("failed to write to IPC client: {e}");
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                // Writer died (write failure): tear the connection down.
                _ = &mut writer_task => {
                    self.remove_client(client_id);
                    return;
                }
                next = tokio::time::timeout(READ_DEADLINE, lines.next()) => {
                    match next {
                        // Read deadline expired with no message.
                        Err(_) => {
                            log::info!("IPC client read deadline expired");
                            break;
                        }
                        Ok(None) => break,
                        Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                            let resp = Response::error(String::new(), ERR_PARSE, "message too large");
                            if let Some(line) = encode_line(&resp) {
                                let _ = sender.send(line);
                            }
                            break;
                        }
                        Ok(Some(Err(LinesCodecError::Io(e)))) => {
                            log::warn!("client read error: {e}");
                            break;
                        }
                        Ok(Some(Ok(line))) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let response = match serde_json::from_str::<Request>(&line) {
                                Ok(request) => self.handler.handle(request).await,
                                Err(_) => Response::error(String::new(), ERR_PARSE, "invalid JSON"),
                            };
                            if let Some(line) = encode_line(&response) {
                                if sender.send(line).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        // Closing the outbox lets queued responses flush before the pipe
        // drops.
        self.remove_client(client_id);
        drop(sender);
        let _ = tokio::time::timeout(Duration::from_secs(1), writer_task).await;
    }

    fn remove_client(&self, client_id: u64) {
        let drained = {
            let mut state = self.state.lock();
            state.clients.remove(&client_id);
            if state.had_client && state.clients.is_empty() {
                state.drained_tx.take()
            } else {
                None
            }
        };

        if let Some(signal) = drained {
            log::info!("all IPC clients disconnected, signaling drain");
            let _ = signal.send(());
        }
    }
}

fn encode_line<T: serde::Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(e) => {
            log::error!("failed to marshal IPC message: {e}");
            None
        }
    }
}

/// Create one pipe server instance with the restricted security descriptor.
fn create_pipe_instance(first: bool) -> io::Result<NamedPipeServer> {
    let descriptor = SecurityDescriptor::from_sddl(PIPE_SDDL)
        .map_err(|e| io::Error::other(format!("invalid pipe security descriptor: {e}")))?;

    let mut attributes = windows::Win32::Security::SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<windows::Win32::Security::SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor.as_ptr(),
        bInheritHandle: false.into(),
    };

    let mut options = ServerOptions::new();
    options
        .in_buffer_size(INPUT_BUFFER_SIZE)
        .out_buffer_size(OUTPUT_BUFFER_SIZE);
    if first {
        options.first_pipe_instance(true);
    }

    unsafe {
        options.create_with_security_attributes_raw(
            PIPE_NAME,
            &mut attributes as *mut _ as *mut c_void,
        )
    }
}

/// Security descriptor parsed from SDDL, freed on drop.
struct SecurityDescriptor(windows::Win32::Security::PSECURITY_DESCRIPTOR);

impl SecurityDescriptor {
    fn from_sddl(sddl: &str) -> windows::core::Result<Self> {
        use windows::core::PCWSTR;
        use windows::Win32::Security::Authorization::{
            ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
        };

        let sddl_wide: Vec<u16> = sddl.encode_utf16().chain(std::iter::once(0)).collect();
        let mut descriptor = windows::Win32::Security::PSECURITY_DESCRIPTOR::default();
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                PCWSTR(sddl_wide.as_ptr()),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )?;
        }
        Ok(Self(descriptor))
    }

    fn as_ptr(&self) -> *mut c_void {
        self.0 .0
    }
}

impl Drop for SecurityDescriptor {
    fn drop(&mut self) {
        if !self.0 .0.is_null() {
            unsafe {
                let _ = windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
                    self.0 .0,
                ));
            }
        }
    }
}
