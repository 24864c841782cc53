//! Transport contract for the desktop API channel.
//!
//! The peer application talks over a broadcast-style window-message channel:
//! a discovery broadcast, an attach reply carrying a status code and the
//! peer's handle, then `WM_COPYDATA` payloads in both directions. The core
//! only sees the narrow [`Transport`] contract; [`MemoryTransport`] backs the
//! tests and the Windows binding backs the binary.

use crate::config::TransportConfig;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Every framed payload ends with exactly one NUL byte.
pub const FRAME_TERMINATOR: u8 = 0;

/// Opaque transport-level identity of a peer (a window handle on Windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PeerHandle(pub u64);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Channel-level result code of a delivered message.
///
/// This only says the peer's message loop accepted the message; the
/// protocol-level answer arrives later as an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport call timed out after {0:?}")]
    Timeout(Duration),
    #[error("no peer answered the discovery broadcast")]
    NoPeer,
    #[error("transport is not running")]
    NotRunning,
    #[error("desktop API transport is only supported on Windows")]
    Unsupported,
    #[error("transport failure: {0}")]
    Os(String),
}

/// Win32 `ERROR_TIMEOUT`.
const ERROR_TIMEOUT_CODE: u32 = 1460;

impl TransportError {
    /// Classifies the last OS error left by a failed timed send.
    pub fn from_send_failure(code: u32, timeout: Duration) -> Self {
        if code == ERROR_TIMEOUT_CODE {
            Self::Timeout(timeout)
        } else {
            Self::Os(format!("SendMessageTimeoutW failed with error {code}"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload is not valid utf-8: {0}")]
    InvalidUtf8(String),
}

/// Something the channel delivered from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake reply: raw attach status code plus the replying peer.
    Attach { status: u32, peer: PeerHandle },
    /// A framed payload, terminator included when the sender supplied one.
    Payload { from: PeerHandle, frame: Vec<u8> },
}

/// Inbound callback registered with a transport.
///
/// Returns `false` once the receiving side is gone.
#[derive(Clone)]
pub struct InboundSink(Arc<dyn Fn(TransportEvent) -> bool + Send + Sync>);

impl InboundSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(TransportEvent) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(deliver))
    }

    pub fn deliver(&self, event: TransportEvent) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for InboundSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InboundSink")
    }
}

pub trait Transport: Send + Sync {
    /// Registers the callback that receives attach replies and payloads.
    fn register_inbound(&self, sink: InboundSink) -> Result<(), TransportError>;

    /// Announces this client to every running peer.
    fn broadcast_discover(&self) -> Result<Ack, TransportError>;

    /// One-way push of a framed payload to an attached peer.
    fn send(&self, peer: PeerHandle, frame: &[u8]) -> Result<Ack, TransportError>;
}

pub fn encode_frame(text: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(FRAME_TERMINATOR);
    frame
}

pub fn decode_frame(frame: &[u8]) -> Result<String, FrameError> {
    let body = match frame.split_last() {
        Some((&FRAME_TERMINATOR, body)) => body,
        _ => frame,
    };
    std::str::from_utf8(body)
        .map(str::to_string)
        .map_err(|err| FrameError::InvalidUtf8(err.to_string()))
}

/// Builds the platform transport for the binary.
#[cfg(windows)]
pub fn spawn_native(config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(Arc::new(windows_impl::WindowMessageTransport::spawn(config)?))
}

#[cfg(not(windows))]
pub fn spawn_native(_config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    Err(TransportError::Unsupported)
}

/// In-process transport that records outbound traffic and lets the caller
/// play the peer's side of the conversation.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sink: Option<InboundSink>,
    sent: Vec<(PeerHandle, Vec<u8>)>,
    discover_count: usize,
    discover_failure: Option<TransportError>,
    send_failure: Option<TransportError>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn discover_count(&self) -> usize {
        self.state().discover_count
    }

    pub fn sent_frames(&self) -> Vec<(PeerHandle, Vec<u8>)> {
        self.state().sent.clone()
    }

    /// Outbound payloads decoded back to text, in send order.
    pub fn sent_commands(&self) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .filter_map(|(_, frame)| decode_frame(frame).ok())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state().sent.clear();
    }

    pub fn fail_discover(&self, error: Option<TransportError>) {
        self.state().discover_failure = error;
    }

    pub fn fail_sends(&self, error: Option<TransportError>) {
        self.state().send_failure = error;
    }

    /// Plays an attach reply from `peer`.
    pub fn attach(&self, status: u32, peer: PeerHandle) -> bool {
        self.inject(TransportEvent::Attach { status, peer })
    }

    /// Plays a framed text payload from `from`.
    pub fn deliver(&self, from: PeerHandle, text: &str) -> bool {
        self.inject(TransportEvent::Payload {
            from,
            frame: encode_frame(text),
        })
    }

    pub fn inject(&self, event: TransportEvent) -> bool {
        let sink = self.state().sink.clone();
        match sink {
            Some(sink) => sink.deliver(event),
            None => false,
        }
    }
}

impl Transport for MemoryTransport {
    fn register_inbound(&self, sink: InboundSink) -> Result<(), TransportError> {
        self.state().sink = Some(sink);
        Ok(())
    }

    fn broadcast_discover(&self) -> Result<Ack, TransportError> {
        let mut state = self.state();
        if let Some(err) = state.discover_failure.clone() {
            return Err(err);
        }
        state.discover_count += 1;
        Ok(Ack(1))
    }

    fn send(&self, peer: PeerHandle, frame: &[u8]) -> Result<Ack, TransportError> {
        let mut state = self.state();
        if let Some(err) = state.send_failure.clone() {
            return Err(err);
        }
        state.sent.push((peer, frame.to_vec()));
        Ok(Ack(1))
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicIsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::thread::JoinHandle;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{GetLastError, HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::DataExchange::COPYDATASTRUCT;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DispatchMessageW, GetMessageW, PostMessageW,
        PostQuitMessage, RegisterClassW, RegisterWindowMessageW, SendMessageTimeoutW,
        TranslateMessage, HMENU, HWND_BROADCAST, MSG, SMTO_NORMAL, WINDOW_EX_STYLE, WM_CLOSE,
        WM_COPYDATA, WM_DESTROY, WNDCLASSW, WS_OVERLAPPED,
    };

    const WINDOW_CLASS: &str = "DesktopApiClientWindow";

    struct WindowState {
        discover_id: u32,
        attach_id: u32,
        sink: Arc<Mutex<Option<InboundSink>>>,
    }

    thread_local! {
        static WINDOW_STATE: RefCell<Option<WindowState>> = const { RefCell::new(None) };
    }

    /// Hidden window that owns the client's side of the message channel.
    ///
    /// The window and its message loop live on a dedicated thread; attach
    /// replies and `WM_COPYDATA` payloads are forwarded to the registered
    /// sink from that thread.
    pub struct WindowMessageTransport {
        hwnd: AtomicIsize,
        discover_id: u32,
        timeout: Duration,
        sink: Arc<Mutex<Option<InboundSink>>>,
        thread: Mutex<Option<JoinHandle<()>>>,
    }

    impl WindowMessageTransport {
        pub fn spawn(config: &TransportConfig) -> Result<Self, TransportError> {
            let discover_id =
                unsafe { RegisterWindowMessageW(PCWSTR(to_wide(&config.discover_message).as_ptr())) };
            let attach_id =
                unsafe { RegisterWindowMessageW(PCWSTR(to_wide(&config.attach_message).as_ptr())) };
            if discover_id == 0 || attach_id == 0 {
                return Err(TransportError::Os("RegisterWindowMessageW failed".to_string()));
            }

            let sink = Arc::new(Mutex::new(None::<InboundSink>));
            let thread_sink = sink.clone();
            let (ready_tx, ready_rx) = std_mpsc::channel();
            let thread = std::thread::Builder::new()
                .name("desktop-api-window".to_string())
                .spawn(move || run_window_loop(discover_id, attach_id, thread_sink, ready_tx))
                .map_err(|err| TransportError::Os(err.to_string()))?;
            let hwnd = ready_rx.recv().map_err(|_| TransportError::NotRunning)??;

            tracing::info!(
                window = hwnd,
                discover = %config.discover_message,
                attach = %config.attach_message,
                "desktop api window transport started"
            );
            Ok(Self {
                hwnd: AtomicIsize::new(hwnd),
                discover_id,
                timeout: config.timeout(),
                sink,
                thread: Mutex::new(Some(thread)),
            })
        }

        fn window(&self) -> Result<HWND, TransportError> {
            match self.hwnd.load(Ordering::SeqCst) {
                0 => Err(TransportError::NotRunning),
                raw => Ok(HWND(raw)),
            }
        }

        fn timeout_ms(&self) -> u32 {
            self.timeout.as_millis().min(u32::MAX as u128) as u32
        }
    }

    impl Transport for WindowMessageTransport {
        fn register_inbound(&self, sink: InboundSink) -> Result<(), TransportError> {
            *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
            Ok(())
        }

        fn broadcast_discover(&self) -> Result<Ack, TransportError> {
            let own = self.window()?;
            let mut result = 0usize;
            let rc = unsafe {
                SendMessageTimeoutW(
                    HWND_BROADCAST,
                    self.discover_id,
                    WPARAM(own.0 as usize),
                    LPARAM(0),
                    SMTO_NORMAL,
                    self.timeout_ms(),
                    Some(&mut result as *mut usize),
                )
            };
            if rc.0 == 0 {
                return Err(TransportError::NoPeer);
            }
            Ok(Ack(result))
        }

        fn send(&self, peer: PeerHandle, frame: &[u8]) -> Result<Ack, TransportError> {
            let own = self.window()?;
            let data = COPYDATASTRUCT {
                dwData: 0,
                cbData: frame.len() as u32,
                lpData: frame.as_ptr() as *mut _,
            };
            let mut result = 0usize;
            let rc = unsafe {
                SendMessageTimeoutW(
                    HWND(peer.0 as isize),
                    WM_COPYDATA,
                    WPARAM(own.0 as usize),
                    LPARAM(&data as *const COPYDATASTRUCT as isize),
                    SMTO_NORMAL,
                    self.timeout_ms(),
                    Some(&mut result as *mut usize),
                )
            };
            if rc.0 == 0 {
                let code = unsafe { GetLastError() }.0;
                return Err(TransportError::from_send_failure(code, self.timeout));
            }
            Ok(Ack(result))
        }
    }

    impl Drop for WindowMessageTransport {
        fn drop(&mut self) {
            if let Ok(hwnd) = self.window() {
                let _ = unsafe { PostMessageW(hwnd, WM_CLOSE, WPARAM(0), LPARAM(0)) };
            }
            self.hwnd.store(0, Ordering::SeqCst);
            let thread = self
                .thread
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(thread) = thread {
                let _ = thread.join();
            }
        }
    }

    fn run_window_loop(
        discover_id: u32,
        attach_id: u32,
        sink: Arc<Mutex<Option<InboundSink>>>,
        ready: std_mpsc::Sender<Result<isize, TransportError>>,
    ) {
        WINDOW_STATE.with(|state| {
            *state.borrow_mut() = Some(WindowState {
                discover_id,
                attach_id,
                sink,
            });
        });

        let hwnd = match unsafe { create_window() } {
            Ok(hwnd) => hwnd,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        let _ = ready.send(Ok(hwnd.0));

        let mut msg = MSG::default();
        unsafe {
            while GetMessageW(&mut msg, HWND(0), 0, 0).as_bool() {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
        tracing::debug!("desktop api window loop exited");
    }

    unsafe fn create_window() -> Result<HWND, TransportError> {
        let instance: HINSTANCE = GetModuleHandleW(None)
            .map_err(|err| TransportError::Os(err.to_string()))?
            .into();
        let class_name = to_wide(WINDOW_CLASS);
        let class = WNDCLASSW {
            lpfnWndProc: Some(window_proc),
            hInstance: instance,
            lpszClassName: PCWSTR(class_name.as_ptr()),
            ..Default::default()
        };
        // Zero means the class already exists, which is fine for a second client.
        RegisterClassW(&class);

        let hwnd = CreateWindowExW(
            WINDOW_EX_STYLE::default(),
            PCWSTR(class_name.as_ptr()),
            PCWSTR(class_name.as_ptr()),
            WS_OVERLAPPED,
            0,
            0,
            0,
            0,
            HWND(0),
            HMENU(0),
            instance,
            None,
        );
        if hwnd.0 == 0 {
            return Err(TransportError::Os("CreateWindowExW failed".to_string()));
        }
        Ok(hwnd)
    }

    fn forward(sink: &Arc<Mutex<Option<InboundSink>>>, event: TransportEvent) {
        let sink = sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            Some(sink) => {
                if !sink.deliver(event) {
                    tracing::debug!("inbound event dropped; client is gone");
                }
            }
            None => tracing::debug!("inbound event before sink registration"),
        }
    }

    unsafe extern "system" fn window_proc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        if msg == WM_DESTROY {
            PostQuitMessage(0);
            return LRESULT(0);
        }

        let handled = WINDOW_STATE.with(|state| {
            let state = state.borrow();
            let state = state.as_ref()?;

            if msg == state.attach_id {
                forward(
                    &state.sink,
                    TransportEvent::Attach {
                        status: lparam.0 as u32,
                        peer: PeerHandle(wparam.0 as u64),
                    },
                );
                // Anything but non-zero makes the peer consider the channel broken.
                return Some(LRESULT(1));
            }
            if msg == state.discover_id {
                tracing::debug!("own discovery broadcast echoed back");
                return Some(LRESULT(1));
            }
            if msg == WM_COPYDATA {
                let data = &*(lparam.0 as *const COPYDATASTRUCT);
                let frame = if data.lpData.is_null() || data.cbData == 0 {
                    Vec::new()
                } else {
                    std::slice::from_raw_parts(data.lpData as *const u8, data.cbData as usize)
                        .to_vec()
                };
                forward(
                    &state.sink,
                    TransportEvent::Payload {
                        from: PeerHandle(wparam.0 as u64),
                        frame,
                    },
                );
                return Some(LRESULT(1));
            }
            None
        });

        handled.unwrap_or_else(|| DefWindowProcW(hwnd, msg, wparam, lparam))
    }

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

}
