//! Background serial reader
//!
//! A single thread owns the inbound half of the serial port and pulls chunks
//! into a [ByteBuffer]. Callers scope which bytes are retained by holding a
//! [ListenGuard]: while no listener is active, incoming bytes are discarded
//! so that reset banners and other noise cannot poison the next command.

use std::{
    io::{self, Read},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    buffer::ByteBuffer,
    error::{ConnectionError, TimedOutCommand},
};

/// Upper bound on packet-extraction retries within a single [Reader::packet]
/// call, guarding against a peer that streams bytes without ever closing a
/// frame.
const MAX_PACKET_ATTEMPTS: usize = 1000;

/// Demultiplexer for the inbound serial stream.
pub struct Reader {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Result<(), ConnectionError>>>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

#[derive(Debug)]
struct State {
    buffer: ByteBuffer,
    listeners: usize,
    running: bool,
    closing: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoning panic in another thread must not wedge the port.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps the reader capturing bytes for as long as it is held.
///
/// Dropping the last guard resets the buffer, so bytes never leak from one
/// command transaction into the next.
#[derive(Debug)]
pub struct ListenGuard {
    shared: Arc<Shared>,
}

impl Drop for ListenGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.listeners -= 1;
        if state.listeners == 0 {
            state.buffer.reset();
        }
    }
}

impl Reader {
    pub fn new() -> Self {
        Reader {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: ByteBuffer::with_capacity(1024),
                    listeners: 0,
                    running: false,
                    closing: false,
                }),
                wakeup: Condvar::new(),
            }),
            handle: None,
        }
    }

    /// Begin pulling bytes from `source` on a background thread.
    pub fn start(&mut self, source: Box<dyn Read + Send>) -> Result<(), ConnectionError> {
        {
            let mut state = self.shared.lock();
            if state.running {
                return Err(ConnectionError::ReaderAlreadyRunning);
            }
            state.running = true;
            state.closing = false;
            state.buffer.reset();
        }

        // Reap a previous run that terminated on its own; it cannot still be
        // running or the check above would have fired.
        if let Some(stale) = self.handle.take() {
            if let Ok(Err(err)) = stale.join() {
                debug!("previous reader run had failed: {err}");
            }
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("esploader-reader".into())
            .spawn(move || read_loop(shared, source));

        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.lock().running = false;
                Err(err.into())
            }
        }
    }

    /// Signal shutdown, join the background thread and return the error it
    /// ended with, if any.
    pub fn stop(&mut self) -> Option<ConnectionError> {
        let handle = self.handle.take()?;

        {
            let mut state = self.shared.lock();
            state.closing = true;
        }
        self.shared.wakeup.notify_all();

        let result = match handle.join() {
            Ok(result) => result,
            Err(_) => {
                warn!("reader thread panicked during shutdown");
                Ok(())
            }
        };

        {
            let mut state = self.shared.lock();
            state.running = false;
            state.closing = false;
        }

        result.err()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Register interest in incoming bytes.
    pub fn listen(&self) -> Result<ListenGuard, ConnectionError> {
        let mut state = self.shared.lock();
        if !state.running {
            return Err(ConnectionError::ReaderNotRunning);
        }
        state.listeners += 1;

        Ok(ListenGuard {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Wait for the line to go quiet.
    ///
    /// Each try clears the buffer and waits up to `timeout` for any byte to
    /// arrive; a try that times out means the chip has stopped talking and
    /// is reported as success. Returns `false` when every try saw data.
    pub fn wait_silent(&self, retries: usize, timeout: Duration) -> Result<bool, ConnectionError> {
        let _listen = self.listen()?;

        for _ in 0..retries {
            self.shared.lock().buffer.reset();
            if self.wait_state(timeout, |state| !state.buffer.is_empty())?.is_none() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Wait until at least `min_len` bytes are buffered, then take them all.
    pub fn read(&self, min_len: usize, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        self.require_listener()?;

        let mut state = self
            .wait_state(timeout, |state| state.buffer.len() >= min_len)?
            .ok_or_else(|| ConnectionError::Timeout(TimedOutCommand::default()))?;

        let bytes = state.buffer.view().to_vec();
        state.buffer.reset();

        Ok(bytes)
    }

    /// Wait until a complete SLIP frame can be extracted.
    ///
    /// Waits for `min_len` buffered bytes first; if they do not yet contain a
    /// closing delimiter, waits for one more byte and tries again.
    pub fn packet(&self, min_len: usize, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        self.require_listener()?;

        let deadline = Instant::now() + timeout;
        let mut needed = min_len;

        for _ in 0..MAX_PACKET_ATTEMPTS {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut state = self
                .wait_state(remaining, |state| state.buffer.len() >= needed)?
                .ok_or_else(|| ConnectionError::Timeout(TimedOutCommand::default()))?;

            if let Some(packet) = state.buffer.packet(true) {
                return Ok(packet);
            }
            needed = state.buffer.len() + 1;
        }

        Err(ConnectionError::Timeout(TimedOutCommand::default()))
    }

    fn require_listener(&self) -> Result<(), ConnectionError> {
        let state = self.shared.lock();
        if state.listeners == 0 {
            return Err(ConnectionError::NotListening);
        }
        Ok(())
    }

    /// Block until `cond` holds or `timeout` elapses. Returns the state guard
    /// on success, `None` on timeout; fails if the reader shuts down while
    /// waiting.
    fn wait_state(
        &self,
        timeout: Duration,
        cond: impl Fn(&State) -> bool,
    ) -> Result<Option<MutexGuard<'_, State>>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        loop {
            if cond(&state) {
                return Ok(Some(state));
            }
            if !state.running {
                return Err(ConnectionError::ReaderNotRunning);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            state = self
                .shared
                .wakeup
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(shared: Arc<Shared>, mut source: Box<dyn Read + Send>) -> Result<(), ConnectionError> {
    let result = pull_bytes(&shared, &mut source);

    if let Err(err) = &result {
        debug!("reader loop terminated: {err}");
    }

    let mut state = shared.lock();
    state.running = false;
    drop(state);
    shared.wakeup.notify_all();

    result
}

fn pull_bytes(shared: &Arc<Shared>, source: &mut Box<dyn Read + Send>) -> Result<(), ConnectionError> {
    let mut chunk = [0u8; 1024];

    loop {
        if shared.lock().closing {
            return Ok(());
        }

        match source.read(&mut chunk) {
            // Source drained or closed: back off briefly before polling again.
            Ok(0) => thread::sleep(Duration::from_millis(1)),
            Ok(n) => {
                let mut state = shared.lock();
                if state.listeners > 0 {
                    state.buffer.copy(&chunk[..n]);
                    drop(state);
                    shared.wakeup.notify_all();
                }
            }
            Err(err) if is_transient(&err) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Line-level glitches (parity, framing, overrun, break) and timeouts are
/// recovered by retrying the read; everything else tears the loop down.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::InvalidData
    )
}
