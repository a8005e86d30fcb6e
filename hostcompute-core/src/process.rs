// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Process lifecycle inside a compute system.
//!
//! A [`Process`] owns one process handle, an optional set of redirected
//! standard streams and a watcher scoped to the process-exited notification.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use crate::error::{ComputeError, ComputeResult, HcsError};
use crate::hcs::{CallOutcome, CreatedProcess, HandleKind, Hcs};
use crate::notification::{NotificationKind, NotificationResult, NotificationWatcher};
use crate::schema::{self, ProcessModifyRequest, ProcessParameters, ProcessStatus};
use crate::state::{ProcessState, StateMachine};
use crate::types::{Handle, ProcessId};

/// Default upper bound on the exit wait performed while disposing.
pub const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(10);

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Parameters for starting a process in a compute system.
#[derive(Debug, Clone)]
pub struct ProcessStartInfo {
    pub application_name: Option<String>,
    pub command_line: String,
    pub user: Option<String>,
    pub working_directory: Option<String>,
    pub environment: HashMap<String, String>,
    pub redirect_stdin: bool,
    pub redirect_stdout: bool,
    pub redirect_stderr: bool,
    /// Allocate a pseudo console; required for [`Process::resize_console`].
    pub emulate_console: bool,
    pub restricted_token: bool,
    /// Kill the process when the [`Process`] is disposed.
    pub kill_on_close: bool,
    /// Upper bound on the kill wait performed during disposal.
    pub dispose_timeout: Duration,
}

impl ProcessStartInfo {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            ..Self::default()
        }
    }

    pub(crate) fn parameters(&self) -> ProcessParameters {
        ProcessParameters {
            application_name: self.application_name.clone(),
            command_line: self.command_line.clone(),
            user: self.user.clone(),
            working_directory: self.working_directory.clone(),
            environment: self.environment.clone(),
            emulate_console: self.emulate_console,
            restricted_token: self.restricted_token,
            create_std_in_pipe: self.redirect_stdin,
            create_std_out_pipe: self.redirect_stdout,
            create_std_err_pipe: self.redirect_stderr,
        }
    }
}

impl Default for ProcessStartInfo {
    fn default() -> Self {
        Self {
            application_name: None,
            command_line: String::new(),
            user: None,
            working_directory: None,
            environment: HashMap::new(),
            redirect_stdin: false,
            redirect_stdout: false,
            redirect_stderr: false,
            emulate_console: false,
            restricted_token: false,
            kill_on_close: false,
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        }
    }
}

/// UTF-8 text reader over a process output stream.
/// A leading byte order mark, if the process wrote one, is skipped.
pub struct TextReader {
    inner: BufReader<Box<dyn Read + Send>>,
    bom_checked: bool,
}

impl TextReader {
    pub fn new(stream: Box<dyn Read + Send>) -> Self {
        Self {
            inner: BufReader::new(stream),
            bom_checked: false,
        }
    }

    fn skip_bom(&mut self) -> io::Result<()> {
        if !self.bom_checked {
            if self.inner.fill_buf()?.starts_with(UTF8_BOM) {
                self.inner.consume(UTF8_BOM.len());
            }
            self.bom_checked = true;
        }
        Ok(())
    }

    /// Read until end of stream. Invalid UTF-8 is an `InvalidData` error.
    pub fn read_all(&mut self) -> io::Result<String> {
        let mut text = String::new();
        self.read_to_string(&mut text)?;
        Ok(text)
    }
}

impl Read for TextReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.skip_bom()?;
        self.inner.read(buf)
    }
}

impl BufRead for TextReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.skip_bom()?;
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

/// UTF-8 text writer over a process input stream. Never emits a BOM.
pub struct TextWriter {
    inner: BufWriter<Box<dyn Write + Send>>,
}

impl TextWriter {
    pub fn new(stream: Box<dyn Write + Send>) -> Self {
        Self {
            inner: BufWriter::new(stream),
        }
    }

    /// Write `line` followed by a newline and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()
    }
}

impl Write for TextWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A running or exited process inside a compute system.
pub struct Process {
    hcs: Arc<dyn Hcs>,
    process_id: ProcessId,
    handle: Mutex<Option<Handle>>,
    watcher: NotificationWatcher,
    stdin: Mutex<Option<TextWriter>>,
    stdout: Mutex<Option<TextReader>>,
    stderr: Mutex<Option<TextReader>>,
    state: Mutex<StateMachine<ProcessState>>,
    /// Latched exit code; set means exited.
    exit_code: OnceLock<i32>,
    killed: AtomicBool,
    /// Outcome of the one terminate request this process ever issues.
    terminate: OnceLock<Result<CallOutcome, HcsError>>,
    emulate_console: bool,
    kill_on_close: bool,
    dispose_timeout: Duration,
    disposed: AtomicBool,
}

impl Process {
    /// Wrap a freshly created process. The watcher is built only once the
    /// handle exists; on failure the handle and streams are released.
    pub(crate) fn from_created(
        hcs: Arc<dyn Hcs>,
        created: CreatedProcess,
        info: &ProcessStartInfo,
    ) -> ComputeResult<Self> {
        let CreatedProcess {
            handle,
            process_id,
            streams,
        } = created;

        let watcher = Self::watch(&hcs, handle)?;

        tracing::info!(
            handle = %handle,
            pid = %process_id,
            command_line = %info.command_line,
            stdin = streams.stdin.is_some(),
            stdout = streams.stdout.is_some(),
            stderr = streams.stderr.is_some(),
            "Process created"
        );

        Ok(Self::assemble(
            hcs,
            handle,
            process_id,
            watcher,
            streams.stdin.map(TextWriter::new),
            streams.stdout.map(TextReader::new),
            streams.stderr.map(TextReader::new),
            info,
        ))
    }

    /// Wrap an existing process opened by pid. No streams, never killed on close.
    pub(crate) fn open(hcs: Arc<dyn Hcs>, handle: Handle, process_id: ProcessId) -> ComputeResult<Self> {
        let watcher = Self::watch(&hcs, handle)?;
        tracing::debug!(handle = %handle, pid = %process_id, "Process opened");

        let info = ProcessStartInfo::default();
        Ok(Self::assemble(
            hcs, handle, process_id, watcher, None, None, None, &info,
        ))
    }

    fn watch(hcs: &Arc<dyn Hcs>, handle: Handle) -> ComputeResult<NotificationWatcher> {
        NotificationWatcher::new(
            Arc::clone(hcs),
            HandleKind::Process,
            handle,
            &[NotificationKind::ProcessExited],
        )
        .map_err(|e| {
            if let Err(close_err) = hcs.close_process(handle) {
                tracing::warn!(handle = %handle, error = %close_err, "Failed to close process handle");
            }
            e.into()
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        hcs: Arc<dyn Hcs>,
        handle: Handle,
        process_id: ProcessId,
        watcher: NotificationWatcher,
        stdin: Option<TextWriter>,
        stdout: Option<TextReader>,
        stderr: Option<TextReader>,
        info: &ProcessStartInfo,
    ) -> Self {
        Self {
            hcs,
            process_id,
            handle: Mutex::new(Some(handle)),
            watcher,
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            state: Mutex::new(StateMachine::new(
                format!("process {}", process_id),
                ProcessState::Running,
            )),
            exit_code: OnceLock::new(),
            killed: AtomicBool::new(false),
            terminate: OnceLock::new(),
            emulate_console: info.emulate_console,
            kill_on_close: info.kill_on_close,
            dispose_timeout: info.dispose_timeout,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.process_id
    }

    pub fn state(&self) -> ProcessState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code.get().is_some()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// The exit code. Fails until an exit wait has observed the exit.
    pub fn exit_code(&self) -> ComputeResult<i32> {
        self.exit_code
            .get()
            .copied()
            .ok_or_else(|| ComputeError::InvalidState {
                operation: "exit_code",
                reason: format!("process {} has not been observed to exit", self.process_id),
            })
    }

    /// Take ownership of the redirected stdin, if any.
    pub fn take_stdin(&self) -> Option<TextWriter> {
        self.stdin.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Take ownership of the redirected stdout, if any.
    pub fn take_stdout(&self) -> Option<TextReader> {
        self.stdout.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Take ownership of the redirected stderr, if any.
    pub fn take_stderr(&self) -> Option<TextReader> {
        self.stderr.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn handle(&self) -> ComputeResult<Handle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or(ComputeError::Disposed)
    }

    fn record_exit(&self, result: &NotificationResult) -> ComputeResult<i32> {
        let data = result
            .data
            .as_deref()
            .ok_or_else(|| ComputeError::InvalidState {
                operation: "wait_for_exit",
                reason: "exit notification carried no process status".to_string(),
            })?;
        let status: ProcessStatus = schema::from_json(data, "process status")?;
        let code = *self.exit_code.get_or_init(|| status.exit_code as i32);

        if let Err(e) = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .transition_to(ProcessState::Exited)
        {
            tracing::warn!(pid = %self.process_id, error = %e, "Unexpected process state");
        }

        tracing::info!(pid = %self.process_id, exit_code = code, "Process exited");
        Ok(code)
    }

    /// Block up to `timeout` (forever if `None`) for the process to exit.
    /// Returns whether the exit was observed in time, not whether it succeeded.
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> ComputeResult<bool> {
        match self.watcher.wait_for(NotificationKind::ProcessExited, timeout)? {
            Some(result) => {
                self.record_exit(&result)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Suspend until the process exits and return its exit code.
    pub async fn wait_for_exit_async(&self) -> ComputeResult<i32> {
        let result = self.watcher.watch(NotificationKind::ProcessExited).await?;
        self.record_exit(&result)
    }

    /// Issue the terminate request at most once. Returns whether the caller
    /// must wait for the exit notification.
    fn begin_kill(&self) -> ComputeResult<bool> {
        if self.has_exited() {
            return Ok(false);
        }
        if let Some(Ok(result)) = self.watcher.outcome(NotificationKind::ProcessExited) {
            self.record_exit(&result)?;
            return Ok(false);
        }

        let handle = self.handle()?;
        let outcome = self
            .terminate
            .get_or_init(|| {
                self.killed.store(true, Ordering::Release);
                tracing::debug!(pid = %self.process_id, handle = %handle, "Terminating process");
                self.hcs.terminate_process(handle)
            })
            .clone()?;

        Ok(outcome.is_pending())
    }

    /// Kill the process and block until it has exited.
    ///
    /// Idempotent: at most one terminate request is ever issued and every
    /// caller returns only after the exit has been observed.
    pub fn kill(&self) -> ComputeResult<()> {
        if self.begin_kill()? {
            if let Some(result) = self
                .watcher
                .wait_for(NotificationKind::ProcessExited, None)?
            {
                self.record_exit(&result)?;
            }
        }
        Ok(())
    }

    /// Async form of [`Process::kill`].
    pub async fn kill_async(&self) -> ComputeResult<()> {
        if self.begin_kill()? {
            let result = self.watcher.watch(NotificationKind::ProcessExited).await?;
            self.record_exit(&result)?;
        }
        Ok(())
    }

    /// Resize the emulated console. Fire-and-forget.
    pub fn resize_console(&self, height: u16, width: u16) -> ComputeResult<()> {
        if !self.emulate_console {
            return Err(ComputeError::InvalidState {
                operation: "resize_console",
                reason: "process was not created with console emulation".to_string(),
            });
        }
        let handle = self.handle()?;
        let request = schema::to_json(&ProcessModifyRequest::resize(height, width), "console size")?;
        self.hcs.modify_process(handle, &request)?;
        tracing::debug!(pid = %self.process_id, height, width, "Console resized");
        Ok(())
    }

    /// Release everything this object owns. Never fails, never blocks past
    /// the dispose timeout, and later calls do nothing.
    ///
    /// Order: streams, kill (if kill-on-close), watcher, handle.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(self.take_stdin());
        drop(self.take_stdout());
        drop(self.take_stderr());

        if self.kill_on_close {
            match self.begin_kill() {
                Ok(true) => {
                    if !self
                        .watcher
                        .wait(NotificationKind::ProcessExited, Some(self.dispose_timeout))
                    {
                        tracing::warn!(
                            pid = %self.process_id,
                            timeout_ms = self.dispose_timeout.as_millis() as u64,
                            "Process did not exit while disposing"
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(pid = %self.process_id, error = %e, "Kill on close failed");
                }
            }
        }

        self.watcher.dispose();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = self.hcs.close_process(handle) {
                tracing::warn!(pid = %self.process_id, error = %e, "Failed to close process handle");
            }
        }

        tracing::debug!(pid = %self.process_id, "Process disposed");
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.process_id)
            .field("state", &self.state())
            .field("exit_code", &self.exit_code.get())
            .field("killed", &self.is_killed())
            .finish()
    }
}
