// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `vmcompute.dll` bindings.
//!
//! [`NativeHcs`] forwards every [`Hcs`] request to the host compute service.
//! Result documents returned by the service are UTF-16 strings allocated
//! with the COM task allocator and are freed here after copying.
//!
//! Callbacks are registered with a boxed context pointer. The service does
//! not return from unregistration while a callback is running, so the
//! context is reclaimed right after unregistering.

use std::ffi::c_void;
use std::fs::File;
use std::os::windows::io::{FromRawHandle, RawHandle};
use std::ptr;

use dashmap::DashMap;

use crate::error::{HcsError, ResultCode};
use crate::hcs::{
    CallOutcome, CreatedProcess, HandleKind, Hcs, NotificationCallback, ProcessStreams,
};
use crate::notification::NotificationKind;
use crate::types::{CallbackHandle, ContainerId, Handle, ProcessId};

type RawHcsHandle = *mut c_void;
type Pcwstr = *const u16;
type Pwstr = *mut u16;

type RawNotificationCallback =
    unsafe extern "system" fn(kind: u32, context: *mut c_void, status: i32, data: Pcwstr);

#[repr(C)]
struct HcsProcessInformation {
    process_id: u32,
    reserved: u32,
    std_input: RawHandle,
    std_output: RawHandle,
    std_error: RawHandle,
}

#[link(name = "vmcompute")]
extern "system" {
    fn HcsCreateComputeSystem(
        id: Pcwstr,
        configuration: Pcwstr,
        identity: *mut c_void,
        compute_system: *mut RawHcsHandle,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsOpenComputeSystem(id: Pcwstr, compute_system: *mut RawHcsHandle, result: *mut Pwstr)
        -> i32;
    fn HcsCloseComputeSystem(compute_system: RawHcsHandle) -> i32;
    fn HcsStartComputeSystem(compute_system: RawHcsHandle, options: Pcwstr, result: *mut Pwstr)
        -> i32;
    fn HcsShutdownComputeSystem(
        compute_system: RawHcsHandle,
        options: Pcwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsTerminateComputeSystem(
        compute_system: RawHcsHandle,
        options: Pcwstr,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsRegisterComputeSystemCallback(
        compute_system: RawHcsHandle,
        callback: RawNotificationCallback,
        context: *mut c_void,
        callback_handle: *mut RawHcsHandle,
    ) -> i32;
    fn HcsUnregisterComputeSystemCallback(callback_handle: RawHcsHandle) -> i32;
    fn HcsCreateProcess(
        compute_system: RawHcsHandle,
        parameters: Pcwstr,
        information: *mut HcsProcessInformation,
        process: *mut RawHcsHandle,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsOpenProcess(
        compute_system: RawHcsHandle,
        process_id: u32,
        process: *mut RawHcsHandle,
        result: *mut Pwstr,
    ) -> i32;
    fn HcsCloseProcess(process: RawHcsHandle) -> i32;
    fn HcsTerminateProcess(process: RawHcsHandle, result: *mut Pwstr) -> i32;
    fn HcsModifyProcess(process: RawHcsHandle, settings: Pcwstr, result: *mut Pwstr) -> i32;
    fn HcsRegisterProcessCallback(
        process: RawHcsHandle,
        callback: RawNotificationCallback,
        context: *mut c_void,
        callback_handle: *mut RawHcsHandle,
    ) -> i32;
    fn HcsUnregisterProcessCallback(callback_handle: RawHcsHandle) -> i32;
}

#[link(name = "ole32")]
extern "system" {
    fn CoTaskMemFree(pv: *mut c_void);
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn wide_opt(s: Option<&str>) -> Option<Vec<u16>> {
    s.map(wide)
}

fn as_ptr(s: &Option<Vec<u16>>) -> Pcwstr {
    s.as_ref().map_or(ptr::null(), |w| w.as_ptr())
}

/// Copy a NUL-terminated UTF-16 string.
///
/// # Safety
/// `p` must be null or point to a valid NUL-terminated UTF-16 string.
unsafe fn read_wide(p: Pcwstr) -> Option<String> {
    if p.is_null() {
        return None;
    }
    let mut len = 0;
    while *p.add(len) != 0 {
        len += 1;
    }
    Some(String::from_utf16_lossy(std::slice::from_raw_parts(p, len)))
}

/// Copy and free a result document allocated by the service.
///
/// # Safety
/// `p` must be null or a string allocated with the COM task allocator.
unsafe fn take_wide(p: Pwstr) -> Option<String> {
    let s = read_wide(p);
    if !p.is_null() {
        CoTaskMemFree(p.cast());
    }
    s
}

fn to_raw(handle: Handle) -> RawHcsHandle {
    handle.raw() as usize as RawHcsHandle
}

fn from_raw(raw: RawHcsHandle) -> Result<Handle, HcsError> {
    Handle::new(raw as usize as u64).ok_or_else(|| {
        HcsError::new(ResultCode::INVALID_STATE, Some("service returned a null handle".into()))
    })
}

fn check(code: i32, result: Option<String>) -> Result<CallOutcome, HcsError> {
    CallOutcome::from_code(ResultCode(code), result)
}

/// Service thread entry point. `context` is the boxed callback registered
/// for this subscription.
unsafe extern "system" fn notification_trampoline(
    kind: u32,
    context: *mut c_void,
    status: i32,
    data: Pcwstr,
) {
    if context.is_null() {
        return;
    }
    let callback = &*(context as *const NotificationCallback);
    let Some(kind) = NotificationKind::from_raw(kind) else {
        tracing::trace!(kind, "Ignoring unknown notification");
        return;
    };
    let data = read_wide(data);
    callback(kind, ResultCode(status), data);
}

/// Host compute service reached through `vmcompute.dll`.
#[derive(Default)]
pub struct NativeHcs {
    /// Boxed callback per subscription, keyed by the service's callback handle.
    contexts: DashMap<CallbackHandle, usize>,
}

impl NativeHcs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Hcs for NativeHcs {
    fn create_compute_system(
        &self,
        id: &ContainerId,
        configuration: &str,
    ) -> Result<(Handle, CallOutcome), HcsError> {
        let id_w = wide(id.as_str());
        let config_w = wide(configuration);
        let mut system: RawHcsHandle = ptr::null_mut();
        let mut result: Pwstr = ptr::null_mut();
        let outcome = unsafe {
            let code = HcsCreateComputeSystem(
                id_w.as_ptr(),
                config_w.as_ptr(),
                ptr::null_mut(),
                &mut system,
                &mut result,
            );
            check(code, take_wide(result))
        }?;
        Ok((from_raw(system)?, outcome))
    }

    fn open_compute_system(&self, id: &ContainerId) -> Result<Handle, HcsError> {
        let id_w = wide(id.as_str());
        let mut system: RawHcsHandle = ptr::null_mut();
        let mut result: Pwstr = ptr::null_mut();
        unsafe {
            let code = HcsOpenComputeSystem(id_w.as_ptr(), &mut system, &mut result);
            check(code, take_wide(result))
        }?;
        from_raw(system)
    }

    fn close_compute_system(&self, system: Handle) -> Result<(), HcsError> {
        let code = unsafe { HcsCloseComputeSystem(to_raw(system)) };
        check(code, None).map(|_| ())
    }

    fn start_compute_system(
        &self,
        system: Handle,
        options: Option<&str>,
    ) -> Result<CallOutcome, HcsError> {
        let options_w = wide_opt(options);
        let mut result: Pwstr = ptr::null_mut();
        unsafe {
            let code = HcsStartComputeSystem(to_raw(system), as_ptr(&options_w), &mut result);
            check(code, take_wide(result))
        }
    }

    fn shutdown_compute_system(
        &self,
        system: Handle,
        options: Option<&str>,
    ) -> Result<CallOutcome, HcsError> {
        let options_w = wide_opt(options);
        let mut result: Pwstr = ptr::null_mut();
        unsafe {
            let code = HcsShutdownComputeSystem(to_raw(system), as_ptr(&options_w), &mut result);
            check(code, take_wide(result))
        }
    }

    fn terminate_compute_system(
        &self,
        system: Handle,
        options: Option<&str>,
    ) -> Result<CallOutcome, HcsError> {
        let options_w = wide_opt(options);
        let mut result: Pwstr = ptr::null_mut();
        unsafe {
            let code = HcsTerminateComputeSystem(to_raw(system), as_ptr(&options_w), &mut result);
            check(code, take_wide(result))
        }
    }

    fn create_process(
        &self,
        system: Handle,
        parameters: &str,
    ) -> Result<CreatedProcess, HcsError> {
        let params_w = wide(parameters);
        let mut info = HcsProcessInformation {
            process_id: 0,
            reserved: 0,
            std_input: ptr::null_mut(),
            std_output: ptr::null_mut(),
            std_error: ptr::null_mut(),
        };
        let mut process: RawHcsHandle = ptr::null_mut();
        let mut result: Pwstr = ptr::null_mut();
        unsafe {
            let code = HcsCreateProcess(
                to_raw(system),
                params_w.as_ptr(),
                &mut info,
                &mut process,
                &mut result,
            );
            check(code, take_wide(result))
        }?;

        // The pipe handles are ours from here on; File closes them on drop.
        let pipe = |raw: RawHandle| (!raw.is_null()).then(|| unsafe { File::from_raw_handle(raw) });
        let streams = ProcessStreams {
            stdin: pipe(info.std_input).map(|f| Box::new(f) as Box<dyn std::io::Write + Send>),
            stdout: pipe(info.std_output).map(|f| Box::new(f) as Box<dyn std::io::Read + Send>),
            stderr: pipe(info.std_error).map(|f| Box::new(f) as Box<dyn std::io::Read + Send>),
        };

        let handle = from_raw(process)?;
        let process_id = ProcessId::new(info.process_id)
            .map_err(|e| HcsError::new(ResultCode::INVALID_STATE, Some(e.to_string())))?;
        Ok(CreatedProcess {
            handle,
            process_id,
            streams,
        })
    }

    fn open_process(&self, system: Handle, pid: ProcessId) -> Result<Handle, HcsError> {
        let mut process: RawHcsHandle = ptr::null_mut();
        let mut result: Pwstr = ptr::null_mut();
        unsafe {
            let code = HcsOpenProcess(to_raw(system), pid.value(), &mut process, &mut result);
            check(code, take_wide(result))
        }?;
        from_raw(process)
    }

    fn close_process(&self, process: Handle) -> Result<(), HcsError> {
        let code = unsafe { HcsCloseProcess(to_raw(process)) };
        check(code, None).map(|_| ())
    }

    fn terminate_process(&self, process: Handle) -> Result<CallOutcome, HcsError> {
        let mut result: Pwstr = ptr::null_mut();
        unsafe {
            let code = HcsTerminateProcess(to_raw(process), &mut result);
            check(code, take_wide(result))
        }
    }

    fn modify_process(&self, process: Handle, settings: &str) -> Result<(), HcsError> {
        let settings_w = wide(settings);
        let mut result: Pwstr = ptr::null_mut();
        unsafe {
            let code = HcsModifyProcess(to_raw(process), settings_w.as_ptr(), &mut result);
            check(code, take_wide(result))
        }
        .map(|_| ())
    }

    fn register_callback(
        &self,
        kind: HandleKind,
        target: Handle,
        callback: NotificationCallback,
    ) -> Result<CallbackHandle, HcsError> {
        let context = Box::into_raw(Box::new(callback));
        let mut raw_token: RawHcsHandle = ptr::null_mut();
        let code = unsafe {
            match kind {
                HandleKind::ComputeSystem => HcsRegisterComputeSystemCallback(
                    to_raw(target),
                    notification_trampoline,
                    context.cast(),
                    &mut raw_token,
                ),
                HandleKind::Process => HcsRegisterProcessCallback(
                    to_raw(target),
                    notification_trampoline,
                    context.cast(),
                    &mut raw_token,
                ),
            }
        };

        if let Err(e) = check(code, None) {
            // Never handed to the service.
            drop(unsafe { Box::from_raw(context) });
            return Err(e);
        }

        let token = CallbackHandle::new(raw_token as usize as u64);
        self.contexts.insert(token, context as usize);
        Ok(token)
    }

    fn unregister_callback(&self, kind: HandleKind, token: CallbackHandle) -> Result<(), HcsError> {
        let raw = token.raw() as usize as RawHcsHandle;
        let code = unsafe {
            match kind {
                HandleKind::ComputeSystem => HcsUnregisterComputeSystemCallback(raw),
                HandleKind::Process => HcsUnregisterProcessCallback(raw),
            }
        };
        check(code, None)?;

        if let Some((_, context)) = self.contexts.remove(&token) {
            drop(unsafe { Box::from_raw(context as *mut NotificationCallback) });
        }
        Ok(())
    }
}

impl std::fmt::Debug for NativeHcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHcs")
            .field("subscriptions", &self.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_round_trip() {
        let w = wide("box-1");
        assert_eq!(w.last(), Some(&0));
        assert_eq!(unsafe { read_wide(w.as_ptr()) }.as_deref(), Some("box-1"));
        assert_eq!(unsafe { read_wide(ptr::null()) }, None);
    }

    #[test]
    fn test_null_handle_rejected() {
        assert!(from_raw(ptr::null_mut()).is_err());
    }
}
