//! FFI bindings for the NPTI tracker
//!
//! This module provides C-compatible functions for embedding the tracker in a
//! non-Rust host. The host owns time and I/O: it feeds JSON-encoded
//! `TrackerEvent`s (including ticks) and receives JSON `DeliveryPayload`s to
//! send whenever a flush happens. All functions use C strings
//! (null-terminated) and return allocated memory that must be freed by the
//! caller using `npti_free_string`.

use chrono::Utc;
use serde::Deserialize;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::config::TrackerConfig;
use crate::delivery::{DeliveryManager, FlushBatch};
use crate::error::TrackerError;
use crate::tracker::{BehaviorTracker, PageSnapshot, TrackerEvent};
use crate::types::{DeliveryPayload, SessionState, ViewerSession};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message
fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Clear the last error message
fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Session endpoint response plus the article the page shows
#[derive(Debug, Deserialize)]
struct SessionInit {
    #[serde(default)]
    article_id: Option<String>,
    #[serde(flatten)]
    state: SessionState,
}

/// Opaque handle to a tracker bound to one viewer session
pub struct NptiTrackerHandle {
    tracker: BehaviorTracker,
    manager: DeliveryManager,
}

impl NptiTrackerHandle {
    fn build(config: Option<&str>, session: &str, page: &str) -> Result<Self, TrackerError> {
        let config = match config {
            Some(json) => TrackerConfig::from_json(json)?,
            None => TrackerConfig::default(),
        };
        config.validate()?;

        let init: SessionInit = serde_json::from_str(session)?;
        let session =
            ViewerSession::from_session_state(&init.state, init.article_id.as_deref())?
                .ok_or_else(|| {
                    TrackerError::NotEligible(
                        init.state.user_id.clone().unwrap_or_else(|| "guest".to_string()),
                    )
                })?;
        let page: PageSnapshot = serde_json::from_str(page)?;

        Ok(Self {
            tracker: BehaviorTracker::new(&config, page),
            manager: DeliveryManager::new(session, config.collector_path),
        })
    }

    fn encode(&self, batch: FlushBatch) -> Result<String, TrackerError> {
        let payload = self.manager.build_payload(batch.records, Utc::now());
        Ok(serde_json::to_string(&payload)?)
    }
}

// ============================================================================
// Tracker API
// ============================================================================

/// Create a tracker.
///
/// # Safety
/// - `config_json` may be NULL to use defaults; otherwise a valid C string.
/// - `session_json` (the session endpoint response plus `article_id`:
///   `{"isLoggedIn", "hasNPTI", "user_id", "article_id"}`) and `page_json`
///   (a page snapshot) must be valid null-terminated C strings.
/// - Must be freed with `npti_tracker_free`.
/// - Returns NULL on error, including guests and viewers without an NPTI
///   profile; call `npti_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn npti_tracker_new(
    config_json: *const c_char,
    session_json: *const c_char,
    page_json: *const c_char,
) -> *mut NptiTrackerHandle {
    clear_last_error();

    let config = cstr_to_string(config_json);
    let session = match cstr_to_string(session_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid session string pointer");
            return ptr::null_mut();
        }
    };
    let page = match cstr_to_string(page_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid page string pointer");
            return ptr::null_mut();
        }
    };

    match NptiTrackerHandle::build(config.as_deref(), &session, &page) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free a tracker without flushing.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `npti_tracker_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn npti_tracker_free(handle: *mut NptiTrackerHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Feed one JSON event to the tracker.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `npti_tracker_new`.
/// - `event_json` must be a valid null-terminated C string.
/// - Returns the payload JSON to deliver when the event caused a flush; the
///   string must be freed with `npti_free_string`.
/// - Returns NULL when there is nothing to send, or on error; in the latter
///   case `npti_last_error` is set.
#[no_mangle]
pub unsafe extern "C" fn npti_tracker_handle_event(
    handle: *mut NptiTrackerHandle,
    event_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if handle.is_null() {
        set_last_error("Null tracker pointer");
        return ptr::null_mut();
    }

    let handle = &mut *handle;

    let json_str = match cstr_to_string(event_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid event string pointer");
            return ptr::null_mut();
        }
    };

    let event: TrackerEvent = match serde_json::from_str(&json_str) {
        Ok(event) => event,
        Err(e) => {
            set_last_error(&TrackerError::from(e).to_string());
            return ptr::null_mut();
        }
    };

    match handle.tracker.handle(event) {
        Some(batch) => match handle.encode(batch) {
            Ok(json) => string_to_cstr(&json),
            Err(e) => {
                set_last_error(&e.to_string());
                ptr::null_mut()
            }
        },
        None => ptr::null_mut(),
    }
}

/// Return the logs of an undelivered payload to the front of the buffer.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `npti_tracker_new`.
/// - `payload_json` must be a payload previously returned by this tracker.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn npti_tracker_requeue(
    handle: *mut NptiTrackerHandle,
    payload_json: *const c_char,
) -> i32 {
    clear_last_error();

    if handle.is_null() {
        set_last_error("Null tracker pointer");
        return -1;
    }

    let handle = &mut *handle;

    let json_str = match cstr_to_string(payload_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid payload string pointer");
            return -1;
        }
    };

    match serde_json::from_str::<DeliveryPayload>(&json_str) {
        Ok(payload) => {
            handle.tracker.requeue(payload.logs);
            0
        }
        Err(e) => {
            set_last_error(&TrackerError::from(e).to_string());
            -1
        }
    }
}

/// Number of records waiting in the buffer, or -1 for a NULL handle.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `npti_tracker_new`, or NULL.
#[no_mangle]
pub unsafe extern "C" fn npti_tracker_buffered(handle: *const NptiTrackerHandle) -> i64 {
    if handle.is_null() {
        return -1;
    }
    (*handle).tracker.buffered() as i64
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by tracker functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a tracker function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn npti_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next tracker function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn npti_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the tracker library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn npti_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    const SESSION: &str =
        r#"{"isLoggedIn":true,"hasNPTI":true,"user_id":"reader-1","article_id":"news-42"}"#;
    const PAGE: &str = r#"{"at_ms":0,"viewport":{"width":1000.0,"height":800.0},
        "region":{"left":100.0,"top":100.0,"right":900.0,"bottom":700.0}}"#;

    unsafe fn new_tracker() -> *mut NptiTrackerHandle {
        let session = CString::new(SESSION).unwrap();
        let page = CString::new(PAGE).unwrap();
        npti_tracker_new(ptr::null(), session.as_ptr(), page.as_ptr())
    }

    unsafe fn send(handle: *mut NptiTrackerHandle, json: &str) -> Option<String> {
        let event = CString::new(json).unwrap();
        let out = npti_tracker_handle_event(handle, event.as_ptr());
        if out.is_null() {
            return None;
        }
        let s = CStr::from_ptr(out).to_str().unwrap().to_string();
        npti_free_string(out);
        Some(s)
    }

    #[test]
    fn test_ffi_tracker_lifecycle() {
        unsafe {
            let handle = new_tracker();
            assert!(!handle.is_null());

            send(handle, r#"{"type":"pointer_move","at_ms":0,"x":500.0,"y":400.0}"#);
            for t in 1..=3 {
                let tick = format!(r#"{{"type":"tick","at_ms":{}}}"#, t * 1000);
                assert!(send(handle, &tick).is_none());
            }
            assert_eq!(npti_tracker_buffered(handle), 3);

            let payload = send(handle, r#"{"type":"visibility","at_ms":3100,"visible":false}"#)
                .expect("hidden page flushes");
            let parsed: DeliveryPayload = serde_json::from_str(&payload).unwrap();
            assert_eq!(parsed.total_logs, 3);
            assert_eq!(parsed.news_id, "news-42");
            assert_eq!(npti_tracker_buffered(handle), 0);

            // Host failed to deliver it
            let payload = CString::new(payload).unwrap();
            assert_eq!(npti_tracker_requeue(handle, payload.as_ptr()), 0);
            assert_eq!(npti_tracker_buffered(handle), 3);

            npti_tracker_free(handle);
        }
    }

    #[test]
    fn test_ffi_error_handling() {
        unsafe {
            let handle = new_tracker();
            assert!(send(handle, "not json").is_none());

            let error = npti_last_error();
            assert!(!error.is_null());
            let error_str = CStr::from_ptr(error).to_str().unwrap();
            assert!(!error_str.is_empty());

            // A valid event with no flush clears the error
            assert!(send(handle, r#"{"type":"focus","at_ms":5,"focused":true}"#).is_none());
            assert!(npti_last_error().is_null());

            npti_tracker_free(handle);
        }
    }

    #[test]
    fn test_ffi_rejects_missing_article() {
        unsafe {
            let session = CString::new(
                r#"{"isLoggedIn":true,"hasNPTI":true,"user_id":"reader-1","article_id":" "}"#,
            )
            .unwrap();
            let page = CString::new(PAGE).unwrap();
            let handle = npti_tracker_new(ptr::null(), session.as_ptr(), page.as_ptr());
            assert!(handle.is_null());
            assert!(!npti_last_error().is_null());
        }
    }

    #[test]
    fn test_ffi_refuses_ineligible_viewers() {
        let sessions = [
            // Guest
            r#"{"isLoggedIn":false,"article_id":"news-42"}"#,
            // Logged in without an NPTI profile
            r#"{"isLoggedIn":true,"hasNPTI":false,"user_id":"reader-1","article_id":"news-42"}"#,
        ];
        for json in sessions {
            unsafe {
                let session = CString::new(json).unwrap();
                let page = CString::new(PAGE).unwrap();
                let handle = npti_tracker_new(ptr::null(), session.as_ptr(), page.as_ptr());
                assert!(handle.is_null(), "tracked {json}");

                let error = CStr::from_ptr(npti_last_error()).to_str().unwrap();
                assert!(error.contains("not eligible"), "{error}");
            }
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = npti_version();
            assert!(!version.is_null());

            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert!(!version_str.is_empty());
        }
    }
}
