//! Flat entry points.
//!
//! Boolean and raw-handle wrappers over [`Wgl::global`], shaped like the
//! exported WGL and GL calls. Failures return `false`, `0` or a null pointer
//! and record an [`ErrorCode`] retrievable with [`get_last_error`]. The last
//! error is per thread; successful calls leave it untouched.

use std::cell::Cell;

use crate::debug::{DebugCallback, DebugUserData};
use crate::driver::{BufferAccess, BufferKey, ContextAttrib, DeviceContext, MapAccess, MapRequest};
use crate::error::{ErrorCode, WglError};
use crate::handle::Handle;
use crate::instance::Wgl;

thread_local! {
    static LAST_ERROR: Cell<ErrorCode> = const { Cell::new(ErrorCode::Success) };
}

/// Get the calling thread's last error.
pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(Cell::get)
}

/// Set the calling thread's last error.
pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|last| last.set(code));
}

fn report<T>(result: Result<T, WglError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            log::debug!("WGL call failed: {}", err);
            set_last_error(err.code());
            None
        }
    }
}

fn handle(raw: u32) -> Result<Handle, WglError> {
    Handle::from_raw(raw).ok_or(WglError::InvalidHandle)
}

fn handle_pair(a: u32, b: u32) -> Result<(Handle, Handle), WglError> {
    Ok((handle(a)?, handle(b)?))
}

fn map(request: MapRequest) -> *mut u8 {
    report(Wgl::global().map_buffer(&request)).map_or(std::ptr::null_mut(), |ptr| ptr.as_ptr())
}

fn unmap(key: BufferKey) -> bool {
    report(Wgl::global().unmap_buffer(key)).is_some()
}

/// Create a context on a surface. Returns `0` on failure.
pub fn wgl_create_context(dc: DeviceContext) -> u32 {
    report(Wgl::global().create_context(dc)).map_or(0, Handle::raw)
}

/// Create a context from an attribute list. `share` may be `0`.
pub fn wgl_create_context_attribs(dc: DeviceContext, share: u32, attribs: &[ContextAttrib]) -> u32 {
    let share = Handle::from_raw(share);
    report(Wgl::global().create_context_attribs(dc, share, attribs)).map_or(0, Handle::raw)
}

/// Delete a context.
pub fn wgl_delete_context(context: u32) -> bool {
    report(handle(context).and_then(|h| Wgl::global().delete_context(h))).is_some()
}

/// Bind a context to the calling thread. `context` may be `0` to unbind.
pub fn wgl_make_current(dc: Option<DeviceContext>, context: u32) -> bool {
    report(Wgl::global().make_current(dc, Handle::from_raw(context))).is_some()
}

/// Bind a context with separate draw and read surfaces.
pub fn wgl_make_context_current(
    draw: Option<DeviceContext>,
    read: Option<DeviceContext>,
    context: u32,
) -> bool {
    report(Wgl::global().make_context_current(draw, read, Handle::from_raw(context))).is_some()
}

/// Get the calling thread's current context, `0` if none.
pub fn wgl_get_current_context() -> u32 {
    Wgl::global().current_context().map_or(0, Handle::raw)
}

/// Get the calling thread's current draw surface.
pub fn wgl_get_current_dc() -> Option<DeviceContext> {
    Wgl::global().current_dc()
}

/// Copy state from one context to another.
pub fn wgl_copy_context(src: u32, dst: u32, mask: u32) -> bool {
    let result =
        handle_pair(src, dst).and_then(|(src, dst)| Wgl::global().copy_context(src, dst, mask));
    report(result).is_some()
}

/// Share object namespaces between two contexts.
pub fn wgl_share_lists(src: u32, dst: u32) -> bool {
    let result = handle_pair(src, dst).and_then(|(src, dst)| Wgl::global().share_lists(src, dst));
    report(result).is_some()
}

/// Create a pbuffer. Returns `0` on failure.
pub fn wgl_create_pbuffer(dc: DeviceContext, format: i32, width: i32, height: i32) -> u32 {
    report(Wgl::global().create_pbuffer(dc, format, width, height)).map_or(0, Handle::raw)
}

/// Destroy a pbuffer.
pub fn wgl_destroy_pbuffer(pbuffer: u32) -> bool {
    report(handle(pbuffer).and_then(|h| Wgl::global().destroy_pbuffer(h))).is_some()
}

/// Map the buffer bound to `target`. Returns null on failure.
pub fn gl_map_buffer(target: u32, access: BufferAccess) -> *mut u8 {
    map(MapRequest::buffer(target, access))
}

/// Map a range of the buffer bound to `target`. Returns null on failure.
pub fn gl_map_buffer_range(target: u32, offset: usize, length: usize, access: MapAccess) -> *mut u8 {
    map(MapRequest::buffer_range(target, offset, length, access))
}

/// Map a named buffer. Returns null on failure.
pub fn gl_map_named_buffer(buffer: u32, access: BufferAccess) -> *mut u8 {
    map(MapRequest::named(buffer, access))
}

/// Map a range of a named buffer. Returns null on failure.
pub fn gl_map_named_buffer_range(
    buffer: u32,
    offset: usize,
    length: usize,
    access: MapAccess,
) -> *mut u8 {
    map(MapRequest::named_range(buffer, offset, length, access))
}

/// Unmap the buffer bound to `target`.
pub fn gl_unmap_buffer(target: u32) -> bool {
    unmap(BufferKey::Target(target))
}

/// Unmap a named buffer.
pub fn gl_unmap_named_buffer(buffer: u32) -> bool {
    unmap(BufferKey::Named(buffer))
}

/// Register a debug callback on the current context.
pub fn gl_debug_message_callback(callback: Option<DebugCallback>, user_data: DebugUserData) {
    report(Wgl::global().debug_message_callback(callback, user_data));
}
