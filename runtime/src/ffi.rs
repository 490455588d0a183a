//! C ABI entry points
//!
//! Mirrors the host interface that translated kernels link against. Handles
//! returned here are owned by the caller and must be released with the
//! matching `kernrun_free_*` function.

use std::slice;

use libc::c_int;

use crate::abi::{BufferDescriptor, ImageDescriptor, ProgramInfo};
use crate::alloc::{allocate_buffer, allocate_image_rgba, Buffer, Image};
use crate::context::{DispatchContext, ThreadContext};
use crate::program::Program;

/// Allocate a zeroed storage buffer.
///
/// # Safety
/// The returned descriptor must be released with `kernrun_free_buffer`.
#[no_mangle]
pub unsafe extern "C" fn kernrun_alloc_buffer(size: usize) -> BufferDescriptor {
    allocate_buffer(size).into_descriptor()
}

/// # Safety
/// `desc` must come from `kernrun_alloc_buffer` and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn kernrun_free_buffer(desc: BufferDescriptor) {
    if desc.ptr.is_null() {
        log::error!("kernrun_free_buffer: null buffer");
        return;
    }
    drop(Buffer::from_descriptor(desc));
}

/// Allocate a zeroed RGBA8 image. Negative dimensions are treated as zero.
///
/// # Safety
/// The returned descriptor must be released with `kernrun_free_image`.
#[no_mangle]
pub unsafe extern "C" fn kernrun_alloc_image_rgba(width: c_int, height: c_int) -> ImageDescriptor {
    allocate_image_rgba(width.max(0) as u32, height.max(0) as u32).into_descriptor()
}

/// # Safety
/// `desc` must come from `kernrun_alloc_image_rgba` and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn kernrun_free_image(desc: ImageDescriptor) {
    if desc.ptr.is_null() {
        log::error!("kernrun_free_image: null image");
        return;
    }
    drop(Image::from_descriptor(desc));
}

/// # Safety
/// The returned handle must be released with `kernrun_free_dispatch_context`.
#[no_mangle]
pub unsafe extern "C" fn kernrun_alloc_dispatch_context() -> *mut DispatchContext {
    Box::into_raw(Box::new(DispatchContext::new()))
}

/// # Safety
/// `ctx` must come from `kernrun_alloc_dispatch_context`, with no dispatch
/// running on it.
#[no_mangle]
pub unsafe extern "C" fn kernrun_free_dispatch_context(ctx: *mut DispatchContext) {
    if ctx.is_null() {
        log::error!("kernrun_free_dispatch_context: null context");
        return;
    }
    drop(Box::from_raw(ctx));
}

/// # Safety
/// The returned handle must be released with `kernrun_free_thread_context`.
#[no_mangle]
pub unsafe extern "C" fn kernrun_alloc_thread_context() -> *mut ThreadContext {
    Box::into_raw(Box::new(ThreadContext::new()))
}

/// # Safety
/// `thread` must come from `kernrun_alloc_thread_context` and not be in use.
#[no_mangle]
pub unsafe extern "C" fn kernrun_free_thread_context(thread: *mut ThreadContext) {
    if thread.is_null() {
        log::error!("kernrun_free_thread_context: null context");
        return;
    }
    drop(Box::from_raw(thread));
}

/// Prepare `ctx` to run `info` over an `ngroupx * ngroupy * ngroupz` grid
/// split among `nthreads` threads. If `info` is null or rejected, `ctx` is
/// left unprepared and later dispatches on it do nothing.
///
/// # Safety
/// - `ctx` must be a live dispatch context not used by any running thread
/// - `info` must point to valid program metadata whose entry points honour
///   the coroutine contract
/// - `desc_set` must be null or readable for `info.desc_set_size` bytes, and
///   encode bindings that stay live until every dispatch of `ctx` returns
#[no_mangle]
pub unsafe extern "C" fn kernrun_prepare_dispatch(
    ctx: *mut DispatchContext,
    nthreads: c_int,
    info: *const ProgramInfo,
    desc_set: *const u8,
    ngroupx: c_int,
    ngroupy: c_int,
    ngroupz: c_int,
) {
    let Some(ctx) = ctx.as_mut() else {
        log::error!("kernrun_prepare_dispatch: null context");
        return;
    };
    let Some(info) = info.as_ref() else {
        log::error!("kernrun_prepare_dispatch: null program info");
        ctx.reset();
        return;
    };

    let program = match Program::native(*info) {
        Ok(program) => program,
        Err(e) => {
            log::error!("kernrun_prepare_dispatch: {}", e);
            ctx.reset();
            return;
        }
    };

    let descriptor_set: &[u8] = if desc_set.is_null() {
        &[]
    } else {
        slice::from_raw_parts(desc_set, info.desc_set_size)
    };

    let groups = [ngroupx, ngroupy, ngroupz].map(|n| n.max(0) as u32);
    ctx.prepare(nthreads.max(0) as usize, &program, descriptor_set, groups);
}

/// Run thread `thread_idx`'s share of the dispatch prepared in `ctx`.
///
/// # Safety
/// `ctx` must be prepared and not re-prepared while any thread runs it;
/// `thread` must not be used concurrently by another call.
#[no_mangle]
pub unsafe extern "C" fn kernrun_dispatch_thread(
    ctx: *const DispatchContext,
    thread_idx: c_int,
    thread: *mut ThreadContext,
) {
    let Some(ctx) = ctx.as_ref() else {
        log::error!("kernrun_dispatch_thread: null context");
        return;
    };
    let Some(thread) = thread.as_mut() else {
        log::error!("kernrun_dispatch_thread: null thread context");
        return;
    };
    if thread_idx < 0 {
        log::error!("kernrun_dispatch_thread: negative thread index {}", thread_idx);
        return;
    }
    ctx.dispatch_thread(thread_idx as usize, thread);
}
