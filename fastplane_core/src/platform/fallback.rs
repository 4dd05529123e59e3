//! Portable fallback: heap pages, no NUMA binding

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::constants::PAGE_SIZE;

pub fn map_anonymous(len: usize, _populate: bool) -> Result<NonNull<u8>, String> {
    let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|e| e.to_string())?;
    NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| format!("alloc of {len} bytes failed"))
}

/// # Safety
/// `ptr`/`len` must come from a single `map_anonymous` call.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    if let Ok(layout) = Layout::from_size_align(len, PAGE_SIZE) {
        dealloc(ptr.as_ptr(), layout);
    }
}

pub fn bind_to_node(_ptr: NonNull<u8>, _len: usize, node: u32) -> Result<(), String> {
    Err(format!("numa binding to node {node} is not supported on this platform"))
}
