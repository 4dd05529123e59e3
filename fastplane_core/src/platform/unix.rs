//! Unix-specific mapping and NUMA binding

use std::ptr::{self, NonNull};

fn last_os_error(ctx: &str) -> String {
    format!("{ctx}: {}", errno::errno())
}

/// Map `len` bytes of zero-filled anonymous memory.
pub fn map_anonymous(len: usize, populate: bool) -> Result<NonNull<u8>, String> {
    #[allow(unused_mut)]
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    #[cfg(target_os = "linux")]
    {
        flags |= if populate {
            libc::MAP_POPULATE
        } else {
            libc::MAP_NORESERVE
        };
    }
    #[cfg(not(target_os = "linux"))]
    let _ = populate;
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(last_os_error("mmap"));
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| "mmap returned null".to_string())
}

/// # Safety
/// `ptr`/`len` must come from a single `map_anonymous` call and must not be
/// used afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    let _ = libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
}

/// Bind a mapping to one NUMA node (`MPOL_BIND`).
#[cfg(target_os = "linux")]
pub fn bind_to_node(ptr: NonNull<u8>, len: usize, node: u32) -> Result<(), String> {
    const MPOL_BIND: libc::c_int = 2;
    let bits = std::mem::size_of::<libc::c_ulong>() * 8;
    let node = node as usize;
    let words = node / bits + 1;
    let mut mask = vec![0 as libc::c_ulong; words];
    mask[node / bits] |= (1 as libc::c_ulong) << (node % bits);
    // the kernel reads maxnode - 1 bits
    let maxnode = (words * bits + 1) as libc::c_ulong;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr.as_ptr() as *mut libc::c_void,
            len,
            MPOL_BIND,
            mask.as_ptr(),
            maxnode,
            0u32,
        )
    };
    if rc != 0 {
        return Err(last_os_error("mbind"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_to_node(_ptr: NonNull<u8>, _len: usize, node: u32) -> Result<(), String> {
    Err(format!("numa binding to node {node} is not supported on this platform"))
}
