use crate::{
    acl::AclFields,
    dataplane::Dataplane,
    errors::{map_error, set_last_error, ErrorCode},
    handle_registry::{register_handle, unregister_handle, with_handle, HandleId},
    types::MacAddress,
};
use std::{
    ffi::CStr,
    net::{IpAddr, Ipv4Addr},
    os::raw::c_char,
};

/// Classification result returned by `fastplane_acl_classify_v4`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FastplaneAclResult {
    pub network_source: u32,
    pub network_destination: u32,
    pub transport_id: u32,
    pub value_index: u32,
    pub action: u32,
    pub counter_id: u32,
}

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::InvalidArgument);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

#[inline]
fn parse_ip(p: *const c_char) -> Result<IpAddr, ErrorCode> {
    cstr(p)?.parse().map_err(|_| ErrorCode::InvalidArgument)
}

#[inline]
fn parse_mac(p: *const c_char) -> Result<MacAddress, ErrorCode> {
    cstr(p)?.parse().map_err(|_| ErrorCode::InvalidArgument)
}

/// Record `code` as the thread's last error and hand it back.
#[inline]
fn finish(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return finish(e),
        }
    };
}

/// Run a fallible dataplane call and fold both error layers into one code.
fn call<F>(h: HandleId, f: F) -> ErrorCode
where
    F: FnOnce(&Dataplane) -> crate::errors::Result<()>,
{
    match with_handle(h, f) {
        Ok(Ok(())) => finish(ErrorCode::Success),
        Ok(Err(e)) => finish(map_error(&e)),
        Err(code) => finish(code),
    }
}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Open a dataplane configured from `FASTPLANE_*` environment variables.
/// Stores the handle in `*out` on success.
#[no_mangle]
pub extern "C" fn fastplane_open(out: *mut HandleId) -> ErrorCode {
    if out.is_null() {
        return finish(ErrorCode::InvalidArgument);
    }
    match Dataplane::from_env() {
        Ok(dp) => {
            unsafe { *out = register_handle(dp) };
            finish(ErrorCode::Success)
        }
        Err(e) => finish(map_error(&e)),
    }
}

#[no_mangle]
pub extern "C" fn fastplane_close(h: HandleId) -> ErrorCode {
    try_c!(unregister_handle(h));
    finish(ErrorCode::Success)
}

// ───────────────────────── fast path ─────────────────────────────────── //

/// Classify an IPv4 packet. Addresses are in host byte order.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn fastplane_acl_classify_v4(
    h: HandleId,
    socket_id: u32,
    acl_id: u32,
    source: u32,
    destination: u32,
    protocol: u8,
    source_port: u16,
    destination_port: u16,
    out: *mut FastplaneAclResult,
) -> ErrorCode {
    if out.is_null() {
        return finish(ErrorCode::InvalidArgument);
    }
    let fields = AclFields {
        source: IpAddr::V4(Ipv4Addr::from(source)),
        destination: IpAddr::V4(Ipv4Addr::from(destination)),
        protocol,
        source_port,
        destination_port,
    };
    let found = try_c!(with_handle(h, |dp| dp.acl().classify(socket_id, acl_id, &fields)));
    let c = try_c!(found.ok_or(ErrorCode::InvalidArgument));
    unsafe {
        *out = FastplaneAclResult {
            network_source: c.network_source,
            network_destination: c.network_destination,
            transport_id: c.transport_id,
            value_index: c.value_index,
            action: c.value.action as u32,
            counter_id: c.value.counter_id,
        };
    }
    finish(ErrorCode::Success)
}

/// Look up a neighbor MAC; writes 6 bytes to `mac_out`. A miss returns
/// `NotFound` and queues the address for resolution.
#[no_mangle]
pub extern "C" fn fastplane_neighbor_lookup(
    h: HandleId,
    socket_id: u32,
    interface_id: u16,
    addr_utf8: *const c_char,
    mac_out: *mut u8,
) -> ErrorCode {
    if mac_out.is_null() {
        return finish(ErrorCode::InvalidArgument);
    }
    let addr = try_c!(parse_ip(addr_utf8));
    let found = try_c!(with_handle(h, |dp| dp.neighbor().lookup(socket_id, interface_id, addr)));
    let mac = try_c!(found.ok_or(ErrorCode::NotFound));
    unsafe { std::ptr::copy_nonoverlapping(mac.as_bytes().as_ptr(), mac_out, 6) };
    finish(ErrorCode::Success)
}

// ───────────────────────── control plane ─────────────────────────────── //

#[no_mangle]
pub extern "C" fn fastplane_neighbor_insert(
    h: HandleId,
    route_utf8: *const c_char,
    interface_utf8: *const c_char,
    addr_utf8: *const c_char,
    mac_utf8: *const c_char,
) -> ErrorCode {
    let route = try_c!(cstr(route_utf8));
    let iface = try_c!(cstr(interface_utf8));
    let addr = try_c!(parse_ip(addr_utf8));
    let mac = try_c!(parse_mac(mac_utf8));
    call(h, |dp| dp.neighbor().insert(route, iface, addr, mac))
}

#[no_mangle]
pub extern "C" fn fastplane_neighbor_remove(
    h: HandleId,
    route_utf8: *const c_char,
    interface_utf8: *const c_char,
    addr_utf8: *const c_char,
) -> ErrorCode {
    let route = try_c!(cstr(route_utf8));
    let iface = try_c!(cstr(interface_utf8));
    let addr = try_c!(parse_ip(addr_utf8));
    call(h, |dp| dp.neighbor().remove(route, iface, addr))
}

#[no_mangle]
pub extern "C" fn fastplane_neighbor_clear(h: HandleId) -> ErrorCode {
    call(h, |dp| dp.neighbor().clear())
}

/// Link-layer monitor entry point.
#[no_mangle]
pub extern "C" fn fastplane_link_layer_update(
    h: HandleId,
    interface_utf8: *const c_char,
    addr_utf8: *const c_char,
    mac_utf8: *const c_char,
) -> ErrorCode {
    let iface = try_c!(cstr(interface_utf8));
    let addr = try_c!(parse_ip(addr_utf8));
    let mac = try_c!(parse_mac(mac_utf8));
    call(h, |dp| {
        dp.neighbor().on_link_layer_update(iface, addr, mac);
        Ok(())
    })
}
