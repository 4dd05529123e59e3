//! Neighbor resolution attempts
//!
//! A resolution attempt only has to make the kernel resolve the address;
//! the resulting mapping comes back through the link-layer monitor callback.

use crate::errors::{Error, Result};
use std::net::IpAddr;

pub trait Resolver: Send + Sync {
    /// Trigger resolution of `address` on `interface_name`.
    fn resolve(&self, interface_name: &str, address: IpAddr) -> Result<()>;
}

/// Sends one ICMP / ICMPv6 echo request bound to the interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingResolver;

impl Resolver for PingResolver {
    fn resolve(&self, interface_name: &str, address: IpAddr) -> Result<()> {
        imp::send_echo(interface_name, address)
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::mem::{size_of, zeroed};

    struct Fd(libc::c_int);

    impl Drop for Fd {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }

    fn os_error(ctx: &str, interface_name: &str, address: IpAddr) -> Error {
        Error::Resolve(format!("{ctx} for {address} on {interface_name}: {}", errno::errno()))
    }

    pub fn send_echo(interface_name: &str, address: IpAddr) -> Result<()> {
        let (domain, proto, echo_type) = match address {
            IpAddr::V4(_) => (libc::AF_INET, libc::IPPROTO_ICMP, 8u8),
            IpAddr::V6(_) => (libc::AF_INET6, libc::IPPROTO_ICMPV6, 128u8),
        };
        let raw = unsafe { libc::socket(domain, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, proto) };
        if raw < 0 {
            return Err(os_error("socket", interface_name, address));
        }
        let fd = Fd(raw);

        let ifname = interface_name.as_bytes();
        let rc = unsafe {
            libc::setsockopt(
                fd.0,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                ifname.as_ptr() as *const libc::c_void,
                ifname.len() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(os_error("SO_BINDTODEVICE", interface_name, address));
        }

        // identifier and checksum are filled in by the kernel on ping sockets
        let packet: [u8; 8] = [echo_type, 0, 0, 0, 0, 0, 0, 1];

        let sent = match address {
            IpAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = unsafe { zeroed() };
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
                unsafe {
                    libc::sendto(
                        fd.0,
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                        0,
                        &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                        size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            IpAddr::V6(v6) => {
                let mut sa: libc::sockaddr_in6 = unsafe { zeroed() };
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_addr.s6_addr = v6.octets();
                unsafe {
                    libc::sendto(
                        fd.0,
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                        0,
                        &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                        size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
            }
        };
        if sent < 0 {
            return Err(os_error("sendto", interface_name, address));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn send_echo(interface_name: &str, address: IpAddr) -> Result<()> {
        Err(Error::Resolve(format!(
            "echo probes are not supported on this platform ({address} on {interface_name})"
        )))
    }
}
