//! Helper functions shared by the table builders

use crate::constants::{FNV_OFFSET, FNV_PRIME};
use std::hash::{BuildHasher, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// FNV-1a over whatever `Hash` feeds it.
#[derive(Debug, Clone, Copy)]
pub struct FnvHasher(u64);

impl Default for FnvHasher {
    fn default() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Hasher for FnvHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    #[inline]
    fn finish(&self) -> u64 {
        // fold so the masked low bits see the whole state
        self.0 ^ (self.0 >> 32)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FnvBuildHasher;

impl BuildHasher for FnvBuildHasher {
    type Hasher = FnvHasher;

    fn build_hasher(&self) -> FnvHasher {
        FnvHasher::default()
    }
}

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Smallest power of two that is `>= n` (and at least 1).
#[inline]
pub fn pow2_at_least(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

#[inline]
pub fn v4_to_u32(addr: Ipv4Addr) -> u32 {
    u32::from_be_bytes(addr.octets())
}

#[inline]
pub fn v6_to_u128(addr: Ipv6Addr) -> u128 {
    u128::from(addr)
}

/// Widen any address into 16 bytes; IPv4 lands in the low four.
#[inline]
pub fn ip_to_bytes(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => {
            let mut out = [0u8; 16];
            out[12..].copy_from_slice(&v4.octets());
            out
        }
        IpAddr::V6(v6) => v6.octets(),
    }
}

#[inline]
pub fn bytes_to_ip(bytes: [u8; 16], is_ipv6: bool) -> IpAddr {
    if is_ipv6 {
        IpAddr::V6(Ipv6Addr::from(bytes))
    } else {
        IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_bytes_round_trip_keeps_family() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(bytes_to_ip(ip_to_bytes(v4), false), v4);
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(bytes_to_ip(ip_to_bytes(v6), true), v6);
    }

    #[test]
    fn pow2_rounding() {
        assert_eq!(pow2_at_least(0), 1);
        assert_eq!(pow2_at_least(512), 512);
        assert_eq!(pow2_at_least(513), 1024);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn fnv_differs_on_input() {
        let h = |s: &str| {
            let mut h = FnvHasher::default();
            h.write(s.as_bytes());
            h.finish()
        };
        assert_ne!(h("acl.transport.ht"), h("acl.total.ht"));
    }
}
