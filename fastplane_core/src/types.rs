//! Plain data types shared by the tables and modules

use std::fmt;
use std::str::FromStr;

/// NUMA socket (memory/CPU locality domain).
pub type SocketId = u32;
/// Classification group produced by the network/transport matchers.
pub type GroupId = u32;
pub type InterfaceId = u16;

/// Marker for types whose all-zero bit pattern is a valid value.
///
/// Arena pages come back zero-filled, so tables of `Zeroable` slots need no
/// per-element construction.
///
/// # Safety
/// Implementors must be plain data: every field valid when zeroed, no
/// pointers, no drop glue.
pub unsafe trait Zeroable: Copy + Send + Sync + 'static {}

unsafe impl Zeroable for u8 {}
unsafe impl Zeroable for u16 {}
unsafe impl Zeroable for u32 {}
unsafe impl Zeroable for u64 {}
unsafe impl Zeroable for u128 {}
unsafe impl<T: Zeroable, const N: usize> Zeroable for [T; N] {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C)]
pub struct MacAddress {
    bytes: [u8; 6],
}

unsafe impl Zeroable for MacAddress {}

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.bytes
    }

    pub fn is_zero(&self) -> bool {
        self.bytes == [0; 6]
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("Invalid MAC address format: {}", s));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| format!("Invalid hex in MAC: {}", part))?;
        }
        Ok(Self { bytes })
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// One row of the limits report: `(name, socket, current, maximum)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitItem {
    pub name: String,
    pub socket_id: Option<SocketId>,
    pub current: u64,
    pub maximum: u64,
}

impl LimitItem {
    pub fn new(name: impl Into<String>, socket_id: Option<SocketId>, current: u64, maximum: u64) -> Self {
        Self {
            name: name.into(),
            socket_id,
            current,
            maximum,
        }
    }
}

pub type Limits = Vec<LimitItem>;
