//! Private IP allocation over the enclave's CIDR block.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IpAllocatorError {
    #[error("'{0}' is not a valid IPv4 CIDR block")]
    InvalidCidr(String),

    #[error("no free IP addresses remain in {cidr}")]
    Exhausted { cidr: String },
}

struct AllocatorState {
    taken: BTreeSet<u32>,
}

/// Hands out and reclaims private IPs from one enclave's CIDR.
///
/// Thread-safe without external locking; the network and broadcast
/// addresses are never handed out.
pub struct IpAllocator {
    network: u32,
    prefix_len: u8,
    state: Mutex<AllocatorState>,
}

impl IpAllocator {
    /// Parse a CIDR like `10.1.0.0/16`. Prefix lengths 8–30 are accepted;
    /// host bits in the address are masked off.
    pub fn new(cidr: &str) -> Result<Self, IpAllocatorError> {
        let invalid = || IpAllocatorError::InvalidCidr(cidr.to_string());
        let (addr_part, len_part) = cidr.split_once('/').ok_or_else(invalid)?;
        let addr = Ipv4Addr::from_str(addr_part).map_err(|_| invalid())?;
        let prefix_len: u8 = len_part.parse().map_err(|_| invalid())?;
        if !(8..=30).contains(&prefix_len) {
            return Err(invalid());
        }
        let mask = u32::MAX << (32 - prefix_len);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix_len,
            state: Mutex::new(AllocatorState {
                taken: BTreeSet::new(),
            }),
        })
    }

    /// The CIDR this allocator draws from.
    pub fn cidr(&self) -> String {
        format!("{}/{}", Ipv4Addr::from(self.network), self.prefix_len)
    }

    fn broadcast(&self) -> u32 {
        self.network | (u32::MAX >> self.prefix_len)
    }

    fn in_host_range(&self, raw: u32) -> bool {
        raw > self.network && raw < self.broadcast()
    }

    /// Hand out the lowest free host address.
    pub fn acquire(&self) -> Result<Ipv4Addr, IpAllocatorError> {
        let mut state = self.state.lock().expect("ip allocator lock");
        for raw in (self.network + 1)..self.broadcast() {
            if state.taken.insert(raw) {
                let ip = Ipv4Addr::from(raw);
                debug!(%ip, "allocated private ip");
                return Ok(ip);
            }
        }
        Err(IpAllocatorError::Exhausted { cidr: self.cidr() })
    }

    /// Return `ip` to the free pool. Idempotent; returns whether it was
    /// actually held.
    pub fn release(&self, ip: Ipv4Addr) -> bool {
        let mut state = self.state.lock().expect("ip allocator lock");
        state.taken.remove(&u32::from(ip))
    }

    /// Mark an externally-assigned address as held (used when rebuilding
    /// state from the backend's view). Returns false if the address is
    /// outside the CIDR's host range or already held.
    pub fn reserve(&self, ip: Ipv4Addr) -> bool {
        let raw = u32::from(ip);
        if !self.in_host_range(raw) {
            return false;
        }
        let mut state = self.state.lock().expect("ip allocator lock");
        state.taken.insert(raw)
    }

    /// Whether `ip` is currently held.
    pub fn is_held(&self, ip: Ipv4Addr) -> bool {
        let state = self.state.lock().expect("ip allocator lock");
        state.taken.contains(&u32::from(ip))
    }

    /// Number of addresses currently held.
    pub fn held_count(&self) -> usize {
        let state = self.state.lock().expect("ip allocator lock");
        state.taken.len()
    }
}
