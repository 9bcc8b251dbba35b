use std::{collections::HashMap, fmt::Display, net::Ipv4Addr};

use ipnet::Ipv4Net;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::helpers::Invert;

use super::{Contains, Hosts};

/// Number of leading host addresses that are never handed out to peers
/// (the server address and the gateway reservation).
pub const RESERVED_LEADING_HOSTS: usize = 2;

pub type Ipv4Allocations = Allocations<Ipv4Addr, Ipv4Net>;

#[derive(Debug)]
pub struct Allocations<IP, IPNet> {
    range: IPNet,
    /// peer name -> address
    allocations: HashMap<String, IP>,
    /// addresses that are never allocatable, sorted
    reservations: Vec<IP>,
    /// a _sorted_ list of every address taken, reservations included
    taken: Vec<IP>,
}

impl<IP, IPNet> Allocations<IP, IPNet>
where
    IP: Copy + Ord + Display,
    IPNet: Contains<IP> + Hosts<IP>,
{
    pub fn new(range: IPNet, reservations: impl IntoIterator<Item = IP>) -> Self {
        let mut reservations = reservations
            .into_iter()
            .filter(|ip| range.contains(ip))
            .collect::<Vec<_>>();

        reservations.sort_unstable();
        reservations.dedup();

        Self {
            range,
            allocations: HashMap::new(),
            taken: reservations.clone(),
            reservations,
        }
    }

    /// Reserves the first [`RESERVED_LEADING_HOSTS`] host addresses of the range
    /// along with any extra addresses (e.g. a server address placed elsewhere in the range).
    pub fn with_leading_reservations(range: IPNet, extra: impl IntoIterator<Item = IP>) -> Self {
        let leading = range
            .host_addresses()
            .take(RESERVED_LEADING_HOSTS)
            .collect::<Vec<_>>();

        Self::new(range, leading.into_iter().chain(extra))
    }

    pub fn try_insert(&mut self, owner: &str, ip: IP) -> Result<IP, AllocationsError<IP>> {
        if self.allocations.contains_key(owner) {
            return Err(AllocationsError::OwnerConflict(owner.to_owned()));
        }

        if !self.is_in_range(&ip) {
            return Err(AllocationsError::IpOutOfRange(ip));
        }

        if self.reservations.binary_search(&ip).is_ok() {
            return Err(AllocationsError::IpReserved(ip));
        }

        let index = self
            .taken
            .binary_search(&ip)
            .invert()
            .map_err(|_| AllocationsError::IpConflict(ip))?;

        self.taken.insert(index, ip);
        self.allocations.insert(owner.to_owned(), ip);

        Ok(ip)
    }

    pub fn try_allocate(&mut self, owner: &str) -> Result<IP, AllocationsError<IP>> {
        if self.allocations.contains_key(owner) {
            return Err(AllocationsError::OwnerConflict(owner.to_owned()));
        }

        let ip = self
            .try_get_next_allocatable_ip()
            .ok_or(AllocationsError::RangeExhausted)?;
        let index = self.taken.binary_search(&ip).unwrap_err();

        self.taken.insert(index, ip);
        self.allocations.insert(owner.to_owned(), ip);

        info!("Allocated {ip} address for '{owner}'!");

        Ok(ip)
    }

    /// Releasing an address that isn't allocated is a no-op.
    pub fn release(&mut self, ip: &IP) -> bool {
        if self.reservations.binary_search(ip).is_ok() {
            return false;
        }

        match self.taken.binary_search(ip) {
            Ok(index) => {
                self.taken.remove(index);
                self.allocations.retain(|_, allocated| allocated != ip);

                info!("Released {ip} address!");

                true
            }
            Err(_) => false,
        }
    }

    pub fn try_get_next_allocatable_ip(&self) -> Option<IP> {
        let mut taken = self.taken.iter().peekable();

        // linear in the range size, good enough for the pool sizes a single server handles
        for candidate in self.range.host_addresses() {
            while taken.next_if(|ip| **ip < candidate).is_some() {}

            if taken.peek() == Some(&&candidate) {
                continue;
            }

            return Some(candidate);
        }

        None
    }

    pub fn get(&self, owner: &str) -> Option<IP> {
        self.allocations.get(owner).copied()
    }

    pub fn is_in_range(&self, ip: &IP) -> bool {
        self.range.contains(ip)
    }

    /// Allocated addresses, sorted, reservations excluded.
    pub fn in_use(&self) -> Vec<IP> {
        let mut in_use = self.allocations.values().copied().collect::<Vec<_>>();

        in_use.sort_unstable();
        in_use
    }

    pub fn range(&self) -> &IPNet {
        &self.range
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationsError<IP: Display> {
    #[error("'{}' already holds an address in this pool!", .0)]
    OwnerConflict(String),
    #[error("Address {} is already allocated!", .0)]
    IpConflict(IP),
    #[error("Address {} is reserved!", .0)]
    IpReserved(IP),
    #[error("The address pool for this server was exhausted!")]
    RangeExhausted,
    #[error("Address {} is out of range!", .0)]
    IpOutOfRange(IP),
}

/// A single server's address pool, serialized behind a mutex.
#[derive(Debug)]
pub struct AddressAllocator(Mutex<Ipv4Allocations>);

impl AddressAllocator {
    pub fn new(range: Ipv4Net, server_address: Ipv4Addr) -> Self {
        Self(Mutex::new(Ipv4Allocations::with_leading_reservations(
            range.trunc(),
            [server_address],
        )))
    }

    /// Rebuilds the in-use view from existing records. Records that can't be inserted
    /// (duplicate address, out of range, reserved) are returned so the caller can deal with them.
    pub fn from_records<'a>(
        range: Ipv4Net,
        server_address: Ipv4Addr,
        records: impl IntoIterator<Item = (&'a str, Ipv4Addr)>,
    ) -> (Self, Vec<(&'a str, AllocationsError<Ipv4Addr>)>) {
        let mut allocations =
            Ipv4Allocations::with_leading_reservations(range.trunc(), [server_address]);
        let mut troublemakers = Vec::new();

        for (owner, address) in records {
            if let Err(error) = allocations.try_insert(owner, address) {
                warn!("Couldn't restore {address} allocation for '{owner}'! {error}");
                troublemakers.push((owner, error));
            }
        }

        (Self(Mutex::new(allocations)), troublemakers)
    }

    pub async fn allocate(&self, owner: &str) -> Result<Ipv4Addr, AllocationsError<Ipv4Addr>> {
        self.0.lock().await.try_allocate(owner)
    }

    pub async fn release(&self, address: &Ipv4Addr) -> bool {
        self.0.lock().await.release(address)
    }

    pub async fn get(&self, owner: &str) -> Option<Ipv4Addr> {
        self.0.lock().await.get(owner)
    }

    pub async fn in_use(&self) -> Vec<Ipv4Addr> {
        self.0.lock().await.in_use()
    }

    pub async fn range(&self) -> Ipv4Net {
        *self.0.lock().await.range()
    }
}
