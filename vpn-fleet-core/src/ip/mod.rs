use std::net::Ipv4Addr;

use ipnet::{Ipv4AddrRange, Ipv4Net};

pub mod allocations;

pub trait Contains<T> {
    fn contains(&self, other: &T) -> bool;
}

impl Contains<Ipv4Addr> for Ipv4Net {
    fn contains(&self, other: &Ipv4Addr) -> bool {
        Ipv4Net::contains(self, other)
    }
}

/// Usable host addresses of a network, in ascending order.
pub trait Hosts<T> {
    type Iter: Iterator<Item = T>;

    fn host_addresses(&self) -> Self::Iter;
}

impl Hosts<Ipv4Addr> for Ipv4Net {
    type Iter = Ipv4AddrRange;

    fn host_addresses(&self) -> Self::Iter {
        self.hosts()
    }
}
