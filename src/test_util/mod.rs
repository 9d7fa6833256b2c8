//! This module contains utilities that are useful for testing code based on the transport. They
//!  are used for testing the transport itself, but they are also exported for application testing
//!  so that end-to-end scenarios can run without real sockets.

pub mod memory_link;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// convenience method for test code: create a [SocketAddr] based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}
