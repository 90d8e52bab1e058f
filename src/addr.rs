//! Bit-exact conversion between `SocketAddr` and the kernel sockaddr
//! layouts embedded in each slot.
//!
//! Layouts per the ABI: `sockaddr_in` is family(2) + port(2, network order) +
//! address(4, network order) + 8 pad bytes; `sockaddr_in6` is family(2) +
//! port(2, network order) + flowinfo(4) + address(16) + scope id(4).

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Serialize a peer address into a slot's inline sockaddr record.
///
/// Returns the number of meaningful bytes, suitable for `msg_namelen`.
pub(crate) fn encode(storage: *mut libc::sockaddr_storage, addr: &SocketAddr) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is sized and aligned for any family.
            let sa = unsafe { &mut *storage.cast::<libc::sockaddr_in>() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            sa.sin_zero = [0; 8];
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            // SAFETY: as above.
            let sa = unsafe { &mut *storage.cast::<libc::sockaddr_in6>() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_flowinfo = v6.flowinfo().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Decode the peer address a completed recvmsg left in the slot's sockaddr
/// record.
pub(crate) fn decode(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    // SAFETY: the kernel filled this record for the completed operation;
    // caller holds the slot.
    let family = unsafe { (*storage).ss_family } as libc::c_int;
    match family {
        libc::AF_INET => {
            // SAFETY: family says this is a sockaddr_in.
            let sa = unsafe { &*storage.cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            // SAFETY: family says this is a sockaddr_in6.
            let sa = unsafe { &*storage.cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                u32::from_be(sa.sin6_flowinfo),
                sa.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_storage() -> libc::sockaddr_storage {
        unsafe { mem::zeroed() }
    }

    #[test]
    fn round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let mut storage = zeroed_storage();
        let len = encode(&mut storage, &addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(decode(&storage).unwrap(), addr);
    }

    #[test]
    fn round_trip_v6() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        let mut storage = zeroed_storage();
        let len = encode(&mut storage, &addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in6>());
        assert_eq!(decode(&storage).unwrap(), addr);
    }

    #[test]
    fn v4_wire_layout() {
        // Port 4660 is 0x1234, so both port bytes are distinguishable.
        let addr: SocketAddr = "1.2.3.4:4660".parse().unwrap();
        let mut storage = zeroed_storage();
        encode(&mut storage, &addr);
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (&raw const storage).cast::<u8>(),
                mem::size_of::<libc::sockaddr_in>(),
            )
        };
        // family is host-endian u16; port and address are network order.
        assert_eq!(
            u16::from_ne_bytes([bytes[0], bytes[1]]),
            libc::AF_INET as u16
        );
        assert_eq!(&bytes[2..4], &[0x12, 0x34]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..16], &[0u8; 8]);
    }

    #[test]
    fn v6_wire_layout() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let mut storage = zeroed_storage();
        encode(&mut storage, &addr);
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (&raw const storage).cast::<u8>(),
                mem::size_of::<libc::sockaddr_in6>(),
            )
        };
        assert_eq!(
            u16::from_ne_bytes([bytes[0], bytes[1]]),
            libc::AF_INET6 as u16
        );
        assert_eq!(&bytes[2..4], &[0x01, 0xbb]);
        let mut expect = [0u8; 16];
        expect[0] = 0x20;
        expect[1] = 0x01;
        expect[2] = 0x0d;
        expect[3] = 0xb8;
        expect[15] = 0x01;
        assert_eq!(&bytes[8..24], &expect);
    }

    #[test]
    fn unknown_family_rejected() {
        let storage = zeroed_storage();
        assert!(decode(&storage).is_err());
    }
}
