//! TUN framing shim scenarios over a stream socketpair, which supports the
//! same readv/writev shapes as the tun character device.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;

use ringtun::{Error, PI_HEADER_LEN, TunDevice};

fn socket_pair() -> (File, File) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
}

fn shim() -> Option<(TunDevice, File)> {
    ringtun::set_enabled(true);
    let (ours, theirs) = socket_pair();
    match TunDevice::new(ours) {
        Ok(tun) => Some((tun, theirs)),
        Err(Error::Unsupported(_)) | Err(Error::Setup(_)) => None,
        Err(e) => panic!("unexpected construction error: {e}"),
    }
}

#[test]
fn write_prefixes_ipv4_header() {
    let Some((tun, mut peer)) = shim() else {
        return;
    };
    // A minimal IPv4-looking packet: version nibble 4.
    let packet = [0x45u8, 0x00, 0x00, 0x14, 0xde, 0xad, 0xbe, 0xef];
    let mut buf = vec![0u8; PI_HEADER_LEN + packet.len()];
    buf[PI_HEADER_LEN..].copy_from_slice(&packet);

    let written = tun.write(&mut buf, PI_HEADER_LEN).unwrap();
    assert_eq!(written, PI_HEADER_LEN + packet.len());

    let mut wire = vec![0u8; written];
    peer.read_exact(&mut wire).unwrap();
    assert_eq!(&wire[..4], &[0x00, 0x00, 0x08, 0x00]);
    assert_eq!(&wire[4..], &packet);
    tun.close();
}

#[test]
fn write_prefixes_ipv6_header() {
    let Some((tun, mut peer)) = shim() else {
        return;
    };
    let packet = [0x60u8, 0x00, 0x00, 0x00, 0x00, 0x08, 0x3a, 0x40];
    let mut buf = vec![0u8; PI_HEADER_LEN + packet.len()];
    buf[PI_HEADER_LEN..].copy_from_slice(&packet);

    let written = tun.write(&mut buf, PI_HEADER_LEN).unwrap();
    let mut wire = vec![0u8; written];
    peer.read_exact(&mut wire).unwrap();
    assert_eq!(&wire[..4], &[0x00, 0x00, 0x86, 0xdd]);
    assert_eq!(&wire[4..], &packet);
    tun.close();
}

#[test]
fn read_strips_header() {
    let Some((tun, mut peer)) = shim() else {
        return;
    };
    let packet = [0x45u8, 0x00, 0x11, 0x22, 0x33];
    let mut framed = vec![0x00, 0x00, 0x08, 0x00];
    framed.extend_from_slice(&packet);
    peer.write_all(&framed).unwrap();

    let mut buf = vec![0u8; 64];
    let n = tun.read(&mut buf, PI_HEADER_LEN).unwrap();
    assert_eq!(n, packet.len());
    assert_eq!(&buf[PI_HEADER_LEN..PI_HEADER_LEN + n], &packet);
    tun.close();
}

#[test]
fn short_transfer_clamps_to_zero() {
    let Some((tun, mut peer)) = shim() else {
        return;
    };
    // Fewer bytes than a PI header.
    peer.write_all(&[0x00, 0x00]).unwrap();
    let mut buf = vec![0u8; 64];
    let n = tun.read(&mut buf, PI_HEADER_LEN).unwrap();
    assert_eq!(n, 0);
    tun.close();
}

#[test]
fn wrapper_errors_surface_before_reads() {
    ringtun::set_enabled(true);
    let (ours, mut peer) = socket_pair();
    let (tx, rx) = crossbeam_channel::unbounded();
    let tun = match TunDevice::with_error_channel(ours, rx) {
        Ok(tun) => tun,
        Err(Error::Unsupported(_)) | Err(Error::Setup(_)) => return,
        Err(e) => panic!("unexpected construction error: {e}"),
    };
    assert!(tun.errors().is_some());

    tx.send(std::io::Error::other("link down")).unwrap();
    let mut buf = vec![0u8; 64];
    match tun.read(&mut buf, PI_HEADER_LEN) {
        Err(Error::Syscall(e)) => assert_eq!(e.to_string(), "link down"),
        other => panic!("expected the wrapper error, got {other:?}"),
    }

    // Channel drained; reads work again.
    peer.write_all(&[0x00, 0x00, 0x08, 0x00, 0x45]).unwrap();
    assert_eq!(tun.read(&mut buf, PI_HEADER_LEN).unwrap(), 1);
    tun.close();
}

#[test]
fn backing_file_accessor() {
    let Some((tun, _peer)) = shim() else {
        return;
    };
    assert!(tun.file().is_some());
    tun.close();
    assert!(tun.file().is_none());
}
