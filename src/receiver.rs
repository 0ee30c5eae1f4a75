//! UDP receiver for the VBAN listen socket.
//!
//! Every datagram is read with `recvmsg` so the kernel can attach two
//! control records: `SCM_TIMESTAMPNS` (nanosecond receive timestamp,
//! captured before any userspace scheduling jitter) and `IP_PKTINFO`
//! (arrival interface index, part of the stream identity). The socket
//! carries a 700 ms read timeout; an expired read means every sender went
//! silent and the caller flushes the connection.

use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info};

use crate::vban;

/// Receive timeout; also the stream liveness window.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(700);

/// Largest datagram we accept: header plus the maximum payload.
const PKT_CAP: usize = vban::HEADER_SIZE + vban::MAX_DATA_SIZE;

/// Control buffer: cmsghdr + timespec and cmsghdr + in_pktinfo, padded.
const CMSG_CAP: usize = 1024;

/// One received datagram with its kernel-attached metadata.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Raw bytes, header included.
    pub payload: Bytes,
    pub peer: SocketAddr,
    /// Kernel receive timestamp, nanoseconds (CLOCK_REALTIME).
    pub arrival_ns: u64,
    /// Index of the interface the packet arrived on.
    pub ifindex: u32,
}

pub struct VbanReceiver {
    socket: Socket,
}

impl VbanReceiver {
    /// Bind `0.0.0.0:<port>` and enable timestamp + pktinfo delivery.
    /// Every failure here is fatal for the process.
    pub fn bind(port: u16) -> anyhow::Result<VbanReceiver> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("vban socket")?;
        socket.set_reuse_address(true).context("setsockopt SO_REUSEADDR")?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&addr.into()).with_context(|| format!("bind {addr}"))?;

        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .context("setsockopt SO_RCVTIMEO")?;

        let fd = socket.as_raw_fd();
        // SO_TIMESTAMPNS: receive timestamps via SCM_TIMESTAMPNS cmsg.
        set_sockopt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS)
            .context("setsockopt SO_TIMESTAMPNS")?;
        // IP_PKTINFO: arrival interface index via cmsg.
        set_sockopt(fd, libc::IPPROTO_IP, libc::IP_PKTINFO)
            .context("setsockopt IP_PKTINFO")?;

        info!(port, "vban listener bound");
        Ok(VbanReceiver { socket })
    }

    /// Read the next datagram.
    ///
    /// `Ok(None)` on receive timeout (all senders silent); `Err` only on
    /// unrecoverable socket errors. Datagrams with missing ancillary
    /// records or an unsupported peer address family are logged and
    /// skipped.
    pub fn recv(&mut self) -> io::Result<Option<Datagram>> {
        let mut buf = [0u8; PKT_CAP];
        let mut cmsg_buf = [0u8; CMSG_CAP];
        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        loop {
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: PKT_CAP,
            };
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_name = &mut addr as *mut _ as *mut libc::c_void;
            msg.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = CMSG_CAP;

            let size = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, 0) };
            if size < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => return Ok(None),
                    _ => return Err(err),
                }
            }

            let (arrival_ns, ifindex) = match parse_cmsgs(&msg) {
                Ok(meta) => meta,
                Err(missing) => {
                    error!("missing {missing} record in recvmsg ancillary data");
                    continue;
                }
            };

            let Some(peer) = sockaddr_to_std(&addr) else {
                debug!("datagram from unsupported address family, dropped");
                continue;
            };

            return Ok(Some(Datagram {
                payload: Bytes::copy_from_slice(&buf[..size as usize]),
                peer,
                arrival_ns,
                ifindex,
            }));
        }
    }
}

fn set_sockopt(fd: libc::c_int, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Walk the control records for the receive timestamp and the arrival
/// interface index. Returns the name of the first missing record.
fn parse_cmsgs(msg: &libc::msghdr) -> Result<(u64, u32), &'static str> {
    let mut arrival_ns = None;
    let mut ifindex = None;

    // SAFETY: msg_control points at our stack buffer; the CMSG_* macros
    // walk it bounded by msg_controllen as filled in by the kernel.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let c = &*cmsg;
            if c.cmsg_level == libc::SOL_SOCKET && c.cmsg_type == libc::SCM_TIMESTAMPNS {
                let ts: libc::timespec =
                    ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::timespec);
                arrival_ns = Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64);
            }
            if c.cmsg_level == libc::IPPROTO_IP && c.cmsg_type == libc::IP_PKTINFO {
                let info: libc::in_pktinfo =
                    ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                ifindex = Some(info.ipi_ifindex as u32);
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }

    match (arrival_ns, ifindex) {
        (Some(ts), Some(idx)) => Ok((ts, idx)),
        (None, _) => Err("SCM_TIMESTAMPNS"),
        (_, None) => Err("IP_PKTINFO"),
    }
}

/// Convert a kernel sockaddr to a std `SocketAddr`. IPv6 addresses keep
/// flowinfo and scope id so session identity compares them. Families other
/// than INET/INET6 yield `None`.
fn sockaddr_to_std(addr: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match addr.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: family checked; sockaddr_in fits in sockaddr_storage.
            let sin: &libc::sockaddr_in = unsafe { &*(addr as *const _ as *const _) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: family checked; sockaddr_in6 fits in sockaddr_storage.
            let sin6: &libc::sockaddr_in6 = unsafe { &*(addr as *const _ as *const _) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Resolve an interface index to its name for logs and the stats JSON.
pub fn interface_name(ifindex: u32) -> String {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let rc = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr() as *mut libc::c_char) };
    if rc.is_null() {
        return format!("if{ifindex}");
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_storage(ip: [u8; 4], port: u16) -> libc::sockaddr_storage {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
        unsafe {
            (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
            (*sin).sin_port = port.to_be();
            (*sin).sin_addr.s_addr = u32::from_be_bytes(ip).to_be();
        }
        storage
    }

    #[test]
    fn test_sockaddr_v4_conversion() {
        let storage = v4_storage([192, 168, 1, 20], 6980);
        let addr = sockaddr_to_std(&storage).unwrap();
        assert_eq!(addr.to_string(), "192.168.1.20:6980");
    }

    #[test]
    fn test_sockaddr_v6_keeps_scope_and_flowinfo() {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
        unsafe {
            (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
            (*sin6).sin6_port = 6980u16.to_be();
            (*sin6).sin6_flowinfo = 0x1234;
            (*sin6).sin6_scope_id = 3;
            (*sin6).sin6_addr.s6_addr = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        }
        match sockaddr_to_std(&storage).unwrap() {
            SocketAddr::V6(v6) => {
                assert_eq!(*v6.ip(), Ipv6Addr::LOCALHOST);
                assert_eq!(v6.port(), 6980);
                assert_eq!(v6.flowinfo(), 0x1234);
                assert_eq!(v6.scope_id(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_family_rejected() {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        assert!(sockaddr_to_std(&storage).is_none());
    }

    #[test]
    fn test_interface_name_fallback() {
        // index 0 is never a valid interface
        assert_eq!(interface_name(0), "if0");
    }
}
