//! Raw SocketCAN backend for Linux interfaces (`can0`, `vcan0`, …).
//!
//! Talks straight to the kernel through an `AF_CAN`/`CAN_RAW` socket and
//! is what the `VirtualCAN` device name resolves to. Receive timeouts map
//! to `SO_RCVTIMEO`, which keeps the reader's blocking loop bounded.

use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libc::{
    bind, c_int, c_short, c_uint, c_void, close, read, setsockopt, sockaddr, socket, timeval,
    write, SHUT_RDWR, SOCK_RAW, SOL_SOCKET, SO_RCVTIMEO,
};
use nix::net::if_::if_nametoindex;
use tracing::warn;

use crate::bus::BusAdapter;
use crate::{Error, Frame, FrameId, Result, CANFD_MAX_DLEN, CAN_MAX_DLEN};

const AF_CAN: c_int = 29;
const PF_CAN: c_int = 29;
const CAN_RAW: c_int = 1;
const SOL_CAN_RAW: c_int = 101;
const CAN_RAW_FD_FRAMES: c_int = 5;

/// Extended frame format flag in `can_id`.
pub const EFF_FLAG: u32 = 0x8000_0000;
const EFF_MASK: u32 = 0x1FFF_FFFF;

const CAN_MTU: usize = size_of::<CanFrameRaw>();
const CANFD_MTU: usize = size_of::<CanFdFrameRaw>();

#[repr(C)]
#[derive(Clone, Copy)]
struct CanAddr {
    _af_can: c_short,
    if_index: c_int,
    rx_id: u32,
    tx_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CanFrameRaw {
    can_id: u32,
    can_dlc: u8,
    _pad: u8,
    _res0: u8,
    _res1: u8,
    data: [u8; CAN_MAX_DLEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CanFdFrameRaw {
    can_id: u32,
    len: u8,
    flags: u8,
    _res0: u8,
    _res1: u8,
    data: [u8; CANFD_MAX_DLEN],
}

fn c_timeval_new(t: Duration) -> timeval {
    timeval {
        tv_sec: t.as_secs() as libc::time_t,
        tv_usec: t.subsec_micros() as libc::suseconds_t,
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A bound `CAN_RAW` socket on one interface.
pub struct CanSocket {
    fd: c_int,
    fd_frames: bool,
    closed: AtomicBool,
}

impl CanSocket {
    /// Open and bind a raw socket on the named interface. With `fd_frames`
    /// the socket negotiates CAN-FD reception and transmission.
    pub fn open(ifname: &str, fd_frames: bool) -> Result<CanSocket> {
        let if_index = if_nametoindex(ifname)
            .map_err(|e| Error::Bus(format!("no such interface {ifname:?}: {e}")))?;
        CanSocket::open_if(if_index, fd_frames)
    }

    /// Open a raw socket by kernel interface index.
    pub fn open_if(if_index: c_uint, fd_frames: bool) -> Result<CanSocket> {
        let sock_fd = unsafe { socket(PF_CAN, SOCK_RAW, CAN_RAW) };
        if sock_fd == -1 {
            return Err(io::Error::last_os_error().into());
        }

        if fd_frames {
            let enable: c_int = 1;
            let rv = unsafe {
                setsockopt(
                    sock_fd,
                    SOL_CAN_RAW,
                    CAN_RAW_FD_FRAMES,
                    &enable as *const c_int as *const c_void,
                    size_of::<c_int>() as u32,
                )
            };
            if rv == -1 {
                let err = io::Error::last_os_error();
                unsafe { close(sock_fd) };
                return Err(err.into());
            }
        }

        let addr = CanAddr {
            _af_can: AF_CAN as c_short,
            if_index: if_index as c_int,
            rx_id: 0,
            tx_id: 0,
        };
        let bind_rv = unsafe {
            bind(
                sock_fd,
                &addr as *const CanAddr as *const sockaddr,
                size_of::<CanAddr>() as u32,
            )
        };
        if bind_rv == -1 {
            let err = io::Error::last_os_error();
            unsafe { close(sock_fd) };
            return Err(err.into());
        }

        Ok(CanSocket { fd: sock_fd, fd_frames, closed: AtomicBool::new(false) })
    }

    fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = c_timeval_new(timeout);
        let rv = unsafe {
            setsockopt(
                self.fd,
                SOL_SOCKET,
                SO_RCVTIMEO,
                &tv as *const timeval as *const c_void,
                size_of::<timeval>() as u32,
            )
        };
        if rv == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn write_all(&self, ptr: *const c_void, len: usize) -> Result<()> {
        let rv = unsafe { write(self.fd, ptr, len) };
        if rv as usize != len {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl BusAdapter for CanSocket {
    fn send(&self, frame: &Frame) -> Result<()> {
        let mut can_id = frame.id.as_u32() & EFF_MASK;
        if frame.extended {
            can_id |= EFF_FLAG;
        }

        if frame.fd && self.fd_frames {
            if frame.data.len() > CANFD_MAX_DLEN {
                return Err(Error::PayloadTooLong { len: frame.data.len(), max: CANFD_MAX_DLEN });
            }
            let mut raw = CanFdFrameRaw {
                can_id,
                len: frame.data.len() as u8,
                flags: 0,
                _res0: 0,
                _res1: 0,
                data: [0u8; CANFD_MAX_DLEN],
            };
            raw.data[..frame.data.len()].copy_from_slice(&frame.data);
            self.write_all(&raw as *const CanFdFrameRaw as *const c_void, CANFD_MTU)
        } else {
            if frame.data.len() > CAN_MAX_DLEN {
                return Err(Error::PayloadTooLong { len: frame.data.len(), max: CAN_MAX_DLEN });
            }
            let mut raw = CanFrameRaw {
                can_id,
                can_dlc: frame.data.len() as u8,
                _pad: 0,
                _res0: 0,
                _res1: 0,
                data: [0u8; CAN_MAX_DLEN],
            };
            raw.data[..frame.data.len()].copy_from_slice(&frame.data);
            self.write_all(&raw as *const CanFrameRaw as *const c_void, CAN_MTU)
        }
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        if self.closed.load(Ordering::Relaxed) {
            // Keep the caller's pacing on a socket that was shut down.
            std::thread::sleep(timeout.min(Duration::from_millis(50)));
            return Ok(None);
        }
        self.set_recv_timeout(timeout)?;

        let mut buf = [0u8; CANFD_MTU];
        let count = unsafe { read(self.fd, buf.as_mut_ptr() as *mut c_void, CANFD_MTU) };
        if count == 0 {
            // EOF after shutdown(2).
            return Ok(None);
        }
        if count < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(None)
                }
                _ => Err(err.into()),
            };
        }

        let (can_id, len, fd) = match count as usize {
            CAN_MTU => {
                let raw: CanFrameRaw = unsafe { std::ptr::read(buf.as_ptr() as *const CanFrameRaw) };
                (raw.can_id, raw.can_dlc.min(CAN_MAX_DLEN as u8) as usize, false)
            }
            CANFD_MTU => {
                let raw: CanFdFrameRaw =
                    unsafe { std::ptr::read(buf.as_ptr() as *const CanFdFrameRaw) };
                (raw.can_id, raw.len.min(CANFD_MAX_DLEN as u8) as usize, true)
            }
            other => {
                warn!(bytes = other, "short read from CAN socket");
                return Ok(None);
            }
        };

        let extended = can_id & EFF_FLAG != 0;
        let id = FrameId::new(can_id & EFF_MASK)?;
        Ok(Some(Frame {
            id,
            extended,
            fd,
            data: buf[8..8 + len].to_vec(),
            timestamp: Some(epoch_seconds()),
        }))
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            unsafe {
                libc::shutdown(self.fd, SHUT_RDWR);
            }
        }
    }
}

impl Drop for CanSocket {
    fn drop(&mut self) {
        self.shutdown();
        unsafe {
            close(self.fd);
        }
    }
}

#[cfg(all(test, feature = "vcan_tests"))]
mod tests {
    use super::*;

    // Requires a vcan interface:
    //   sudo ip link add dev vcan0 type vcan && sudo ip link set up vcan0
    #[test]
    fn vcan_loopback() {
        let tx = CanSocket::open("vcan0", false).unwrap();
        let rx = CanSocket::open("vcan0", false).unwrap();

        let frame = Frame::new(0x123u32, &[0xDE, 0xAD]).unwrap();
        tx.send(&frame).unwrap();

        let got = rx.recv(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(got.id, frame.id);
        assert_eq!(got.data, frame.data);
    }
}
