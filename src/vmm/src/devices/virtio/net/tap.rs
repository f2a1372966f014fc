// SPDX-License-Identifier: Apache-2.0

//! TAP backend: a kernel tap interface carrying whole Ethernet frames with
//! a vnet header, offloads negotiated to match the device features.

use std::fs::File;
use std::io::{self, Error as IoError};
use std::net::Ipv4Addr;
use std::os::raw::{c_char, c_int, c_uint, c_ulong};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process::Command;

use log::warn;
use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ref, ioctl_with_val};
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use super::{NetBackend, VIRTIO_NET_HDR_SIZE};

// As defined in the Linux UAPI:
// https://elixir.bootlin.com/linux/v4.17/source/include/uapi/linux/if.h#L33
const IFACE_NAME_MAX_LEN: usize = 16;

const IFF_TAP: c_uint = 2;
const IFF_NO_PI: c_uint = 4096;
const IFF_VNET_HDR: c_uint = 16384;
const IFF_UP: i16 = 0x1;
const IFF_RUNNING: i16 = 0x40;

const TUN_F_CSUM: c_uint = 1;
const TUN_F_TSO4: c_uint = 2;
const TUN_F_TSO6: c_uint = 4;
const TUN_F_UFO: c_uint = 16;

const TUNTAP: c_uint = 84;
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, c_int);
ioctl_iow_nr!(TUNSETOFFLOAD, TUNTAP, 208, c_uint);
ioctl_iow_nr!(TUNSETVNETHDRSZ, TUNTAP, 216, c_int);

const SIOCGIFFLAGS: c_ulong = 0x8913;
const SIOCSIFFLAGS: c_ulong = 0x8914;
const SIOCSIFADDR: c_ulong = 0x8916;

/// `struct ifreq`: interface name plus a request-specific union.
#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFACE_NAME_MAX_LEN],
    ifr_ifru: [u8; 24],
}

impl IfReq {
    fn with_name(name: &str) -> io::Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() >= IFACE_NAME_MAX_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name {} is too long", name),
            ));
        }
        let mut req = IfReq {
            ifr_name: [0; IFACE_NAME_MAX_LEN],
            ifr_ifru: [0; 24],
        };
        req.ifr_name[..bytes.len()].copy_from_slice(bytes);
        Ok(req)
    }

    fn name(&self) -> String {
        let end = self
            .ifr_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(IFACE_NAME_MAX_LEN);
        String::from_utf8_lossy(&self.ifr_name[..end]).into_owned()
    }

    fn set_flags(&mut self, flags: i16) {
        self.ifr_ifru[..2].copy_from_slice(&flags.to_ne_bytes());
    }

    fn flags(&self) -> i16 {
        i16::from_ne_bytes([self.ifr_ifru[0], self.ifr_ifru[1]])
    }

    fn set_ipv4_addr(&mut self, addr: Ipv4Addr) {
        // struct sockaddr_in: family, port, address.
        let family = (libc::AF_INET as u16).to_ne_bytes();
        self.ifr_ifru[..2].copy_from_slice(&family);
        self.ifr_ifru[2..4].copy_from_slice(&[0, 0]);
        self.ifr_ifru[4..8].copy_from_slice(&addr.octets());
    }
}

/// Handle for a network tap interface. The fd stays blocking; the RX
/// thread parks in read(2) until a frame shows up.
pub struct Tap {
    tap_file: File,
    if_name: String,
}

impl Tap {
    /// Open `/dev/net/tun` and create (or attach to) `if_name`; an empty
    /// name lets the kernel pick `tapN`.
    pub fn open_named(if_name: &str) -> io::Result<Self> {
        let fd = unsafe {
            // Open calls are safe because we give a constant null-terminated
            // string and verify the result.
            libc::open(b"/dev/net/tun\0".as_ptr() as *const c_char, libc::O_RDWR)
        };
        if fd < 0 {
            return Err(IoError::last_os_error());
        }
        // We just checked that the fd is valid.
        let tap_file = unsafe { File::from_raw_fd(fd) };

        let mut req = IfReq::with_name(if_name)?;
        req.set_flags((IFF_TAP | IFF_NO_PI | IFF_VNET_HDR) as i16);
        // Safe: the fd is a tun fd and the request outlives the call.
        let ret = unsafe { ioctl_with_mut_ref(&tap_file, TUNSETIFF(), &mut req) };
        if ret < 0 {
            return Err(IoError::last_os_error());
        }

        Ok(Tap {
            tap_file,
            if_name: req.name(),
        })
    }

    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    /// Negotiate checksum and segmentation offloads and the vnet header.
    pub fn set_offloads(&self) -> io::Result<()> {
        let offload = TUN_F_CSUM | TUN_F_TSO4 | TUN_F_TSO6 | TUN_F_UFO;
        let ret = unsafe { ioctl_with_val(&self.tap_file, TUNSETOFFLOAD(), offload as c_ulong) };
        if ret < 0 {
            return Err(IoError::last_os_error());
        }

        let hdr_size = VIRTIO_NET_HDR_SIZE as c_int;
        let ret = unsafe { ioctl_with_ref(&self.tap_file, TUNSETVNETHDRSZ(), &hdr_size) };
        if ret < 0 {
            return Err(IoError::last_os_error());
        }
        Ok(())
    }

    /// Host-side plumbing: either hand the interface to a helper script or
    /// assign `host_ip` directly, then bring it up.
    pub fn bring_up(&self, script: Option<&str>, host_ip: Ipv4Addr) -> io::Result<()> {
        if let Some(script) = script {
            let status = Command::new(script).arg(&self.if_name).status()?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("tap setup script {} failed", script),
                ));
            }
            return Ok(());
        }

        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if sock < 0 {
            return Err(IoError::last_os_error());
        }
        // Socket just for interface ioctls, closed on every exit path.
        let sock = unsafe { File::from_raw_fd(sock) };

        let mut req = IfReq::with_name(&self.if_name)?;
        req.set_ipv4_addr(host_ip);
        if unsafe { ioctl_with_mut_ref(&sock, SIOCSIFADDR, &mut req) } < 0 {
            return Err(IoError::last_os_error());
        }

        let mut req = IfReq::with_name(&self.if_name)?;
        if unsafe { ioctl_with_mut_ref(&sock, SIOCGIFFLAGS, &mut req) } < 0 {
            return Err(IoError::last_os_error());
        }
        let flags = req.flags() | IFF_UP | IFF_RUNNING;
        req.set_flags(flags);
        if unsafe { ioctl_with_mut_ref(&sock, SIOCSIFFLAGS, &mut req) } < 0 {
            warn!("could not bring tap device {} up", self.if_name);
        }

        Ok(())
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.tap_file.as_raw_fd()
    }
}

impl NetBackend for Tap {
    fn rx(&self, frame: &mut [u8]) -> io::Result<usize> {
        // A tap read returns exactly one frame.
        let n = unsafe {
            libc::read(
                self.tap_file.as_raw_fd(),
                frame.as_mut_ptr() as *mut libc::c_void,
                frame.len(),
            )
        };
        if n < 0 {
            return Err(IoError::last_os_error());
        }
        Ok(n as usize)
    }

    fn tx(&self, frame: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.tap_file.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
            )
        };
        if n < 0 {
            return Err(IoError::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlong_interface_names_are_rejected() {
        assert!(IfReq::with_name("averyveryverylongtapname").is_err());
    }

    #[test]
    fn ifreq_flag_roundtrip() {
        let mut req = IfReq::with_name("tap0").unwrap();
        req.set_flags(0x1234);
        assert_eq!(req.flags(), 0x1234);
        assert_eq!(req.name(), "tap0");
    }
}
