//! # Link Socket Manager
//!
//! Raw `AF_PACKET` sockets bound to one network interface.
//!
//! Configuration steps consume the socket and hand it back on success. A step
//! that fails drops the socket, which closes the descriptor, so a socket that
//! failed to configure can never be used afterwards.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{LinkError, Result};
use crate::filter::FilterProgram;
use crate::protocol::addressing::OperatingMode;

/// Longest interface name the kernel accepts (without the NUL terminator)
pub const MAX_INTERFACE_NAME_LEN: usize = libc::IFNAMSIZ - 1;

/// Raw link-layer socket for one DroneBridge receiver
#[derive(Debug)]
pub struct LinkSocket {
    fd: OwnedFd,
    mode: OperatingMode,
    interface: Option<String>,
    filtered: bool,
    nonblocking: bool,
    receive_timeout: Option<Duration>,
}

fn check_interface_name(interface: &str) -> Result<()> {
    if interface.is_empty()
        || interface.len() > MAX_INTERFACE_NAME_LEN
        || interface.contains('\0')
    {
        return Err(LinkError::InterfaceNotFound {
            interface: interface.to_string(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name must be 1 to {} bytes without NUL", MAX_INTERFACE_NAME_LEN),
            ),
        });
    }
    Ok(())
}

fn interface_request(interface: &str) -> Result<libc::ifreq> {
    check_interface_name(interface)?;

    // SAFETY: ifreq is plain old data; all-zero is a valid value
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, &src) in ifr.ifr_name.iter_mut().zip(interface.as_bytes()) {
        *dst = src as libc::c_char;
    }
    Ok(ifr)
}

/// Resolve an interface name to its kernel index without opening a socket
///
/// # Errors
///
/// Returns `LinkError::InterfaceNotFound` if the name is invalid or no such
/// interface exists on this host.
pub fn resolve_interface_index(interface: &str) -> Result<u32> {
    check_interface_name(interface)?;

    let name = CString::new(interface).map_err(|e| LinkError::InterfaceNotFound {
        interface: interface.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;

    // SAFETY: name is a valid NUL-terminated string
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(LinkError::InterfaceNotFound {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(index)
}

fn option_failed(option: &'static str, source: io::Error) -> LinkError {
    warn!("Could not set {}: {}", option, source);
    LinkError::ConfigFailed { option, source }
}

impl LinkSocket {
    /// Open a raw link-layer socket for the given mode
    ///
    /// WIFI_COMPAT sockets receive the DroneBridge ether-type, MONITOR sockets
    /// receive LLC 802.2 frames. Needs `CAP_NET_RAW`.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::SocketCreateFailed` if the kernel refuses the socket.
    pub fn create_raw_socket(mode: OperatingMode) -> Result<Self> {
        let protocol = mode.ether_type().to_be() as libc::c_int;

        // SAFETY: plain syscall, result checked below
        let fd = unsafe {
            libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, protocol)
        };
        if fd < 0 {
            return Err(LinkError::SocketCreateFailed {
                mode,
                source: io::Error::last_os_error(),
            });
        }

        debug!("Opened {} raw socket (fd {})", mode, fd);
        // SAFETY: fd was just returned by socket() and is owned by nobody else
        Ok(Self::from_owned_fd(unsafe { OwnedFd::from_raw_fd(fd) }, mode))
    }

    /// Adopt an already open descriptor
    pub fn from_owned_fd(fd: OwnedFd, mode: OperatingMode) -> Self {
        Self {
            fd,
            mode,
            interface: None,
            filtered: false,
            nonblocking: false,
            receive_timeout: None,
        }
    }

    /// Give up ownership of the descriptor
    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Interface the socket is bound to, `None` before binding
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout
    }

    fn set_option<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        // SAFETY: value points to a live T of the given size
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn interface_ioctl(&self, request: libc::c_ulong, ifr: &mut libc::ifreq) -> io::Result<()> {
        // SAFETY: ifr is a valid, writable ifreq for the duration of the call
        let ret = unsafe {
            libc::ioctl(self.fd.as_raw_fd(), request as _, ifr as *mut libc::ifreq)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Set `IFF_PROMISC` on the interface
    ///
    /// The flag belongs to the interface, not to this socket: it stays set
    /// after the socket closes and is visible to every process. Keep one
    /// promiscuous-mode owner per interface.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InterfaceControlFailed` if the flags cannot be read
    /// or written.
    pub fn enable_promiscuous(self, interface: &str) -> Result<Self> {
        let control_failed = |source: io::Error| LinkError::InterfaceControlFailed {
            interface: interface.to_string(),
            source,
        };

        let mut ifr = interface_request(interface).map_err(|e| match e {
            LinkError::InterfaceNotFound { source, .. } => control_failed(source),
            other => other,
        })?;

        self.interface_ioctl(libc::SIOCGIFFLAGS as libc::c_ulong, &mut ifr)
            .map_err(control_failed)?;

        // SAFETY: SIOCGIFFLAGS filled the flags member of the union
        unsafe {
            ifr.ifr_ifru.ifru_flags |= libc::IFF_PROMISC as libc::c_short;
        }

        self.interface_ioctl(libc::SIOCSIFFLAGS as libc::c_ulong, &mut ifr)
            .map_err(control_failed)?;

        debug!("Enabled promiscuous mode on {}", interface);
        Ok(self)
    }

    /// Attach a kernel filter program
    ///
    /// The program is checked with [`FilterProgram::validate`] first so that a
    /// malformed program fails with a readable reason instead of a bare EINVAL.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::FilterAttachFailed` if the program is invalid or the
    /// kernel rejects it. The socket is closed.
    pub fn attach_filter(mut self, program: &FilterProgram) -> Result<Self> {
        program
            .validate()
            .map_err(|source| LinkError::FilterAttachFailed { source })?;

        let mut filters: Vec<libc::sock_filter> = program
            .instructions()
            .iter()
            .map(|insn| libc::sock_filter {
                code: insn.code,
                jt: insn.jt,
                jf: insn.jf,
                k: insn.k,
            })
            .collect();

        let fprog = libc::sock_fprog {
            len: filters.len() as libc::c_ushort,
            filter: filters.as_mut_ptr(),
        };

        self.set_option(libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, &fprog)
            .map_err(|source| LinkError::FilterAttachFailed { source })?;

        debug!("Attached {}-instruction BPF filter", filters.len());
        self.filtered = true;
        Ok(self)
    }

    /// Bind to an interface, selecting the mode's ether-type
    ///
    /// # Errors
    ///
    /// - `LinkError::InterfaceNotFound` if the interface does not exist
    /// - `LinkError::BindFailed` if the kernel refuses the address
    ///
    /// The socket is closed on either error.
    pub fn bind_to_interface(mut self, interface: &str) -> Result<Self> {
        let mut ifr = interface_request(interface)?;

        self.interface_ioctl(libc::SIOCGIFINDEX as libc::c_ulong, &mut ifr)
            .map_err(|source| LinkError::InterfaceNotFound {
                interface: interface.to_string(),
                source,
            })?;

        // SAFETY: SIOCGIFINDEX filled the ifindex member of the union
        let ifindex = unsafe { ifr.ifr_ifru.ifru_ifindex };

        // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value
        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as libc::c_ushort;
        sll.sll_ifindex = ifindex;
        sll.sll_protocol = self.mode.ether_type().to_be();

        // SAFETY: sll is a fully initialised sockaddr_ll of the stated size
        let ret = unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(LinkError::BindFailed {
                interface: interface.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        debug!("Bound {} socket to {} (ifindex {})", self.mode, interface, ifindex);
        self.interface = Some(interface.to_string());
        Ok(self)
    }

    fn update_status_flags(&mut self, nonblocking: bool) -> io::Result<()> {
        let fd = self.fd.as_raw_fd();

        // SAFETY: fcntl on a descriptor we own
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }

        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };

        // SAFETY: as above
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }

        self.nonblocking = nonblocking;
        Ok(())
    }

    /// Put the descriptor into non-blocking mode
    ///
    /// # Errors
    ///
    /// Returns `LinkError::ConfigFailed` if `fcntl` fails.
    pub fn set_nonblocking(mut self) -> Result<Self> {
        self.update_status_flags(true)
            .map_err(|source| option_failed("O_NONBLOCK", source))?;
        Ok(self)
    }

    /// Clear the non-blocking flag
    ///
    /// # Errors
    ///
    /// Returns `LinkError::ConfigFailed` if `fcntl` fails.
    pub fn set_blocking(mut self) -> Result<Self> {
        self.update_status_flags(false)
            .map_err(|source| option_failed("O_NONBLOCK", source))?;
        Ok(self)
    }

    /// Allow the address to be reused if a previous socket closed prematurely
    ///
    /// # Errors
    ///
    /// Returns `LinkError::ConfigFailed` if `setsockopt` fails.
    pub fn set_reuse_address(self) -> Result<Self> {
        let enable: libc::c_int = 1;
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, &enable)
            .map_err(|source| option_failed("SO_REUSEADDR", source))?;
        Ok(self)
    }

    /// Bound each receive call by a deadline
    ///
    /// Never fails: without a timeout reads simply block, so a failure is
    /// logged and the socket is returned unchanged.
    pub fn set_receive_timeout(mut self, seconds: u32, microseconds: u32) -> Self {
        let tv = libc::timeval {
            tv_sec: seconds as libc::time_t,
            tv_usec: microseconds as libc::suseconds_t,
        };

        match self.set_option(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv) {
            Ok(()) => {
                let timeout = Duration::from_secs(seconds as u64)
                    + Duration::from_micros(microseconds as u64);
                self.receive_timeout = (!timeout.is_zero()).then_some(timeout);
                debug!("Receive timeout set to {:?}", timeout);
            }
            Err(e) => {
                warn!(
                    "Could not set receive timeout ({}s {}us), reads will block: {}",
                    seconds, microseconds, e
                );
            }
        }
        self
    }

    /// Receive one frame into `buf`
    ///
    /// Returns the number of bytes written. Non-blocking sockets report
    /// `WouldBlock` when no frame is queued; sockets with a receive timeout
    /// report `WouldBlock` once the timeout expires.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsFd for LinkSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for LinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
