//! Thin seam over the raw OS surface the manager touches.
//!
//! Everything unsafe lives here: the readiness syscall behind the poll
//! reader, the buffered-byte query behind `SocketToken::available`, the
//! thread priority boost, and the Windows loopback fast path.

#![allow(unsafe_code)]

use std::io;

#[cfg(unix)]
mod imp {
    use super::io;
    use crate::token::RawHandle;
    use smallvec::SmallVec;
    use std::time::Duration;

    /// Handles the readiness call reported as readable or faulted.
    #[derive(Debug, Default)]
    pub(crate) struct Readiness {
        pub(crate) read: SmallVec<[RawHandle; 16]>,
        pub(crate) error: SmallVec<[RawHandle; 16]>,
    }

    impl Readiness {
        pub(crate) fn is_empty(&self) -> bool {
            self.read.is_empty() && self.error.is_empty()
        }
    }

    /// Wait up to `timeout` for any of `handles` to become readable or to
    /// report a fault.
    pub(crate) fn await_readiness(
        handles: &[RawHandle],
        timeout: Duration,
    ) -> io::Result<Readiness> {
        let mut fds: SmallVec<[libc::pollfd; 16]> = handles
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut out = Readiness::default();
        if rc == 0 {
            return Ok(out);
        }
        for fd in &fds {
            if fd.revents == 0 {
                continue;
            }
            if fd.revents & libc::POLLIN != 0 {
                out.read.push(fd.fd);
            }
            // A hangup with bytes still buffered is drained through the read
            // path; the error path only sees it once the buffer is empty.
            if fd.revents & (libc::POLLERR | libc::POLLNVAL) != 0
                || (fd.revents & libc::POLLHUP != 0 && fd.revents & libc::POLLIN == 0)
            {
                out.error.push(fd.fd);
            }
        }
        Ok(out)
    }

    /// Bytes buffered by the OS for reading on `handle`.
    pub(crate) fn bytes_available(handle: RawHandle) -> io::Result<usize> {
        let mut count: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(handle, libc::FIONREAD, &mut count) };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(count.max(0) as usize)
        }
    }

    /// Best-effort bump of the current thread above normal priority.
    ///
    /// Raising priority needs elevated privileges on most Unix hosts;
    /// failure is traced and ignored, the boost is an optimization.
    pub(crate) fn boost_thread_priority() {
        #[cfg(target_os = "linux")]
        {
            let tid = unsafe { libc::syscall(libc::SYS_gettid) };
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, tid as _, -1) };
            if rc != 0 {
                tracing::debug!(
                    err = %io::Error::last_os_error(),
                    "thread priority boost unavailable"
                );
            }
        }
        #[cfg(not(target_os = "linux"))]
        tracing::debug!("per-thread priority boost not supported on this platform");
    }

    /// The loopback fast path is a Windows optimization; nothing to do here.
    pub(crate) fn enable_fast_loopback(_socket: &socket2::Socket) {}
}

#[cfg(windows)]
mod imp {
    use super::io;
    use crate::token::RawHandle;

    pub(crate) fn bytes_available(handle: RawHandle) -> io::Result<usize> {
        use windows_sys::Win32::Networking::WinSock::{ioctlsocket, FIONREAD};

        let mut count: u32 = 0;
        let rc = unsafe { ioctlsocket(handle as usize, FIONREAD, &mut count) };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(count as usize)
        }
    }

    pub(crate) fn boost_thread_priority() {
        use windows_sys::Win32::System::Threading::{
            GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL,
        };

        let ok = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL) };
        if ok == 0 {
            tracing::debug!(
                err = %io::Error::last_os_error(),
                "thread priority boost unavailable"
            );
        }
    }

    /// Enable the loopback fast path (Windows 8 / 6.2 and later). The ioctl
    /// fails cleanly on older hosts and the option is an optimization, so
    /// failure is ignored.
    pub(crate) fn enable_fast_loopback(socket: &socket2::Socket) {
        use std::os::windows::io::AsRawSocket;
        use windows_sys::Win32::Networking::WinSock::WSAIoctl;

        const SIO_LOOPBACK_FAST_PATH: u32 = 0x9800_0010;

        let mut enabled: u32 = 1;
        let mut returned: u32 = 0;
        let rc = unsafe {
            WSAIoctl(
                socket.as_raw_socket() as usize,
                SIO_LOOPBACK_FAST_PATH,
                std::ptr::addr_of_mut!(enabled).cast(),
                std::mem::size_of::<u32>() as u32,
                std::ptr::null_mut(),
                0,
                &mut returned,
                std::ptr::null_mut(),
                None,
            )
        };
        if rc != 0 {
            tracing::trace!("loopback fast path unavailable");
        }
    }
}

pub(crate) use imp::*;
