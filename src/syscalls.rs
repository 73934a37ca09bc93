//! Raw socket/epoll/kqueue wrappers. One listener, one readiness-multiplexer
//! instance — no per-core socket sharding, no fd-passing pipes; those
//! existed in the teacher to hand accepted connections between per-core
//! worker threads, which this single-threaded core has no use for (dropped,
//! see DESIGN.md). The listener itself still sets `SO_REUSEPORT` alongside
//! `SO_REUSEADDR` (spec.md §4.6), independent of how many workers exist.
use crate::error::{CoreError, CoreResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;

/// Creates a non-blocking TCP listener bound to `host:port`: `SO_REUSEADDR`
/// so a restart doesn't fail on `TIME_WAIT`, `SO_REUSEPORT` (spec.md §4.6;
/// set on the single listener independently of worker count, same as the
/// original's `server.c`), `SOMAXCONN` backlog.
pub fn create_listen_socket(host: &str, port: u16) -> CoreResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|_| CoreError::Other(format!("invalid bind address '{}'", addr_str)))?;

    let domain = if matches!(addr, SocketAddr::V6(_)) {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(not(target_os = "linux"))]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        #[cfg(not(target_os = "linux"))]
        {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        #[cfg(target_os = "macos")]
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if bind_addr(fd, &addr).is_err() {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    #[cfg(target_os = "macos")]
                    sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    #[cfg(target_os = "macos")]
                    sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr { s6_addr: a.ip().octets() },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }
    }
    Ok(())
}

unsafe fn storage_to_socket_addr(storage: &libc::sockaddr_storage) -> SocketAddr {
    unsafe {
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &*(storage as *const _ as *const libc::sockaddr_in);
                let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                SocketAddr::from((ip, u16::from_be(sin.sin_port)))
            }
            _ => {
                let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
                let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                SocketAddr::from((ip, u16::from_be(sin6.sin6_port)))
            }
        }
    }
}

/// Accepts one pending connection, non-blocking. `Ok(None)` means the
/// accept queue is currently empty (`EWOULDBLOCK`) — the caller's
/// drain loop should stop.
pub fn accept_connection(listen_fd: c_int) -> CoreResult<Option<(c_int, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        #[cfg(not(target_os = "linux"))]
        let fd = libc::accept(listen_fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len);

        if fd < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            };
        }

        #[cfg(not(target_os = "linux"))]
        {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        Ok(Some((fd, storage_to_socket_addr(&storage))))
    }
}

/// Grows `SO_RCVBUF`/`SO_SNDBUF` toward `desired` bytes, never shrinking it —
/// the kernel-side half of spec.md §4.6's adaptive buffer sizing (the
/// connection's own `Vec<u8>` scratch buffers are the user-space half).
fn grow_sockopt(fd: c_int, opt: c_int, desired: usize) -> CoreResult<()> {
    unsafe {
        let mut current: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut current as *mut _ as *mut c_void,
            &mut len,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
        if (current as usize) >= desired {
            return Ok(());
        }
        let wanted = desired as c_int;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &wanted as *const _ as *const c_void,
            mem::size_of_val(&wanted) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn grow_recv_buffer(fd: c_int, desired: usize) -> CoreResult<()> {
    grow_sockopt(fd, libc::SO_RCVBUF, desired)
}

pub fn grow_send_buffer(fd: c_int, desired: usize) -> CoreResult<()> {
    grow_sockopt(fd, libc::SO_SNDBUF, desired)
}

/// Bytes still queued (written but not yet acknowledged by the peer) in
/// `fd`'s kernel send buffer (spec.md §9: `num_bytes_in_wr_socket`,
/// `io_utils.c:167-176` — `TIOCOUTQ` on Linux, `SO_NWRITE` on macOS).
fn queued_send_bytes(fd: c_int) -> CoreResult<usize> {
    let mut count: c_int = 0;
    unsafe {
        #[cfg(target_os = "linux")]
        if libc::ioctl(fd, libc::TIOCOUTQ, &mut count) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        #[cfg(target_os = "macos")]
        {
            let mut len = mem::size_of::<c_int>() as socklen_t;
            if libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NWRITE,
                &mut count as *mut _ as *mut c_void,
                &mut len,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }
        }
    }
    Ok(count.max(0) as usize)
}

/// `SO_SNDBUF` size minus bytes still queued: how much the driver can hand
/// to `write()` right now without exceeding what the kernel will actually
/// accept (spec.md §4.5 step 7's `min(remaining, local_buf_size,
/// kernel_send_free)` pacing; `free_bytes_in_wr_socket`, `io_utils.c:178-186`).
pub fn kernel_send_free(fd: c_int) -> CoreResult<usize> {
    let mut sndbuf: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    unsafe {
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut sndbuf as *mut _ as *mut c_void,
            &mut len,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    let queued = queued_send_bytes(fd)?;
    Ok((sndbuf as usize).saturating_sub(queued))
}

// ---- Epoll (Linux) / kqueue (macOS) ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    pub use libc::{EPOLLET, EPOLLIN, EPOLLOUT, epoll_event};

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> CoreResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        /// Registers `fd` edge-triggered for `interests` under `token`.
        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> CoreResult<()> {
            let mut event = epoll_event { events: (interests | EPOLLET) as u32, u64: token };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> CoreResult<()> {
            let mut event = epoll_event { events: (interests | EPOLLET) as u32, u64: token };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> CoreResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> CoreResult<usize> {
            unsafe {
                let res = libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms);
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(target_os = "macos")]
pub use macos_epoll::*;

#[cfg(target_os = "macos")]
mod macos_epoll {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;
    pub const EPOLLET: i32 = 1 << 31;

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> CoreResult<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> CoreResult<()> {
            self.modify_kqueue(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> CoreResult<()> {
            self.modify_kqueue(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn delete(&self, fd: c_int) -> CoreResult<()> {
            self.modify_kqueue(fd, 0, EPOLLIN | EPOLLOUT, EV_DELETE)
        }

        fn modify_kqueue(&self, fd: c_int, token: u64, interests: i32, action: u16) -> CoreResult<()> {
            let mut changes = [unsafe { mem::zeroed::<kevent>() }; 2];
            let mut n = 0;

            if (interests & EPOLLIN) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            if (interests & EPOLLOUT) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }

            unsafe {
                let res = libc::kevent(self.fd, changes.as_ptr(), n as c_int, ptr::null_mut(), 0, ptr::null());
                if res < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> CoreResult<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch_size = events.len().min(MAX_BATCH);

            let ts = if timeout_ms >= 0 {
                Some(timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                })
            } else {
                None
            };
            let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);

            unsafe {
                let res = libc::kevent(self.fd, ptr::null(), 0, kevents.as_mut_ptr(), batch_size as c_int, ts_ptr);
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }

                let n = res as usize;
                for i in 0..n {
                    let mut ep_ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ep_ev |= EPOLLIN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ep_ev |= EPOLLOUT;
                    }
                    events[i] = epoll_event { events: ep_ev as u32, u64: kevents[i].udata as u64 };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// Outcome of a non-blocking read, keeping "no data yet" distinct from
/// "peer closed" — the teacher's `read_nonblocking` collapses both into
/// `Ok(0)`, which is the ambiguity spec.md §9 flags as a likely bug.
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> CoreResult<ReadOutcome> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(ReadOutcome::WouldBlock)
            } else {
                Err(err.into())
            };
        }
        if res == 0 {
            Ok(ReadOutcome::Eof)
        } else {
            Ok(ReadOutcome::Data(res as usize))
        }
    }
}

pub enum WriteOutcome {
    Written(usize),
    WouldBlock,
}

pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> CoreResult<WriteOutcome> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(WriteOutcome::WouldBlock)
            } else {
                Err(err.into())
            };
        }
        Ok(WriteOutcome::Written(res as usize))
    }
}
