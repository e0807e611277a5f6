//! thin ptrace wrapper: one attached tracee, tracked as a three-state
//! machine (`Detached` / `Stopped` / `Running`).
//!
//! the kernel enforces tracer identity, so all operations on a `Tracer`
//! must come from the thread that attached.

use std::io::{Error, ErrorKind, Result};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::regs::RegisterFrame;

pub fn from_nix_error(err: nix::Error) -> Error {
    match err {
        nix::Error::Sys(Errno::EPERM) => Error::new(
            ErrorKind::PermissionDenied,
            "ptrace denied (EPERM); check /proc/sys/kernel/yama/ptrace_scope",
        ),
        nix::Error::Sys(Errno::ESRCH) => {
            Error::new(ErrorKind::NotFound, "no such process")
        }
        other => Error::new(ErrorKind::Other, other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Detached,
    Stopped,
    Running,
}

#[derive(Debug)]
pub struct Tracer {
    pid: Pid,
    state: TraceState,
}

impl Tracer {
    /// `PTRACE_ATTACH`, then wait (retrying `EINTR`) until the tracee
    /// reports a stop.
    pub fn attach(pid: Pid) -> Result<Tracer> {
        ptrace::attach(pid).map_err(from_nix_error)?;
        loop {
            match waitpid(pid, None) {
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => {
                    // do not leave a half-attached tracee behind
                    let _ = ptrace::detach(pid);
                    return Err(from_nix_error(e));
                }
                Ok(WaitStatus::Stopped(p, sig)) if p == pid => {
                    debug!("[tracer] attached to {} (stop signal {:?})", pid, sig);
                    break;
                }
                Ok(status) => {
                    debug!("[tracer] attach wait skipped {:?}", status);
                    continue;
                }
            }
        }
        Ok(Tracer {
            pid,
            state: TraceState::Stopped,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    fn expect_stopped(&self, what: &str) -> Result<()> {
        if self.state != TraceState::Stopped {
            return Err(Error::new(
                ErrorKind::Other,
                format!(
                    "{} requires a stopped tracee (pid {} is {:?})",
                    what, self.pid, self.state
                ),
            ));
        }
        Ok(())
    }

    /// resume the tracee without a signal.
    pub fn cont(&mut self) -> Result<()> {
        self.expect_stopped("PTRACE_CONT")?;
        ptrace::cont(self.pid, None).map_err(from_nix_error)?;
        self.state = TraceState::Running;
        Ok(())
    }

    /// block until the next tracee state change, retrying `EINTR`.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        loop {
            match waitpid(self.pid, None) {
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => return Err(from_nix_error(e)),
                Ok(status) => {
                    self.state = match status {
                        WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                            TraceState::Detached
                        }
                        _ => TraceState::Stopped,
                    };
                    return Ok(status);
                }
            }
        }
    }

    pub fn detach(&mut self) -> Result<()> {
        self.expect_stopped("PTRACE_DETACH")?;
        ptrace::detach(self.pid).map_err(from_nix_error)?;
        self.state = TraceState::Detached;
        Ok(())
    }

    /// register file via `PTRACE_GETREGSET` with `NT_PRSTATUS`; the
    /// legacy GETREGS request does not exist on arm64.
    pub fn getregs(&self) -> Result<RegisterFrame> {
        self.expect_stopped("PTRACE_GETREGSET")?;
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: &mut regs as *mut libc::user_regs_struct
                as *mut libc::c_void,
            iov_len: std::mem::size_of::<libc::user_regs_struct>(),
        };
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as usize,
                &mut iov as *mut libc::iovec,
            )
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok(RegisterFrame::from_raw(regs))
    }

    pub fn setregs(&self, frame: &RegisterFrame) -> Result<()> {
        self.expect_stopped("PTRACE_SETREGSET")?;
        let mut regs = *frame.raw();
        let mut iov = libc::iovec {
            iov_base: &mut regs as *mut libc::user_regs_struct
                as *mut libc::c_void,
            iov_len: std::mem::size_of::<libc::user_regs_struct>(),
        };
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as usize,
                &mut iov as *mut libc::iovec,
            )
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn getsiginfo(&self) -> Result<libc::siginfo_t> {
        self.expect_stopped("PTRACE_GETSIGINFO")?;
        ptrace::getsiginfo(self.pid).map_err(from_nix_error)
    }

    /// peek one machine word.
    pub fn peek(&self, addr: u64) -> Result<u64> {
        self.expect_stopped("PTRACE_PEEKDATA")?;
        ptrace::read(self.pid, addr as ptrace::AddressType)
            .map(|w| w as u64)
            .map_err(from_nix_error)
    }

    /// poke one machine word.
    pub fn poke(&self, addr: u64, value: u64) -> Result<()> {
        self.expect_stopped("PTRACE_POKEDATA")?;
        ptrace::write(
            self.pid,
            addr as ptrace::AddressType,
            value as *mut libc::c_void,
        )
        .map_err(from_nix_error)
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.state == TraceState::Detached {
            return;
        }
        // never leave the tracee in a stopped state
        match ptrace::detach(self.pid) {
            Ok(()) => debug!("[tracer] detached from {}", self.pid),
            Err(e) => warn!("[tracer] detach from {} failed: {}", self.pid, e),
        }
    }
}
