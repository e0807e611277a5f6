//! synthesized function calls inside the tracee.
//!
//! the call frame carries a sentinel return address of 0, so a completed
//! call faults with SIGSEGV at address 0 and hands control back to the
//! tracer. a SIGTRAP stop is routed to the caller's trap handler (the heap
//! walker's buffer-overflow handshake).

use std::io::{Error, ErrorKind, Result};

use log::{debug, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use crate::consts::BREAKPOINT_INSN_SIZE;
use crate::regs::MAX_CALL_ARGS;
use crate::tracer::{TraceState, Tracer};

/// invoked on each SIGTRAP stop; return `true` to resume the call,
/// `false` to abort it. the tracee is stopped while the handler runs.
pub type TrapHandler<'a> = dyn FnMut(&mut Tracer) -> Result<bool> + 'a;

fn call_failed(detail: String) -> Error {
    Error::new(ErrorKind::Other, format!("remote call failed: {}", detail))
}

/// call `func_addr(args...)` in the tracee and return its value. the
/// tracee must be attached and stopped; its register file is restored on
/// every exit path and it is left attached and stopped.
pub fn call_remote_function(
    tracer: &mut Tracer,
    func_addr: u64,
    args: &[u64],
    on_trap: Option<&mut TrapHandler>,
) -> Result<u64> {
    if args.len() > MAX_CALL_ARGS {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("remote call takes at most 6 args, got {}", args.len()),
        ));
    }

    let orig = tracer.getregs()?;
    let result = drive_call(tracer, &orig, func_addr, args, on_trap);

    let restore = if tracer.state() == TraceState::Stopped {
        tracer.setregs(&orig)
    } else {
        // tracee died; there is nothing to restore
        Ok(())
    };

    match (result, restore) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), restore_res) => {
            if let Err(re) = restore_res {
                warn!("[call] register restore also failed: {}", re);
            }
            Err(e)
        }
    }
}

fn drive_call(
    tracer: &mut Tracer,
    orig: &crate::regs::RegisterFrame,
    func_addr: u64,
    args: &[u64],
    mut on_trap: Option<&mut TrapHandler>,
) -> Result<u64> {
    let frame = orig.setup_call(func_addr, args, 0);

    // on x86_64 the sentinel return address lives on the stack and must
    // be poked before the resume
    #[cfg(target_arch = "x86_64")]
    let frame = {
        let mut frame = frame;
        let slot = frame.stack_reserve(std::mem::size_of::<u64>() as u64);
        tracer.poke(slot, 0)?;
        frame
    };

    tracer.setregs(&frame)?;
    tracer.cont()?;
    debug!(
        "[call] pid {} entering {:x}({:x?})",
        tracer.pid(),
        func_addr,
        args
    );

    loop {
        let status = tracer.wait()?;
        match status {
            WaitStatus::Exited(_, code) => {
                return Err(call_failed(format!(
                    "tracee {} exited with code {}",
                    tracer.pid(),
                    code
                )));
            }
            WaitStatus::Signaled(_, sig, _) => {
                return Err(call_failed(format!(
                    "tracee {} killed by {:?}",
                    tracer.pid(),
                    sig
                )));
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) if on_trap.is_some() => {
                let resume = match on_trap.as_mut() {
                    Some(handler) => handler(tracer)?,
                    None => unreachable!(),
                };
                if !resume {
                    return Err(call_failed(String::from(
                        "trap handler requested abort",
                    )));
                }
                let mut regs = tracer.getregs()?;
                regs.set_pc(regs.pc() + BREAKPOINT_INSN_SIZE);
                tracer.setregs(&regs)?;
                tracer.cont()?;
            }
            WaitStatus::Stopped(_, Signal::SIGSEGV) => {
                let siginfo = tracer.getsiginfo()?;
                let fault_addr = unsafe { siginfo.si_addr() } as u64;
                if fault_addr != 0 {
                    return Err(call_failed(format!(
                        "SIGSEGV at {:x} (expected sentinel return to 0)",
                        fault_addr
                    )));
                }
                let regs = tracer.getregs()?;
                debug!(
                    "[call] pid {} returned {:x}",
                    tracer.pid(),
                    regs.retval()
                );
                return Ok(regs.retval());
            }
            WaitStatus::Stopped(_, sig) => {
                return Err(call_failed(format!(
                    "unexpected stop signal {:?} during call to {:x}",
                    sig, func_addr
                )));
            }
            other => {
                return Err(call_failed(format!(
                    "unexpected wait status {:?}",
                    other
                )));
            }
        }
    }
}
