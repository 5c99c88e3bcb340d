use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{Context, Result};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, fork, ForkResult, Pid};

use crate::cap::pty::{self, PtyBroker};

pub struct Launched {
    pub pid: Pid,
    pub pty: Option<PtyBroker>,
}

/// Fork the command and wait for its readiness byte. By the time this
/// returns, the child has finished its session/group setup, so resolving it
/// to a process group cannot race the exec.
pub fn spawn(argv: &[String], mut pty: Option<PtyBroker>, make_group: bool) -> Result<Launched> {
    // CStrings are prepared on this side of the fork; the child must not
    // allocate.
    let program = CString::new(argv[0].as_str()).context("command contains a NUL byte")?;
    let args: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("argument contains a NUL byte")?;

    let (ready_r, ready_w) = unistd::pipe().context("readiness pipe")?;

    // SAFETY: the child performs only async-signal-safe work before exec and
    // leaves through _exit on every failure path.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Child => child_setup(pty.as_ref(), make_group, ready_r, ready_w, &program, &args),
        ForkResult::Parent { child } => {
            drop(ready_w);
            let mut pipe = File::from(ready_r);
            let mut byte = [0u8; 1];
            loop {
                match pipe.read(&mut byte) {
                    // One byte means ready; EOF means the child died first,
                    // which the reaper will report through the exit status.
                    Ok(_) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e).context("readiness handshake"),
                }
            }
            if let Some(broker) = pty.as_mut() {
                broker.finish_handshake()?;
            }
            Ok(Launched { pid: child, pty })
        }
    }
}

/// Child side of the fork. Diverges: either the exec replaces this image or
/// `_exit` ends it, so nothing of the parent's state ever unwinds here.
fn child_setup(
    pty: Option<&PtyBroker>,
    make_group: bool,
    ready_r: OwnedFd,
    ready_w: OwnedFd,
    program: &CString,
    args: &[CString],
) -> ! {
    // The new image starts from default dispositions, not whatever the
    // controller had installed at fork time.
    for sig in reset_signals() {
        // SAFETY: restoring the default disposition installs no handler code
        unsafe {
            let _ = signal::signal(sig, SigHandler::SigDfl);
        }
    }

    let ready_w_raw = ready_w.as_raw_fd();
    // SAFETY: raw descriptor plumbing between fork and exec
    unsafe {
        libc::close(ready_r.as_raw_fd());

        if let Some(broker) = pty {
            libc::close(broker.master_raw());
            // New session first; adopting the slave as controlling terminal
            // anchors the session to the pty.
            if libc::setsid() < 0 {
                libc::_exit(1);
            }
            let slave = broker.slave_raw();
            if libc::ioctl(slave, libc::TIOCSCTTY, 0) < 0 {
                // Some kernels attach the first opened tty implicitly.
            }
            if let Some(term) = broker.term_raw() {
                if let Some(ws) = pty::winsize_of(&term) {
                    let _ = pty::set_winsize(&slave, &ws);
                }
            }
            {
                // SAFETY: the broker keeps the slave open until we close it
                let fd = std::os::fd::BorrowedFd::borrow_raw(slave);
                if pty::set_raw(&fd).is_err() {
                    libc::_exit(1);
                }
            }
            libc::close(slave);
        } else if make_group && libc::setpgid(0, 0) < 0 {
            libc::_exit(1);
        }

        // Session and group are in place; let the parent proceed.
        libc::write(ready_w_raw, b"x".as_ptr().cast(), 1);
        libc::close(ready_w_raw);
    }

    let err = match unistd::execvp(program, args) {
        Ok(infallible) => match infallible {},
        Err(e) => e,
    };
    // The parent adopts this as the child's exit status.
    // SAFETY: _exit skips atexit handlers and the parent's stdio buffers
    unsafe { libc::_exit(err as i32) }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn reset_signals() -> [Signal; 4] {
    [Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1, Signal::SIGINFO]
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn reset_signals() -> [Signal; 3] {
    [Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1]
}
