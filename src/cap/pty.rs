use std::io::IsTerminal;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::{getpgrp, tcgetpgrp};

/// Find the first standard stream that refers to a terminal and clone its
/// descriptor. Input is preferred over diagnostics over output: an
/// interactive run redirecting stdout should still see its real terminal.
pub fn reference_terminal() -> Option<OwnedFd> {
    let raw: RawFd = if std::io::stdin().is_terminal() {
        libc::STDIN_FILENO
    } else if std::io::stderr().is_terminal() {
        libc::STDERR_FILENO
    } else if std::io::stdout().is_terminal() {
        libc::STDOUT_FILENO
    } else {
        return None;
    };
    // SAFETY: the standard descriptors outlive the process
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
    fd.try_clone_to_owned().ok()
}

/// Whether our process group owns the terminal right now.
pub fn is_foreground(term: &OwnedFd) -> bool {
    tcgetpgrp(term).map(|pg| pg == getpgrp()).unwrap_or(false)
}

pub fn winsize_of<F: AsRawFd>(fd: &F) -> Option<Winsize> {
    let mut ws = Winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };
    // SAFETY: TIOCGWINSZ fills a valid Winsize
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    (rc == 0).then_some(ws)
}

pub fn set_winsize<F: AsRawFd>(fd: &F, ws: &Winsize) -> bool {
    // SAFETY: TIOCSWINSZ reads from a valid Winsize
    unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, ws) == 0 }
}

pub fn set_raw<F: AsFd>(fd: &F) -> Result<()> {
    let mut attrs = tcgetattr(fd).context("tcgetattr")?;
    cfmakeraw(&mut attrs);
    tcsetattr(fd, SetArg::TCSANOW, &attrs).context("tcsetattr")?;
    Ok(())
}

/// A pty pair plus the bookkeeping around it. The master stays with the
/// controller; the slave lives just long enough for the child to adopt it as
/// controlling terminal, then both sides close their copy so the child's
/// exit releases the pty.
pub struct PtyBroker {
    master: Option<OwnedFd>,
    slave: Option<OwnedFd>,
    term: Option<OwnedFd>,
    saved: Option<(OwnedFd, Termios)>,
}

impl PtyBroker {
    /// Allocate the pair, sized like the reference terminal when there is
    /// one. A foreground controller with a terminal on stdin also captures
    /// the termios to put back at exit: the throttled child shares the real
    /// terminal through its inherited stdio and may die mid-escape-sequence.
    pub fn allocate(term: Option<OwnedFd>, foreground: bool) -> Result<Self> {
        let ws = term.as_ref().and_then(winsize_of);
        let pty = openpty(ws.as_ref(), None).context("pty allocation")?;

        let saved = if foreground && std::io::stdin().is_terminal() {
            // SAFETY: stdin outlives the process
            let stdin = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
            let fd = stdin.try_clone_to_owned().context("clone stdin")?;
            let attrs = tcgetattr(&fd).context("capture terminal attributes")?;
            Some((fd, attrs))
        } else {
            None
        };

        Ok(Self {
            master: Some(pty.master),
            slave: Some(pty.slave),
            term,
            saved,
        })
    }

    pub fn master_raw(&self) -> RawFd {
        self.master.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }

    pub fn slave_raw(&self) -> RawFd {
        self.slave.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }

    pub fn term_raw(&self) -> Option<RawFd> {
        self.term.as_ref().map(|f| f.as_raw_fd())
    }

    /// Parent side once the child confirmed its session setup: the slave
    /// belongs to the child now, and the master goes raw so it never mangles
    /// what the child writes to its controlling terminal.
    pub fn finish_handshake(&mut self) -> Result<()> {
        self.slave.take();
        if let Some(master) = &self.master {
            set_raw(master).context("raw mode on pty master")?;
        }
        Ok(())
    }

    /// Mirror the real terminal's current window size into the pty.
    pub fn sync_winsize(&self) {
        let (Some(term), Some(master)) = (&self.term, &self.master) else {
            return;
        };
        if let Some(ws) = winsize_of(term) {
            let _ = set_winsize(master, &ws);
        }
    }

    pub fn close_master(&mut self) {
        self.master.take();
    }

    /// Put the terminal back the way we found it. Runs at most once.
    pub fn restore_termios(&mut self) {
        if let Some((fd, attrs)) = self.saved.take() {
            let _ = tcsetattr(&fd, SetArg::TCSADRAIN, &attrs);
        }
    }
}
