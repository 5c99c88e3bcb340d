use std::time::Duration;

use anyhow::{ensure, Context, Result};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as unix_signal, Signal as SignalStream, SignalKind};

use crate::cap::config::{Config, Mode, Tri, TtyMode};
use crate::cap::inspect::{Inspector, KernelInspector};
use crate::cap::launch;
use crate::cap::pty::{self, PtyBroker};
use crate::cap::resolve::{self, Target};
use crate::cap::signals;

/// Run a validated configuration to completion and return the process exit
/// code. Forks (in launch mode) before the runtime exists, drives the duty
/// cycle on a single-thread runtime, and guarantees cleanup on every path.
pub fn run(cfg: Config) -> Result<i32> {
    let inspector: Box<dyn Inspector> = Box::new(KernelInspector::probe());

    if cfg.verbose {
        eprintln!(
            "cpucap: limit={:.1}% run={:.3}s stop={:.3}s",
            cfg.limit_pct,
            cfg.run.as_secs_f64(),
            cfg.stop.as_secs_f64()
        );
    }

    if cfg.dry_run {
        return dry_run(&cfg, inspector.as_ref());
    }

    let mut ctrl = Controller::start(cfg, inspector)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?;
    let outcome = rt.block_on(ctrl.supervise());
    drop(rt);

    ctrl.cleanup();

    if let Some(sig) = ctrl.pending {
        reraise(sig);
        // Only reached when the re-raise failed to end us; report the
        // conventional wait-status number instead.
        return Ok(128 + sig as i32);
    }
    outcome
}

/// Dry run: say what would happen, touch nothing. No fork, no signals.
fn dry_run(cfg: &Config, insp: &dyn Inspector) -> Result<i32> {
    match &cfg.mode {
        Mode::Launch(argv) => println!("{}", argv.join(" ")),
        Mode::Attach(list) => {
            let group = matches!(cfg.group, Tri::On);
            let set = resolve::resolve(list, group, cfg.children, insp)?;
            println!("{}", resolve::format_set(&set));
        }
    }
    Ok(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Tick,
    Shutdown,
}

struct Controller {
    cfg: Config,
    inspector: Box<dyn Inspector>,
    /// What the user (or the launch) named; liveness probes use these.
    originals: Vec<Target>,
    /// The set most recently sent a STOP; cleanup releases exactly these.
    last_set: Vec<Target>,
    launched: bool,
    child: Option<Pid>,
    child_code: Option<i32>,
    pty: Option<PtyBroker>,
    group: bool,
    any_stop: bool,
    pending: Option<Signal>,
    foreground: bool,
    cleaned: bool,
}

impl Controller {
    fn start(cfg: Config, inspector: Box<dyn Inspector>) -> Result<Self> {
        match cfg.mode.clone() {
            Mode::Attach(list) => Ok(Self {
                originals: list,
                last_set: Vec::new(),
                launched: false,
                child: None,
                child_code: None,
                pty: None,
                group: matches!(cfg.group, Tri::On),
                any_stop: false,
                pending: None,
                foreground: false,
                cleaned: false,
                inspector,
                cfg,
            }),
            Mode::Launch(argv) => {
                let term = pty::reference_terminal();
                let foreground = term.as_ref().map(pty::is_foreground).unwrap_or(false);
                let use_pty = match cfg.tty {
                    TtyMode::Off => false,
                    TtyMode::Auto => term.is_some(),
                    TtyMode::Force => {
                        ensure!(
                            term.is_some(),
                            "-t needs a terminal on stdin, stderr or stdout; repeat -t to force a pty anyway"
                        );
                        true
                    }
                    TtyMode::ForceAlways => true,
                };
                let broker = if use_pty {
                    Some(PtyBroker::allocate(term, foreground)?)
                } else {
                    None
                };
                // Without a pty the child gets its own plain process group
                // instead of a session, unless -G said otherwise.
                let make_group = !matches!(cfg.group, Tri::Off) && broker.is_none();
                let launched = launch::spawn(&argv, broker, make_group)?;
                if cfg.verbose {
                    eprintln!("cpucap: launched pid {}", launched.pid);
                }
                Ok(Self {
                    originals: vec![Target(launched.pid.as_raw())],
                    last_set: Vec::new(),
                    launched: true,
                    child: Some(launched.pid),
                    child_code: None,
                    pty: launched.pty,
                    // Widening to the group is implicit for a launched child;
                    // only an explicit -G keeps it off.
                    group: !matches!(cfg.group, Tri::Off),
                    any_stop: false,
                    pending: None,
                    foreground,
                    cleaned: false,
                    inspector,
                    cfg,
                })
            }
        }
    }

    async fn supervise(&mut self) -> Result<i32> {
        let mut sigs = Streams::install(self.launched)?;

        // A fast child can exit before the CHLD stream existed; check once
        // so the first sleep cannot outlive the whole run.
        if self.reap_children() {
            return Ok(self.exit_code());
        }

        let (run_d, stop_d) = (self.cfg.run, self.cfg.stop);
        loop {
            if self.pause(run_d, &mut sigs).await == Flow::Shutdown {
                break;
            }

            let set = match self.resolve_current() {
                Ok(set) => set,
                Err(e) => {
                    eprintln!("cpucap: process table scan failed: {e:#}; skipping tick");
                    continue;
                }
            };
            if set.is_empty() {
                if self.cfg.verbose {
                    eprintln!("cpucap: target set is empty; done");
                }
                break;
            }
            if signals::send_to_set(&set, Signal::SIGSTOP, self.cfg.verbose) == 0 {
                break;
            }
            self.any_stop = true;
            self.last_set = set;

            if self.pause(stop_d, &mut sigs).await == Flow::Shutdown {
                break;
            }
            if signals::send_to_set(&self.last_set, Signal::SIGCONT, self.cfg.verbose) == 0 {
                break;
            }

            if !self.launched && !self.originals.iter().any(|&t| signals::alive(t)) {
                if self.cfg.verbose {
                    eprintln!("cpucap: no attached process is left; done");
                }
                break;
            }
        }

        self.final_reap();
        Ok(self.exit_code())
    }

    /// Sleep for one phase of the duty cycle while servicing signals. The
    /// deadline survives handler work: a WINCH halfway through the stop
    /// phase does not stretch the schedule.
    async fn pause(&mut self, dur: Duration, sigs: &mut Streams) -> Flow {
        let timer = tokio::time::sleep(dur);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return Flow::Tick,
                _ = sigs.int.recv() => {
                    self.pending = Some(Signal::SIGINT);
                    return Flow::Shutdown;
                }
                _ = sigs.term.recv() => {
                    self.pending = Some(Signal::SIGTERM);
                    return Flow::Shutdown;
                }
                _ = sigs.usr1.recv() => self.report_status(),
                _ = recv_opt(&mut sigs.info) => self.report_status(),
                _ = recv_opt(&mut sigs.chld) => {
                    if self.reap_children() {
                        return Flow::Shutdown;
                    }
                }
                _ = recv_opt(&mut sigs.tstp) => self.forward_stop(),
                _ = recv_opt(&mut sigs.cont) => self.forward_cont(),
                _ = recv_opt(&mut sigs.winch) => self.forward_winch(),
            }
        }
    }

    fn resolve_current(&self) -> Result<Vec<Target>> {
        let set = resolve::resolve(
            &self.originals,
            self.group,
            self.cfg.children,
            self.inspector.as_ref(),
        )?;
        if self.cfg.verbose {
            eprintln!("cpucap: targets {}", resolve::format_set(&set));
        }
        Ok(set)
    }

    /// Drain every pending child exit without blocking. Returns true once
    /// the launched child has been collected.
    fn reap_children(&mut self) -> bool {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(st) => {
                    if st.pid() == self.child {
                        if let Some(code) = signals::exit_code_of(st) {
                            self.child_code = Some(code);
                            self.child = None;
                        }
                    }
                }
                Err(_) => break,
            }
        }
        self.launched && self.child.is_none()
    }

    /// The duty loop can end with the child unreaped when delivery failed
    /// because it is already a zombie; collect the status it left behind.
    fn final_reap(&mut self) {
        if self.pending.is_some() {
            return;
        }
        if let Some(pid) = self.child {
            if let Ok(st) = waitpid(pid, None) {
                if let Some(code) = signals::exit_code_of(st) {
                    self.child_code = Some(code);
                    self.child = None;
                }
            }
        }
    }

    /// Terminal stop request: hand the stop intent to the subtree first
    /// (TSTP for the polite version, STOP so it sticks), then stop ourselves.
    fn forward_stop(&mut self) {
        if let Ok(set) = self.resolve_current() {
            if !set.is_empty() {
                signals::send_to_set(&set, Signal::SIGTSTP, self.cfg.verbose);
                if signals::send_to_set(&set, Signal::SIGSTOP, self.cfg.verbose) > 0 {
                    self.any_stop = true;
                }
                self.last_set = set;
            }
        }
        let _ = signal::raise(Signal::SIGSTOP);
    }

    /// We were resumed; resume whatever we had stopped.
    fn forward_cont(&mut self) {
        signals::send_to_set(&self.last_set, Signal::SIGCONT, self.cfg.verbose);
    }

    fn forward_winch(&mut self) {
        if let Some(broker) = &self.pty {
            broker.sync_winsize();
        }
        let set = if self.last_set.is_empty() {
            self.resolve_current().unwrap_or_default()
        } else {
            self.last_set.clone()
        };
        signals::send_to_set(&set, Signal::SIGWINCH, self.cfg.verbose);
    }

    fn report_status(&self) {
        let current = self.resolve_current().unwrap_or_default();
        eprintln!(
            "cpucap: limit={:.1}% pids={} targets={}",
            self.cfg.limit_pct,
            resolve::format_set(&self.originals),
            resolve::format_set(&current)
        );
    }

    fn exit_code(&self) -> i32 {
        self.child_code.unwrap_or(0)
    }

    /// Idempotent teardown, shared by the normal path, the interrupt path
    /// and the drop backstop.
    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        if let Some(broker) = &mut self.pty {
            broker.close_master();
        }
        if self.any_stop {
            // Whatever ends this run, nothing stays frozen behind us.
            signals::send_to_set(&self.last_set, Signal::SIGCONT, self.cfg.verbose);
        }
        if self.launched && self.foreground {
            if let Some(pid) = self.child {
                let _ = signal::kill(pid, Signal::SIGTERM);
            }
        }
        if let Some(broker) = &mut self.pty {
            broker.restore_termios();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // Backstop for panics and early error returns.
        self.cleanup();
    }
}

/// Re-deliver a caught INT/TERM to ourselves under the default disposition
/// so the parent shell observes the real wait-status.
fn reraise(sig: Signal) {
    // SAFETY: resetting to SigDfl installs no handler code
    unsafe {
        let _ = signal::signal(sig, SigHandler::SigDfl);
    }
    let _ = signal::raise(sig);
}

struct Streams {
    int: SignalStream,
    term: SignalStream,
    usr1: SignalStream,
    info: Option<SignalStream>,
    chld: Option<SignalStream>,
    tstp: Option<SignalStream>,
    cont: Option<SignalStream>,
    winch: Option<SignalStream>,
}

impl Streams {
    /// INT/TERM/USR1 (and INFO where it exists) are wired in both modes;
    /// job control, window and child signals only matter when we launched
    /// the target ourselves.
    fn install(launch_mode: bool) -> Result<Self> {
        Ok(Self {
            int: unix_signal(SignalKind::interrupt()).context("SIGINT handler")?,
            term: unix_signal(SignalKind::terminate()).context("SIGTERM handler")?,
            usr1: unix_signal(SignalKind::user_defined1()).context("SIGUSR1 handler")?,
            info: info_stream()?,
            chld: launch_mode
                .then(|| unix_signal(SignalKind::child()))
                .transpose()
                .context("SIGCHLD handler")?,
            tstp: launch_mode
                .then(|| unix_signal(SignalKind::from_raw(libc::SIGTSTP)))
                .transpose()
                .context("SIGTSTP handler")?,
            cont: launch_mode
                .then(|| unix_signal(SignalKind::from_raw(libc::SIGCONT)))
                .transpose()
                .context("SIGCONT handler")?,
            winch: launch_mode
                .then(|| unix_signal(SignalKind::window_change()))
                .transpose()
                .context("SIGWINCH handler")?,
        })
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn info_stream() -> Result<Option<SignalStream>> {
    Ok(Some(
        unix_signal(SignalKind::from_raw(libc::SIGINFO)).context("SIGINFO handler")?,
    ))
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn info_stream() -> Result<Option<SignalStream>> {
    Ok(None)
}

/// Await a signal on an optional stream; absent streams never fire.
async fn recv_opt(slot: &mut Option<SignalStream>) {
    match slot {
        Some(stream) => {
            if stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
