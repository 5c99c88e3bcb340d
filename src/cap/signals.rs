use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::cap::resolve::Target;

/// Send `sig` to every target in the set and report how many deliveries
/// succeeded. A negative target signals its whole process group (kernel
/// semantics). Partial failure is normal: processes exit and the set erodes.
/// Identifiers 0 and ±1 are never signalled, no matter how they got here.
pub fn send_to_set(set: &[Target], sig: Signal, verbose: bool) -> usize {
    let mut delivered = 0;
    for &t in set {
        if t.raw().abs() <= 1 {
            continue;
        }
        match kill(Pid::from_raw(t.raw()), sig) {
            Ok(()) => delivered += 1,
            Err(Errno::ESRCH) => {}
            Err(e) => {
                if verbose {
                    eprintln!("cpucap: {} -> {}: {}", sig.as_str(), t, e);
                }
            }
        }
    }
    delivered
}

/// Zero-signal probe: does the identifier still name a live process or
/// group? EPERM means yes, just not ours.
pub fn alive(t: Target) -> bool {
    if t.raw().abs() <= 1 {
        return false;
    }
    matches!(kill(Pid::from_raw(t.raw()), None), Ok(()) | Err(Errno::EPERM))
}

/// Translate a reaped wait status into the exit code the controller adopts:
/// the exit code for a normal exit, the signal number for a killed child.
/// Stops and continues are not exits.
pub fn exit_code_of(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(sig as i32),
        _ => None,
    }
}
