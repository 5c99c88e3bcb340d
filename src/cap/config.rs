use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::cap::cli::Args;
use crate::cap::resolve::Target;

const DEFAULT_LIMIT_PCT: f64 = 50.0;
const DEFAULT_RUN_SECS: f64 = 1.0;

/// Tri-state for flags that distinguish "user said nothing" from an explicit
/// choice. Launch mode flips the group default after the fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    Default,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtyMode {
    /// Allocate a pty when some standard stream is a terminal.
    Auto,
    /// Require a pty; fails when no terminal can be found to model it on.
    Force,
    /// Allocate a pty even when no standard stream is a terminal.
    ForceAlways,
    Off,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Launch(Vec<String>),
    Attach(Vec<Target>),
}

/// Validated, normalized configuration. Created once by the CLI layer and
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub limit_pct: f64,
    pub run: Duration,
    pub stop: Duration,
    pub group: Tri,
    pub children: bool,
    pub tty: TtyMode,
    pub verbose: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    pub limit_pct: f64,
    pub run_secs: f64,
    pub stop_secs: f64,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        let sched = derive_schedule(args.limit, args.run, args.stop)?;

        let mode = match (args.command.is_empty(), args.pids.is_empty()) {
            (true, true) => bail!("nothing to throttle; give -p PIDS or a command after the options"),
            (false, false) => bail!("-p cannot be combined with a command to launch"),
            (false, true) => Mode::Launch(args.command.clone()),
            (true, false) => {
                let targets = normalize_targets(&args.pids)?;
                probe_targets(&targets)?;
                Mode::Attach(targets)
            }
        };

        let group = if args.group {
            Tri::On
        } else if args.no_group {
            Tri::Off
        } else {
            Tri::Default
        };

        let tty = if args.no_tty {
            TtyMode::Off
        } else {
            match args.tty {
                0 => TtyMode::Auto,
                1 => TtyMode::Force,
                _ => TtyMode::ForceAlways,
            }
        };

        Ok(Self {
            mode,
            limit_pct: sched.limit_pct,
            run: Duration::from_secs_f64(sched.run_secs),
            stop: Duration::from_secs_f64(sched.stop_secs),
            group,
            children: args.children,
            tty,
            verbose: args.verbose,
            dry_run: args.dry_run,
        })
    }
}

/// Turn the (limit, run, stop) triple into a complete schedule. At most two
/// may be supplied; the third is derived so that run/(run+stop) equals
/// limit/100.
pub fn derive_schedule(limit: Option<f64>, run: Option<f64>, stop: Option<f64>) -> Result<Schedule> {
    ensure!(
        !(limit.is_some() && run.is_some() && stop.is_some()),
        "-l, -r and -s together over-determine the schedule; give at most two"
    );
    let limit = limit.map(normalize_limit).transpose()?;
    if let Some(r) = run {
        ensure!(r.is_finite() && r > 0.0, "-r {r}: must be a positive number of seconds");
    }
    if let Some(s) = stop {
        ensure!(s.is_finite() && s > 0.0, "-s {s}: must be a positive number of seconds");
    }

    let (limit_pct, run_secs, stop_secs) = match (limit, run, stop) {
        (None, Some(r), Some(s)) => (100.0 * r / (r + s), r, s),
        (l, Some(r), None) => {
            let l = l.unwrap_or(DEFAULT_LIMIT_PCT);
            (l, r, r * (100.0 / l - 1.0))
        }
        (l, None, Some(s)) => {
            let l = l.unwrap_or(DEFAULT_LIMIT_PCT);
            (l, s * l / (100.0 - l), s)
        }
        (l, None, None) => {
            let l = l.unwrap_or(DEFAULT_LIMIT_PCT);
            (l, DEFAULT_RUN_SECS, DEFAULT_RUN_SECS * (100.0 / l - 1.0))
        }
        (Some(_), Some(_), Some(_)) => unreachable!("rejected above"),
    };

    Ok(Schedule { limit_pct, run_secs, stop_secs })
}

fn normalize_limit(l: f64) -> Result<f64> {
    // A bare fraction like 0.2 means 20%. Exactly 1 stays 1 percent.
    let pct = if l > 0.0 && l < 1.0 { l * 100.0 } else { l };
    ensure!(
        pct.is_finite() && (1.0..=99.0).contains(&pct),
        "-l {l}: limit must fall within 1..=99 percent"
    );
    Ok(pct)
}

/// Deduplicate and range-check the user's identifier list. Positive entries
/// are PIDs, negative entries whole process groups; 0 and ±1 never qualify.
fn normalize_targets(raw: &[i64]) -> Result<Vec<Target>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for &p in raw {
        ensure!(
            p.abs() > 1,
            "-p {p}: process 0 and 1 (and their groups) cannot be throttled"
        );
        ensure!(
            i32::try_from(p).is_ok(),
            "-p {p}: outside the range of process identifiers"
        );
        if seen.insert(p) {
            out.push(Target(p as i32));
        }
    }
    Ok(out)
}

/// Zero-signal probe of every requested identifier. EPERM still means the
/// process exists, it just is not ours to signal yet.
fn probe_targets(targets: &[Target]) -> Result<()> {
    for &t in targets {
        match kill(Pid::from_raw(t.raw()), None) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => bail!("-p {t}: no such process"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn limit_and_run_derive_stop() {
        let s = derive_schedule(Some(25.0), Some(1.0), None).unwrap();
        assert!(close(s.stop_secs, 3.0));
        assert!(close(s.limit_pct, 25.0));
    }

    #[test]
    fn limit_alone_uses_default_run() {
        let s = derive_schedule(Some(50.0), None, None).unwrap();
        assert!(close(s.run_secs, 1.0));
        assert!(close(s.stop_secs, 1.0));
    }

    #[test]
    fn nothing_supplied_means_fifty_fifty() {
        let s = derive_schedule(None, None, None).unwrap();
        assert!(close(s.limit_pct, 50.0));
        assert!(close(s.run_secs, 1.0));
        assert!(close(s.stop_secs, 1.0));
    }

    #[test]
    fn extreme_limits_stay_positive() {
        let s = derive_schedule(Some(1.0), Some(1.0), None).unwrap();
        assert!(close(s.stop_secs, 99.0));

        let s = derive_schedule(Some(99.0), Some(1.0), None).unwrap();
        assert!(close(s.stop_secs, 1.0 / 99.0));
    }

    #[test]
    fn run_and_stop_derive_limit() {
        let s = derive_schedule(None, Some(1.0), Some(3.0)).unwrap();
        assert!(close(s.limit_pct, 25.0));
    }

    #[test]
    fn stop_alone_derives_run_from_default_limit() {
        let s = derive_schedule(None, None, Some(2.0)).unwrap();
        assert!(close(s.limit_pct, 50.0));
        assert!(close(s.run_secs, 2.0));
    }

    #[test]
    fn fractions_scale_to_percent() {
        let s = derive_schedule(Some(0.5), None, None).unwrap();
        assert!(close(s.limit_pct, 50.0));
    }

    #[test]
    fn all_three_is_ambiguous() {
        let err = derive_schedule(Some(50.0), Some(1.0), Some(1.0)).unwrap_err();
        assert!(err.to_string().contains("over-determine"));
    }

    #[test]
    fn out_of_range_limits_rejected() {
        assert!(derive_schedule(Some(0.0), None, None).is_err());
        assert!(derive_schedule(Some(100.0), None, None).is_err());
        assert!(derive_schedule(Some(99.5), None, None).is_err());
        assert!(derive_schedule(Some(-20.0), None, None).is_err());
        assert!(derive_schedule(Some(f64::NAN), None, None).is_err());
    }

    #[test]
    fn nonpositive_durations_rejected() {
        assert!(derive_schedule(None, Some(0.0), None).is_err());
        assert!(derive_schedule(None, None, Some(-1.0)).is_err());
    }

    #[test]
    fn target_list_deduplicates_and_keeps_order() {
        let t = normalize_targets(&[42, -300, 42, 77]).unwrap();
        assert_eq!(t, vec![Target(42), Target(-300), Target(77)]);
    }

    #[test]
    fn init_and_kernel_ids_rejected() {
        for bad in [0i64, 1, -1] {
            assert!(normalize_targets(&[bad]).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn own_pid_survives_the_probe() {
        let me = std::process::id() as i32;
        probe_targets(&[Target(me)]).unwrap();
    }

    #[test]
    fn bogus_pid_fails_the_probe() {
        // PID_MAX on Linux is < 2^22 by default; this one will not exist.
        let err = probe_targets(&[Target(i32::MAX - 1)]).unwrap_err();
        assert!(err.to_string().contains("no such process"));
    }

    #[test]
    fn launch_and_attach_are_exclusive() {
        let args = Args::try_parse_from(["cpucap", "-p", "1234", "sleep", "5"]).unwrap();
        let err = Config::from_args(&args).unwrap_err();
        assert!(err.to_string().contains("cannot be combined"));
    }

    #[test]
    fn some_mode_is_required() {
        let args = Args::try_parse_from(["cpucap", "-l", "20"]).unwrap();
        assert!(Config::from_args(&args).is_err());
    }

    #[test]
    fn tty_flag_count_maps_to_modes() {
        let args = Args::try_parse_from(["cpucap", "--", "true"]).unwrap();
        assert_eq!(Config::from_args(&args).unwrap().tty, TtyMode::Auto);

        let args = Args::try_parse_from(["cpucap", "-t", "--", "true"]).unwrap();
        assert_eq!(Config::from_args(&args).unwrap().tty, TtyMode::Force);

        let args = Args::try_parse_from(["cpucap", "-t", "-t", "--", "true"]).unwrap();
        assert_eq!(Config::from_args(&args).unwrap().tty, TtyMode::ForceAlways);

        let args = Args::try_parse_from(["cpucap", "-T", "--", "true"]).unwrap();
        assert_eq!(Config::from_args(&args).unwrap().tty, TtyMode::Off);
    }

    #[test]
    fn comma_separated_pids_parse() {
        let me = std::process::id() as i64;
        let group = nix::unistd::getpgrp().as_raw() as i64;
        let args =
            Args::try_parse_from(["cpucap", "-p", &format!("{me},-{group}")]).unwrap();
        let cfg = Config::from_args(&args).unwrap();
        match cfg.mode {
            Mode::Attach(ref t) => assert_eq!(t.len(), 2),
            _ => panic!("expected attach mode"),
        }
    }
}
