use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

// Stamp the binary with when and where it was built; `cpucap -V` prints both.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // SOURCE_DATE_EPOCH wins so distro builds stay reproducible.
    let time = env::var("SOURCE_DATE_EPOCH")
        .map(|sde| format!("epoch:{sde}"))
        .ok()
        .or_else(|| stdout_of("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]))
        .unwrap_or_else(|| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            format!("epoch:{secs}")
        });

    let host = env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| stdout_of("hostname", &[]))
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=CPUCAP_BUILD_TIME={time}");
    println!("cargo:rustc-env=CPUCAP_BUILD_HOST={host}");
}

fn stdout_of(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!s.is_empty()).then_some(s)
}
