use std::process::Command;

/// Set by packaging jobs that build from a source tarball without `.git`.
const SHA_OVERRIDE: &str = "SETTLEMENT_BUILD_SHA";

fn main() {
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", utc_now());

    let git_sha = std::env::var(SHA_OVERRIDE)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| run("git", &["rev-parse", "--short", "HEAD"]))
        .unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=BUILD_GIT_SHA={git_sha}");

    println!("cargo:rerun-if-env-changed={SHA_OVERRIDE}");
    println!("cargo:rerun-if-changed=.git/HEAD");
}

fn utc_now() -> String {
    run("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]).unwrap_or_else(|| "unknown".into())
}

/// Trimmed stdout of a successful command.
fn run(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
