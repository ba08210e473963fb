use std::path::{Path, PathBuf};

use rtc_core::paths::{CONFIG_FILE, RTC_DIR};

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `RTC_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `rtc.yaml` or `.rtc/`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    find_upward(&cwd, |dir| {
        dir.join(CONFIG_FILE).is_file() || dir.join(RTC_DIR).is_dir()
    })
    .or_else(|| find_upward(&cwd, |dir| dir.join(".git").is_dir()))
    .unwrap_or(cwd)
}

fn find_upward(start: &Path, matches: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| matches(dir))
        .map(Path::to_path_buf)
}
