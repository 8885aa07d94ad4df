#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use sandbox::IsolateConfig;
use tempfile::TempDir;

/// Behaviour switch baked into the fake `isolate` script.
#[derive(Debug, Clone, Copy)]
pub enum Mode {
    Normal,
    FailInit,
    FailCleanup,
    MalformedMeta,
    /// The tool deletes itself after the first `--init`, so later runs cannot spawn it.
    VanishAfterInit,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::FailInit => "fail-init",
            Mode::FailCleanup => "fail-cleanup",
            Mode::MalformedMeta => "malformed-meta",
            Mode::VanishAfterInit => "vanish-after-init",
        }
    }
}

const SCRIPT: &str = r#"#!/bin/sh
ROOT='@ROOT@'
MODE='@MODE@'
box=0
meta=
wall=
action=
while [ "$#" -gt 0 ]; do
  case "$1" in
    --version) echo "The process isolator 2.0 (fake)"; exit 0 ;;
    --box-id=*) box="${1#--box-id=}" ;;
    --meta=*) meta="${1#--meta=}" ;;
    --wall-time=*) wall="${1#--wall-time=}" ;;
    --init) action=init ;;
    --cleanup) action=cleanup ;;
    --run) action=run ;;
    --) shift; break ;;
  esac
  shift
done
case "$action" in
  cleanup)
    if [ "$MODE" = fail-cleanup ] && [ -d "$ROOT/$box" ]; then
      echo "Cannot remove box" >&2; exit 2
    fi
    rm -rf "$ROOT/$box"
    exit 0 ;;
  init)
    if [ "$MODE" = fail-init ]; then echo "Box already exists" >&2; exit 2; fi
    mkdir -p "$ROOT/$box/box" || exit 2
    echo "$ROOT/$box"
    if [ "$MODE" = vanish-after-init ]; then rm -f "$0"; fi
    exit 0 ;;
  run)
    cd "$ROOT/$box/box" || exit 2
    if [ -n "$wall" ]; then timeout "$wall" "$@"; else "$@"; fi
    code=$?
    if [ "$MODE" = malformed-meta ]; then
      printf 'time:0.001\ngarbage\n' > "$meta"
      exit 0
    fi
    {
      printf 'time:0.004\ntime-wall:0.010\nmax-rss:1536\ncsw-voluntary:2\ncsw-forced:1\ncg-mem:2048\n'
      if [ "$code" -eq 124 ]; then
        printf 'status:TO\nmessage:Time limit exceeded (wall clock)\n'
      else
        printf 'exitcode:%s\n' "$code"
        if [ "$code" -ne 0 ]; then
          printf 'status:RE\nmessage:Exited with error status %s\n' "$code"
        fi
      fi
    } > "$meta"
    [ "$code" -eq 0 ] || exit 1
    exit 0 ;;
esac
echo "unknown invocation" >&2
exit 2
"#;

/// A fake `isolate` executable plus the directory it keeps its boxes in.
pub struct FakeIsolate {
    dir: TempDir,
}

impl FakeIsolate {
    pub fn new(mode: Mode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("boxes")).unwrap();
        fs::create_dir(dir.path().join("meta")).unwrap();
        let script = SCRIPT
            .replace("@ROOT@", &dir.path().join("boxes").display().to_string())
            .replace("@MODE@", mode.as_str());
        let path = dir.path().join("isolate");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        wait_until_executable(&path);
        Self { dir }
    }

    pub fn config(&self) -> IsolateConfig {
        IsolateConfig {
            executable: self.dir.path().join("isolate"),
            meta_dir: self.meta_dir(),
            ..IsolateConfig::default()
        }
    }

    pub fn box_root(&self, box_id: u32) -> PathBuf {
        self.dir.path().join("boxes").join(box_id.to_string())
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.dir.path().join("meta")
    }

    pub fn leftover_meta_files(&self) -> usize {
        count_entries(&self.meta_dir())
    }
}

// A process forked by a concurrent test may still hold the write descriptor of a
// freshly written script for a moment; exec then fails with ETXTBSY.
fn wait_until_executable(path: &Path) {
    for _ in 0..50 {
        match Command::new(path).arg("--version").output() {
            Ok(_) => return,
            Err(err) if err.raw_os_error() == Some(26) => thread::sleep(Duration::from_millis(10)),
            Err(err) => panic!("fake isolate not executable: {err}"),
        }
    }
    panic!("fake isolate stayed busy");
}

fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| (*arg).to_owned()).collect()
}
