//! Shared test utilities for flowprobe tests.
//!
//! Provides [`FakeEngine`], a throwaway `/bin/sh` script that stands in for
//! the real engine. Each script lives in its own temp directory and leaves
//! a trail there that tests can inspect afterwards:
//!
//! - `pid`: the script's pid (stable across `exec`)
//! - `args`: one argument per line
//! - `stdin`: everything written to its stdin
//! - `home.toml`: a copy of `<--home>/edgelinkd.toml`, if one was passed

use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;

/// Frame a JSON value the way the engine does on stdout.
pub fn frame(value: &Value) -> Vec<u8> {
    let mut out = vec![0x1E];
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'\n');
    out
}

/// Concatenate the frames for `values`.
pub fn frames(values: &[Value]) -> Vec<u8> {
    values.iter().flat_map(frame).collect()
}

/// What the fake engine does after writing its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// Exit with the given code, closing stdout.
    Exit(i32),
    /// Keep running until SIGINT, then exit 0.
    AwaitInterrupt,
    /// Ignore SIGINT and keep running until killed.
    IgnoreInterrupt,
    /// Replace the shell with a long `sleep`; never writes again.
    Hang,
}

const PROLOGUE: &str = r#"#!/bin/sh
here="$(dirname "$0")"
echo $$ > "$here/pid"
printf '%s\n' "$@" > "$here/args"
prev=""
for a in "$@"; do
    if [ "$prev" = "--home" ]; then
        cp "$a/edgelinkd.toml" "$here/home.toml" 2>/dev/null
    fi
    prev="$a"
done
echo "fake engine starting" >&2
"#;

/// A scripted stand-in for the engine binary.
pub struct FakeEngine {
    dir: TempDir,
    path: PathBuf,
}

impl FakeEngine {
    /// Read all of stdin, write `output` to stdout, then do `ending`.
    pub fn new(output: &[u8], ending: Ending) -> Self {
        let engine = Self::empty();
        std::fs::write(engine.dir.path().join("out"), output).expect("write fake output");

        let trap = match ending {
            Ending::AwaitInterrupt => "trap 'exit 0' INT\n",
            Ending::IgnoreInterrupt => "trap '' INT\n",
            Ending::Exit(_) | Ending::Hang => "",
        };
        let tail = match ending {
            Ending::Exit(code) => format!("exit {code}\n"),
            Ending::AwaitInterrupt | Ending::IgnoreInterrupt => {
                "while :; do sleep 0.05; done\n".to_string()
            }
            Ending::Hang => "exec sleep 30\n".to_string(),
        };
        engine.install(&format!(
            "{trap}cat > \"$here/stdin\"\ncat \"$here/out\"\n{tail}"
        ));
        engine
    }

    /// Emit `values` as frames and wait to be interrupted.
    pub fn emitting(values: &[Value]) -> Self {
        Self::new(&frames(values), Ending::AwaitInterrupt)
    }

    /// Echo every input frame after the flows frame back as output, so each
    /// injection comes back as one event.
    pub fn echo() -> Self {
        let engine = Self::empty();
        engine.install(
            "trap 'exit 0' INT\n\
             cat > \"$here/stdin\"\n\
             sed 1d \"$here/stdin\"\n\
             while :; do sleep 0.05; done\n",
        );
        engine
    }

    /// Never read stdin, never write stdout.
    pub fn silent() -> Self {
        let engine = Self::empty();
        engine.install("exec sleep 30\n");
        engine
    }

    /// Arbitrary script body, run after the common prologue.
    pub fn script(body: &str) -> Self {
        let engine = Self::empty();
        engine.install(body);
        engine
    }

    fn empty() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("fake-engine-")
            .tempdir()
            .expect("create fake engine dir");
        let path = dir.path().join("edgelinkd");
        Self { dir, path }
    }

    fn install(&self, body: &str) {
        std::fs::write(&self.path, format!("{PROLOGUE}{body}")).expect("write fake engine");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod fake engine");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Pid the script recorded, once it has started.
    pub fn recorded_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.dir.path().join("pid"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn recorded_args(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("args"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn recorded_stdin(&self) -> Vec<u8> {
        std::fs::read(self.dir.path().join("stdin")).unwrap_or_default()
    }

    /// The runtime config the engine found in its home directory.
    pub fn recorded_home_config(&self) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join("home.toml")).ok()
    }
}

/// `true` while a process with this pid exists (zombies included).
#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}
