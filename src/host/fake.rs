//! Deterministic in-memory host
//!
//! [`FakeDeviceFs`] models just enough of `/dev` and `/sys` (directories,
//! symlinks, plain files) to drive the connectors without a kernel, and
//! records every write. [`FakeCommandRunner`] answers initiator commands from
//! a script and records every invocation.

use crate::domain::ports::{CommandOutput, CommandRunner, DeviceFs};
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Component, Path, PathBuf};

const MAX_SYMLINK_HOPS: usize = 40;

// =============================================================================
// Fake Device Filesystem
// =============================================================================

#[derive(Debug, Default)]
struct FsState {
    dirs: BTreeMap<PathBuf, BTreeSet<String>>,
    files: BTreeMap<PathBuf, Vec<u8>>,
    symlinks: BTreeMap<PathBuf, PathBuf>,
    writes: Vec<(PathBuf, Vec<u8>)>,
    failing_writes: BTreeSet<PathBuf>,
    stat_errors: BTreeMap<PathBuf, io::ErrorKind>,
    stat_calls: usize,
}

impl FsState {
    fn register(&mut self, path: &Path) {
        let mut child = path.to_path_buf();
        while let Some(parent) = child.parent() {
            if let Some(name) = child.file_name() {
                self.dirs
                    .entry(parent.to_path_buf())
                    .or_default()
                    .insert(name.to_string_lossy().to_string());
            }
            child = parent.to_path_buf();
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.dirs.contains_key(path) || self.files.contains_key(path)
    }

    fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
        let mut current = normalize(path);
        for _ in 0..MAX_SYMLINK_HOPS {
            match self.symlinks.get(&current) {
                Some(target) => {
                    let base = current.parent().unwrap_or_else(|| Path::new("/"));
                    current = normalize(&base.join(target));
                }
                None if self.exists(&current) => return Ok(current),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{}: no such file or directory", current.display()),
                    ))
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{}: too many levels of symbolic links", path.display()),
        ))
    }

    fn all_paths(&self) -> BTreeSet<PathBuf> {
        let mut paths = BTreeSet::new();
        for (dir, children) in &self.dirs {
            paths.insert(dir.clone());
            for child in children {
                paths.insert(dir.join(child));
            }
        }
        paths
    }
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// In-memory [`DeviceFs`]
#[derive(Debug, Default)]
pub struct FakeDeviceFs {
    state: Mutex<FsState>,
}

impl FakeDeviceFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory and its ancestors
    pub fn add_dir(&self, path: impl AsRef<Path>) -> &Self {
        let path = normalize(path.as_ref());
        let mut state = self.state.lock();
        state.register(&path);
        state.dirs.entry(path).or_default();
        self
    }

    /// Create a plain file
    pub fn add_file(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> &Self {
        let path = normalize(path.as_ref());
        let mut state = self.state.lock();
        state.register(&path);
        state.files.insert(path, contents.as_ref().to_vec());
        self
    }

    /// Create a symlink; relative targets resolve against the link's directory
    pub fn add_symlink(&self, link: impl AsRef<Path>, target: impl AsRef<Path>) -> &Self {
        let link = normalize(link.as_ref());
        let mut state = self.state.lock();
        state.register(&link);
        state.symlinks.insert(link, target.as_ref().to_path_buf());
        self
    }

    /// A SCSI disk: its `/dev` node and its sysfs `device/delete` control file
    pub fn add_scsi_disk(&self, name: &str) -> &Self {
        self.add_file(format!("/dev/{}", name), "");
        self.add_file(format!("/sys/block/{}/device/delete", name), "");
        self
    }

    /// A `dm-*` multipath device aggregating `slaves`
    pub fn add_multipath(&self, dm: &str, slaves: &[&str]) -> &Self {
        self.add_file(format!("/dev/{}", dm), "");
        self.add_dir(format!("/sys/block/{}/slaves", dm));
        for slave in slaves {
            self.add_symlink(
                format!("/sys/block/{}/slaves/{}", dm, slave),
                format!("../../{}", slave),
            );
        }
        self
    }

    /// A SCSI host adapter with its `scan` trigger
    pub fn add_scsi_host(&self, host: &str) -> &Self {
        self.add_file(format!("/sys/class/scsi_host/{}/scan", host), "")
    }

    /// Make writes to `path` fail with permission denied
    pub fn fail_writes_to(&self, path: impl AsRef<Path>) -> &Self {
        self.state.lock().failing_writes.insert(normalize(path.as_ref()));
        self
    }

    /// Make `stat` on `path` fail with `kind`
    pub fn fail_stat(&self, path: impl AsRef<Path>, kind: io::ErrorKind) -> &Self {
        self.state.lock().stat_errors.insert(normalize(path.as_ref()), kind);
        self
    }

    /// Remove a path (file, symlink, or directory entry)
    pub fn remove(&self, path: impl AsRef<Path>) -> &Self {
        let path = normalize(path.as_ref());
        let mut state = self.state.lock();
        state.files.remove(&path);
        state.symlinks.remove(&path);
        state.dirs.remove(&path);
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            if let Some(children) = state.dirs.get_mut(parent) {
                children.remove(&name.to_string_lossy().to_string());
            }
        }
        self
    }

    /// Every successful write, in order
    pub fn writes(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// Successful writes to `path`
    pub fn writes_to(&self, path: impl AsRef<Path>) -> Vec<Vec<u8>> {
        let path = normalize(path.as_ref());
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(p, _)| *p == path)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Number of `stat` calls so far
    pub fn stat_calls(&self) -> usize {
        self.state.lock().stat_calls
    }
}

impl DeviceFs for FakeDeviceFs {
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let state = self.state.lock();
        let dir = state.resolve(path)?;
        state
            .dirs
            .get(&dir)
            .map(|children| children.iter().cloned().collect())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}: not a directory", path.display()),
                )
            })
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        self.state.lock().resolve(path)
    }

    fn stat(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.stat_calls += 1;
        if let Some(kind) = state.stat_errors.get(&normalize(path)) {
            return Err(io::Error::new(*kind, format!("{}: stat failed", path.display())));
        }
        state.resolve(path).map(|_| ())
    }

    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let compiled = Pattern::new(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let state = self.state.lock();
        Ok(state
            .all_paths()
            .into_iter()
            .filter(|p| compiled.matches_path_with(p, options))
            .collect())
    }

    fn write(&self, path: &Path, data: &[u8], _mode: u32) -> io::Result<()> {
        let path = normalize(path);
        let mut state = self.state.lock();
        if state.failing_writes.contains(&path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{}: permission denied", path.display()),
            ));
        }
        let parent_exists = path.parent().map(|p| state.dirs.contains_key(p)).unwrap_or(false);
        if !parent_exists {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: no such file or directory", path.display()),
            ));
        }
        state.register(&path);
        state.files.insert(path.clone(), data.to_vec());
        state.writes.push((path, data.to_vec()));
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let state = self.state.lock();
        let resolved = state.resolve(path)?;
        let bytes = state.files.get(&resolved).ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, format!("{}: is a directory", path.display()))
        })?;
        String::from_utf8(bytes.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

// =============================================================================
// Fake Command Runner
// =============================================================================

/// One invocation seen by [`FakeCommandRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
}

impl RecordedCall {
    /// True if `tokens` appear as a contiguous run in the arguments
    pub fn has_args(&self, tokens: &[&str]) -> bool {
        contains_run(&self.args, tokens)
    }
}

#[derive(Debug)]
struct Rule {
    tokens: Vec<String>,
    response: Result<CommandOutput, io::ErrorKind>,
    remaining: Option<usize>,
}

fn contains_run(args: &[String], tokens: &[&str]) -> bool {
    if tokens.is_empty() {
        return true;
    }
    args.windows(tokens.len())
        .any(|window| window.iter().zip(tokens).all(|(a, t)| a == t))
}

/// Scripted [`CommandRunner`]
///
/// Rules are matched in insertion order against the argument list; a rule
/// matches when its tokens appear contiguously. Unmatched commands succeed
/// with empty output.
#[derive(Debug, Default)]
pub struct FakeCommandRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every matching command with `output`
    pub fn on(&self, tokens: &[&str], output: CommandOutput) -> &Self {
        self.push(tokens, Ok(output), None)
    }

    /// Answer only the next matching command with `output`
    pub fn on_once(&self, tokens: &[&str], output: CommandOutput) -> &Self {
        self.push(tokens, Ok(output), Some(1))
    }

    /// Fail to spawn every matching command
    pub fn on_spawn_error(&self, tokens: &[&str], kind: io::ErrorKind) -> &Self {
        self.push(tokens, Err(kind), None)
    }

    fn push(
        &self,
        tokens: &[&str],
        response: Result<CommandOutput, io::ErrorKind>,
        remaining: Option<usize>,
    ) -> &Self {
        self.rules.lock().push(Rule {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            response,
            remaining,
        });
        self
    }

    /// Every invocation, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Invocations whose arguments contain `tokens`
    pub fn calls_with(&self, tokens: &[&str]) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.has_args(tokens))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        self.calls.lock().push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
        });

        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if rule.remaining == Some(0) {
                continue;
            }
            let tokens: Vec<&str> = rule.tokens.iter().map(String::as_str).collect();
            if !contains_run(args, &tokens) {
                continue;
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return rule
                .response
                .clone()
                .map_err(|kind| io::Error::new(kind, format!("{}: spawn failed", program)));
        }

        Ok(CommandOutput::success(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symlink_resolution() {
        let fs = FakeDeviceFs::new();
        fs.add_scsi_disk("sdb");
        fs.add_symlink("/dev/disk/by-id/scsi-3600a0980", "../../sdb");

        assert_eq!(
            fs.canonicalize(Path::new("/dev/disk/by-id/scsi-3600a0980")).unwrap(),
            PathBuf::from("/dev/sdb")
        );
        assert_eq!(
            fs.read_dir(Path::new("/dev/disk/by-id")).unwrap(),
            vec!["scsi-3600a0980".to_string()]
        );
    }

    #[test]
    fn test_dangling_symlink_is_not_found() {
        let fs = FakeDeviceFs::new();
        fs.add_symlink("/dev/disk/by-path/x", "../../sdz");

        let err = fs.canonicalize(Path::new("/dev/disk/by-path/x")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(
            fs.stat(Path::new("/dev/disk/by-path/x")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_glob_does_not_cross_separators() {
        let fs = FakeDeviceFs::new();
        fs.add_file("/dev/disk/by-path/pci-0000:00:02.0-ip-10.0.0.1:3260-iscsi-iqn.x:y-lun-1", "");

        let hits = fs
            .glob("/dev/disk/by-path/pci-*-ip-10.0.0.1:3260-iscsi-iqn.x:y-lun-1")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(fs.glob("/dev/*-lun-1").unwrap().is_empty());
    }

    #[test]
    fn test_writes_need_parent_and_are_recorded() {
        let fs = FakeDeviceFs::new();
        fs.add_scsi_disk("sdc");

        fs.write(Path::new("/sys/block/sdc/device/delete"), b"1", 0o666).unwrap();
        assert_eq!(fs.writes_to("/sys/block/sdc/device/delete"), vec![b"1".to_vec()]);

        let err = fs
            .write(Path::new("/sys/block/sdq/device/delete"), b"1", 0o666)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        fs.fail_writes_to("/sys/block/sdc/device/delete");
        assert!(fs.write(Path::new("/sys/block/sdc/device/delete"), b"1", 0o666).is_err());
        assert_eq!(fs.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_command_rules_in_order() {
        let runner = FakeCommandRunner::new();
        runner.on_once(&["-m", "session"], CommandOutput::failure(21, ""));
        runner.on(&["-m", "session"], CommandOutput::success("tcp: [1] a:3260,1 iqn.x:y\n"));

        let args: Vec<String> = ["-m", "session"].iter().map(|s| s.to_string()).collect();
        assert_eq!(runner.run("iscsiadm", &args).await.unwrap().status, Some(21));
        assert_eq!(runner.run("iscsiadm", &args).await.unwrap().status, Some(0));

        let other: Vec<String> = vec!["-m".into(), "node".into()];
        assert!(runner.run("iscsiadm", &other).await.unwrap().is_success());
        assert_eq!(runner.calls().len(), 3);
        assert_eq!(runner.calls_with(&["-m", "session"]).len(), 2);
    }
}
