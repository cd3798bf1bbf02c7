//! Incremental-rebuild checking.
//!
//! A [`CompileChecker`] decides whether a set of inputs needs to run through
//! a tool again. The default strategy compares modification times: the value
//! for a file is the newest mtime across the file and its transitive
//! dependencies (e.g. scanned includes), and the baseline is the oldest mtime
//! across the previous run's outputs. Checkers memoize per-file values across
//! the whole run so shared headers are only stat'd once.

use crate::{
    cache::SettingsCache,
    error::Result,
    input::InputFile,
    project::Project,
    utils,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// The value a checker computes per file. Higher means "newer".
pub type RecompileStamp = SystemTime;

/// A run-wide memo of per-file recompile values.
///
/// Each key maps to a write-once cell. The first reader computes the value;
/// concurrent readers of the same key block until the write publishes.
#[derive(Debug, Default)]
pub struct Memo {
    cells: Mutex<HashMap<PathBuf, Arc<OnceCell<RecompileStamp>>>>,
}

impl Memo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<RecompileStamp> {
        let cells = self.cells.lock();
        cells.get(path).and_then(|cell| cell.get().copied())
    }

    pub fn get_or_compute(
        &self,
        path: &Path,
        compute: impl FnOnce() -> Result<RecompileStamp>,
    ) -> Result<RecompileStamp> {
        let cell = {
            let mut cells = self.cells.lock();
            cells.entry(path.to_path_buf()).or_default().clone()
        };
        cell.get_or_try_init(compute).copied()
    }
}

/// Strategy for deciding whether inputs must be rebuilt.
///
/// Implementations are registered per extension on the toolchain; everything
/// not covered falls back to [`TimestampChecker`].
pub trait CompileChecker: Send + Sync {
    /// The run-wide per-file memo this checker stores values in.
    fn memo(&self) -> &Memo;

    /// The raw recompile value for one file. Defaults to the mtime.
    fn recompile_value(&self, project: &Project, path: &Path) -> Result<RecompileStamp> {
        let _ = project;
        utils::mtime(path)
    }

    /// Paths this file depends on, e.g. headers pulled in by include
    /// directives. Paths that do not exist are dropped by the caller.
    fn dependencies(&self, project: &Project, path: &Path) -> Result<Vec<PathBuf>> {
        let _ = (project, path);
        Ok(Vec::new())
    }

    /// Condense the values of a file and its dependencies into one. The
    /// default keeps the newest.
    fn condense(&self, values: &[RecompileStamp]) -> RecompileStamp {
        values.iter().copied().max().unwrap_or(UNIX_EPOCH)
    }

    /// The baseline to compare against: the *oldest* value across the
    /// previous run's outputs for these inputs. `None` forces a rebuild.
    fn baseline(
        &self,
        project: &Project,
        inputs: &[Arc<InputFile>],
    ) -> Result<Option<RecompileStamp>> {
        let Some(last_outputs) = project.get_last_result(Some(inputs)) else {
            return Ok(None);
        };
        let mut oldest: Option<RecompileStamp> = None;
        for output in &last_outputs {
            // A deleted output is as old as it gets, which forces the rebuild.
            let value = if output.exists() {
                self.recompile_value(project, output)?
            } else {
                UNIX_EPOCH
            };
            oldest = Some(match oldest {
                Some(current) => current.min(value),
                None => value,
            });
        }
        Ok(oldest)
    }

    /// Compare a condensed input value against the baseline.
    fn should_recompile(&self, value: RecompileStamp, baseline: RecompileStamp) -> bool {
        value > baseline
    }
}

/// The default checker: newest modification time wins, no dependencies.
#[derive(Debug, Default)]
pub struct TimestampChecker {
    memo: Memo,
}

impl TimestampChecker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompileChecker for TimestampChecker {
    fn memo(&self) -> &Memo {
        &self.memo
    }
}

#[derive(Serialize, Deserialize)]
struct IncludeScan {
    mtime_ms: u64,
    dependencies: Vec<PathBuf>,
}

/// A checker that extracts `#include "..."` dependencies by scanning source
/// text, so touching a header rebuilds exactly the sources that reach it.
///
/// Scan results are persisted in the settings cache keyed by file path and
/// invalidated by mtime, which keeps warm rebuilds from re-reading every
/// source file.
pub struct IncludeScanChecker {
    memo: Memo,
    cache: Option<Arc<SettingsCache>>,
}

impl IncludeScanChecker {
    pub fn new() -> Self {
        Self { memo: Memo::new(), cache: None }
    }

    /// Persist include scans into the given settings cache between runs.
    pub fn with_cache(cache: Arc<SettingsCache>) -> Self {
        Self { memo: Memo::new(), cache: Some(cache) }
    }

    fn scan(&self, project: &Project, path: &Path) -> Result<Vec<PathBuf>> {
        let mtime_ms = mtime_millis(path)?;
        let cache_key = format!("includes/{}", path.display());

        if let Some(cache) = &self.cache {
            if let Some(scan) = cache.get::<IncludeScan>(&cache_key) {
                if scan.mtime_ms == mtime_ms {
                    return Ok(scan.dependencies);
                }
            }
        }

        let source = std::fs::read_to_string(path)
            .map_err(|err| crate::error::BuildError::io(err, path))?;
        let base = path.parent().unwrap_or(Path::new(""));
        let dependencies: Vec<PathBuf> = utils::find_include_paths(&source)
            .map(|include| {
                let relative = base.join(include);
                if relative.exists() {
                    relative
                } else {
                    project.working_directory.join(include)
                }
            })
            .collect();

        if let Some(cache) = &self.cache {
            cache.save(
                &cache_key,
                &IncludeScan { mtime_ms, dependencies: dependencies.clone() },
            )?;
        }
        Ok(dependencies)
    }
}

impl Default for IncludeScanChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompileChecker for IncludeScanChecker {
    fn memo(&self) -> &Memo {
        &self.memo
    }

    fn dependencies(&self, project: &Project, path: &Path) -> Result<Vec<PathBuf>> {
        self.scan(project, path)
    }
}

fn mtime_millis(path: &Path) -> Result<u64> {
    let mtime = utils::mtime(path)?;
    Ok(mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64)
}

/// Compute the condensed recompile value for one file, walking its dependency
/// closure with a visited-set cutoff so include cycles terminate.
fn check_file(
    project: &Project,
    checker: &dyn CompileChecker,
    path: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<RecompileStamp> {
    if let Some(value) = checker.memo().get(path) {
        return Ok(value);
    }

    let mut values = vec![checker.recompile_value(project, path)?];

    let mut dependencies: Vec<PathBuf> = Vec::new();
    for dep in checker.dependencies(project, path)? {
        let dep = utils::absolutize(&dep)?;
        if !visited.contains(&dep) {
            dependencies.push(dep);
        }
    }
    if dependencies.is_empty() {
        return Ok(values[0]);
    }

    // Cached dependency lists can reference files that no longer exist; those
    // must surface as tool errors later, not as stat failures here.
    dependencies.retain(|dep| dep.exists());
    visited.extend(dependencies.iter().cloned());

    for dep in &dependencies {
        values.push(check_file(project, checker, dep, visited)?);
    }

    let condensed = checker.condense(&values);
    checker.memo().get_or_compute(path, || Ok(condensed))
}

/// Determine whether the given inputs should be rebuilt.
///
/// With `force_all` set (solution generation, explicit rebuild) every input
/// reports dirty so all tools run.
pub fn should_recompile(
    project: &Project,
    checker: &dyn CompileChecker,
    inputs: &[Arc<InputFile>],
    force_all: bool,
) -> Result<bool> {
    if force_all {
        return Ok(true);
    }
    trace!("checking whether to recompile {:?}", inputs);
    let Some(baseline) = checker.baseline(project, inputs)? else {
        return Ok(true);
    };
    let mut values = Vec::with_capacity(inputs.len());
    for input in inputs {
        let path = utils::absolutize(input.path())?;
        values.push(check_file(project, checker, &path, &mut HashSet::new())?);
    }
    Ok(checker.should_recompile(checker.condense(&values), baseline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn memo_computes_once() {
        let memo = Memo::new();
        let stamp = UNIX_EPOCH + Duration::from_secs(100);
        let mut calls = 0;
        for _ in 0..3 {
            let got = memo
                .get_or_compute(Path::new("/x/a.h"), || {
                    calls += 1;
                    Ok(stamp)
                })
                .unwrap();
            assert_eq!(got, stamp);
        }
        assert_eq!(calls, 1);
        assert_eq!(memo.get(Path::new("/x/a.h")), Some(stamp));
        assert_eq!(memo.get(Path::new("/x/b.h")), None);
    }

    #[test]
    fn condense_keeps_newest() {
        let checker = TimestampChecker::new();
        let older = UNIX_EPOCH + Duration::from_secs(1);
        let newer = UNIX_EPOCH + Duration::from_secs(2);
        assert_eq!(checker.condense(&[older, newer, older]), newer);
    }

    #[test]
    fn newer_than_baseline_means_recompile() {
        let checker = TimestampChecker::new();
        let baseline = UNIX_EPOCH + Duration::from_secs(10);
        assert!(checker.should_recompile(baseline + Duration::from_secs(1), baseline));
        assert!(!checker.should_recompile(baseline, baseline));
        assert!(!checker.should_recompile(baseline - Duration::from_secs(1), baseline));
    }
}
