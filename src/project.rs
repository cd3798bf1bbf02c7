//! Concrete, buildable projects.
//!
//! A [`Project`] is a plan specialized to one (toolchain, architecture,
//! target) combination: settings are flattened and macro-expanded, the
//! intermediate and output directories exist, sources have been discovered
//! into per-extension buckets, and the artifact ledger from the previous run
//! has been read and a fresh one opened for this run.
//!
//! All mutable project state lives behind one lock and is only written by
//! the scheduler's coordinator thread; tool code running on workers sees the
//! project as read-only.

use crate::{
    cache::SettingsCache,
    error::{BuildError, Result},
    input::InputFile,
    plan::{FlatProject, Plan, ProjectType},
    settings::{Settings, Value},
    toolchain::Toolchain,
    utils,
};
use indexmap::{IndexMap, IndexSet};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

pub struct Project {
    pub name: String,
    pub working_directory: PathBuf,
    pub dependency_names: IndexSet<String>,
    pub priority: i32,
    pub ignore_dependency_ordering: bool,
    pub auto_discover_source_files: bool,

    pub toolchain_name: String,
    pub architecture_name: String,
    pub target_name: String,
    pub project_type: ProjectType,

    pub settings: Settings,
    pub toolchain: Toolchain,

    pub intermediate_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Engine-private directory under the intermediate dir, holding ledgers.
    pub csbuild_dir: PathBuf,
    pub output_name: String,

    dependencies: OnceCell<Vec<Arc<Project>>>,
    state: Mutex<ProjectState>,
}

#[derive(Default)]
struct ProjectState {
    /// Extension → files currently available as tool inputs, in discovery /
    /// production order.
    input_files: IndexMap<String, Vec<Arc<InputFile>>>,
    /// Extensions produced by actual (non-up-to-date) builds this run, used
    /// to force-rebuild cross-project consumers.
    built_this_run: IndexMap<String, IndexSet<PathBuf>>,
    /// Everything the previous run produced, read from the ledger.
    last_run_artifacts: IndexSet<PathBuf>,
    /// Everything this run has produced so far.
    artifacts: IndexSet<PathBuf>,
    /// Input-set → outputs mapping from the previous run.
    previous_results: HashMap<String, Vec<PathBuf>>,
    /// Input-set → outputs mapping accumulated this run.
    current_results: HashMap<String, Vec<PathBuf>>,
    ledger: Option<fs::File>,
}

impl Project {
    pub(crate) fn new(
        plan: &Plan,
        flat: FlatProject,
        toolchain: Toolchain,
        toolchain_name: String,
        architecture_name: String,
        target_name: String,
        cache: &SettingsCache,
    ) -> Result<Arc<Self>> {
        let FlatProject { settings, depends, project_type } = flat;
        let working_directory = utils::absolutize(plan.working_directory())?;

        let mut project = Self {
            name: plan.name().to_string(),
            working_directory: working_directory.clone(),
            dependency_names: depends,
            priority: plan.priority(),
            ignore_dependency_ordering: plan.ignore_dependency_ordering(),
            auto_discover_source_files: plan.auto_discover_source_files(),
            toolchain_name,
            architecture_name,
            target_name,
            project_type,
            settings,
            toolchain,
            intermediate_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            csbuild_dir: PathBuf::new(),
            output_name: String::new(),
            dependencies: OnceCell::new(),
            state: Mutex::new(ProjectState::default()),
        };

        debug!("preparing build tasks for {project}");

        project.expand_macros();

        project.intermediate_dir =
            project.resolve_dir("intermediateDir", working_directory.join("intermediate"));
        project.output_dir = project.resolve_dir("outputDir", working_directory.join("out"));
        project.csbuild_dir = project.intermediate_dir.join(".csbuild");
        project.output_name = project
            .settings
            .get_str("outputName")
            .map(str::to_string)
            .unwrap_or_else(|| project.name.clone());

        for dir in [&project.intermediate_dir, &project.output_dir, &project.csbuild_dir] {
            fs::create_dir_all(dir).map_err(|err| BuildError::io(err, dir))?;
        }

        let ledger_path = project.ledger_path();
        {
            let mut state = project.state.lock();
            if ledger_path.exists() {
                let contents = fs::read_to_string(&ledger_path)
                    .map_err(|err| BuildError::io(err, &ledger_path))?;
                state.last_run_artifacts =
                    contents.lines().map(PathBuf::from).collect();
            }
            let ledger = fs::File::create(&ledger_path)
                .map_err(|err| BuildError::io(err, &ledger_path))?;
            state.ledger = Some(ledger);
            state.previous_results =
                cache.get(&project.results_cache_key()).unwrap_or_default();
        }
        utils::sync_dir(&project.csbuild_dir)?;

        let project = Arc::new(project);
        project.rediscover_files()?;
        Ok(project)
    }

    fn resolve_dir(&self, key: &str, default: PathBuf) -> PathBuf {
        match self.settings.get_str(key) {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                if dir.is_absolute() {
                    dir
                } else {
                    self.working_directory.join(dir)
                }
            }
            None => default,
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.csbuild_dir.join(format!(
            "{}_{}_{}_{}.artifacts",
            self.name, self.toolchain_name, self.architecture_name, self.target_name
        ))
    }

    pub(crate) fn results_cache_key(&self) -> String {
        format!(
            "results/{}_{}_{}_{}",
            self.name, self.toolchain_name, self.architecture_name, self.target_name
        )
    }

    // ------------------------------------------------------------------
    // Macro expansion
    // ------------------------------------------------------------------

    // Every string value containing `{` is formatted against the project's
    // fields and scalar settings until a pass changes nothing.
    fn expand_macros(&mut self) {
        let keys: Vec<_> = self.settings.0.keys().cloned().collect();
        for key in keys {
            let Some(Value::Scalar(crate::settings::Scalar::Str(text))) =
                self.settings.0.get(&key)
            else {
                continue;
            };
            if !text.contains('{') {
                continue;
            }
            let mut current = text.clone();
            for _ in 0..16 {
                let expanded = self.expand_one(&current);
                if expanded == current {
                    break;
                }
                trace!("formatted {current} => {expanded}");
                current = expanded;
            }
            self.settings.insert(key, Value::from(current));
        }
    }

    fn expand_one(&self, text: &str) -> String {
        utils::RE_MACRO_TOKEN
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let name = &caps["name"];
                self.macro_value(name).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn macro_value(&self, name: &str) -> Option<String> {
        match name {
            "name" => Some(self.name.clone()),
            "workingDirectory" => Some(self.working_directory.display().to_string()),
            "toolchainName" => Some(self.toolchain_name.clone()),
            "architectureName" => Some(self.architecture_name.clone()),
            "targetName" => Some(self.target_name.clone()),
            _ => self
                .settings
                .get(name)
                .and_then(Value::as_scalar)
                .map(ToString::to_string),
        }
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Resolved dependency projects, in dependency order. Empty until the
    /// orchestrator resolves pointers.
    pub fn dependencies(&self) -> &[Arc<Project>] {
        self.dependencies.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn set_dependencies(&self, dependencies: Vec<Arc<Project>>) {
        let _ = self.dependencies.set(dependencies);
    }

    // ------------------------------------------------------------------
    // Source discovery
    // ------------------------------------------------------------------

    /// (Re-)run source discovery.
    ///
    /// Walks the working directory and any extra directories for files whose
    /// extension some tool consumes, skipping the engine's own directories,
    /// excluded directories, and files produced by the previous run (those
    /// are re-produced, not consumed as sources). Explicit source files are
    /// appended afterwards.
    pub fn rediscover_files(&self) -> Result<()> {
        trace!("discovering files for {self}");
        let mut buckets: IndexMap<String, Vec<Arc<InputFile>>> = IndexMap::new();
        let mut seen: IndexSet<PathBuf> = IndexSet::new();

        if self.auto_discover_source_files {
            let extensions = self.toolchain.search_extensions();

            let mut search_dirs = vec![self.working_directory.clone()];
            if let Some(extra) = self.settings.get_set("extraDirs") {
                for dir in extra {
                    search_dirs.push(self.join_workdir(&dir.to_string()));
                }
            }
            let exclude_dirs: Vec<PathBuf> = self
                .settings
                .get_set("excludeDirs")
                .map(|set| set.iter().map(|d| self.join_workdir(&d.to_string())).collect())
                .unwrap_or_default();
            let exclude_files: IndexSet<PathBuf> = self
                .settings
                .get_set("excludeFiles")
                .map(|set| set.iter().map(|f| self.join_workdir(&f.to_string())).collect())
                .unwrap_or_default();

            let state = self.state.lock();
            for dir in &search_dirs {
                trace!("collecting files from {}", dir.display());
                for path in utils::source_files_iter(dir, &extensions) {
                    let path = utils::absolutize(&path)?;
                    if path.starts_with(&self.csbuild_dir)
                        || path.starts_with(&self.intermediate_dir)
                        || (path.starts_with(&self.output_dir)
                            && self.output_dir != self.working_directory)
                    {
                        continue;
                    }
                    if exclude_dirs.iter().any(|dir| path.starts_with(dir)) {
                        continue;
                    }
                    if exclude_files.contains(&path) || state.last_run_artifacts.contains(&path)
                    {
                        continue;
                    }
                    if !seen.insert(path.clone()) {
                        continue;
                    }
                    buckets
                        .entry(utils::extension_of(&path))
                        .or_default()
                        .push(InputFile::new(path));
                }
            }
        }

        if let Some(sources) = self.settings.get_set("sourceFiles") {
            for file in sources {
                let path = self.join_workdir(&file.to_string());
                if seen.insert(path.clone()) {
                    buckets
                        .entry(utils::extension_of(&path))
                        .or_default()
                        .push(InputFile::new(path));
                }
            }
        }

        trace!("discovered {:?}", buckets.keys().collect::<Vec<_>>());
        self.state.lock().input_files = buckets;
        Ok(())
    }

    fn join_workdir(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.working_directory.join(path)
        }
    }

    // ------------------------------------------------------------------
    // Input buckets (coordinator-owned)
    // ------------------------------------------------------------------

    /// Extensions that currently have input files available.
    pub fn input_extensions(&self) -> Vec<String> {
        self.state.lock().input_files.keys().cloned().collect()
    }

    /// The current inputs of one extension, in order.
    pub fn inputs_for(&self, extension: &str) -> Vec<Arc<InputFile>> {
        self.state.lock().input_files.get(extension).cloned().unwrap_or_default()
    }

    /// Whether the project has any inputs for the extension.
    pub fn has_inputs_for(&self, extension: &str) -> bool {
        self.state.lock().input_files.get(extension).is_some_and(|b| !b.is_empty())
    }

    pub(crate) fn add_input(&self, extension: &str, input: Arc<InputFile>) {
        self.state.lock().input_files.entry(extension.to_string()).or_default().push(input);
    }

    /// Remove one input from its bucket (exclusive tools consume inputs).
    pub(crate) fn remove_input(&self, extension: &str, input: &Arc<InputFile>) {
        if let Some(bucket) = self.state.lock().input_files.get_mut(extension) {
            bucket.retain(|existing| !Arc::ptr_eq(existing, input));
        }
    }

    // ------------------------------------------------------------------
    // Artifacts & results
    // ------------------------------------------------------------------

    /// Record a file produced by the build: appended to the on-disk ledger
    /// (flushed and fsynced so interrupts never lose it) and tracked for
    /// cleaning and for next run's result lookups.
    pub fn add_artifact(
        &self,
        inputs: Option<&[Arc<InputFile>]>,
        artifact: &Path,
    ) -> Result<()> {
        let key = Self::result_key(inputs);
        let mut state = self.state.lock();
        state.current_results.entry(key).or_default().push(artifact.to_path_buf());
        if state.artifacts.insert(artifact.to_path_buf()) {
            if let Some(ledger) = state.ledger.as_mut() {
                writeln!(ledger, "{}", artifact.display())
                    .and_then(|()| ledger.flush())
                    .and_then(|()| ledger.sync_all())
                    .map_err(|err| BuildError::io(err, artifact))?;
            }
        }
        Ok(())
    }

    /// The outputs the previous run produced for this exact input set, if
    /// any.
    pub fn get_last_result(&self, inputs: Option<&[Arc<InputFile>]>) -> Option<Vec<PathBuf>> {
        let key = Self::result_key(inputs);
        self.state.lock().previous_results.get(&key).cloned()
    }

    fn result_key(inputs: Option<&[Arc<InputFile>]>) -> String {
        match inputs {
            None => "<null>".to_string(),
            Some(inputs) => {
                let mut paths: Vec<String> =
                    inputs.iter().map(|i| i.path().display().to_string()).collect();
                paths.sort();
                paths.join("\n")
            }
        }
    }

    /// Mark an extension as actually built (not up-to-date) this run.
    pub(crate) fn mark_built(&self, extension: &str, artifact: &Path) {
        self.state
            .lock()
            .built_this_run
            .entry(extension.to_string())
            .or_default()
            .insert(artifact.to_path_buf());
    }

    /// Whether any file of the extension was rebuilt this run. Consumers in
    /// dependent projects use this to force their own rebuilds.
    pub fn built_this_run(&self, extension: &str) -> bool {
        self.state.lock().built_this_run.contains_key(extension)
    }

    /// Artifacts recorded this run, in production order.
    pub fn artifacts(&self) -> IndexSet<PathBuf> {
        self.state.lock().artifacts.clone()
    }

    /// Artifacts listed in the previous run's ledger.
    pub fn last_run_artifacts(&self) -> IndexSet<PathBuf> {
        self.state.lock().last_run_artifacts.clone()
    }

    pub(crate) fn clear_last_run_artifacts(&self) {
        self.state.lock().last_run_artifacts.clear();
    }

    /// Close the ledger handle, e.g. before removing the engine directories
    /// during a clean.
    pub(crate) fn close_ledger(&self) {
        self.state.lock().ledger = None;
    }

    /// Persist this run's input→outputs records for next run's up-to-date
    /// checks.
    pub(crate) fn persist_results(&self, cache: &SettingsCache) -> Result<()> {
        let results = self.state.lock().current_results.clone();
        cache.save(&self.results_cache_key(), &results)
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{}/{})",
            self.name, self.toolchain_name, self.architecture_name, self.target_name
        )
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        plan::{Axis, Combination},
        tool::{tool, Tool, ToolSpec},
    };
    use pretty_assertions::assert_eq;

    struct Source(ToolSpec);
    impl Tool for Source {
        fn spec(&self) -> &ToolSpec {
            &self.0
        }
    }

    fn build_project(dir: &Path, configure: impl FnOnce(&mut Plan)) -> Arc<Project> {
        let mut plan = Plan::new("proj", dir, []);
        plan.with_context(&[(Axis::Toolchain, &["tc"])], |_| {});
        plan.with_target("release", |_| {});
        configure(&mut plan);

        let plans = IndexMap::new();
        let combo = Combination {
            toolchain: "tc",
            architecture: "arch",
            target: "release",
            platform: utils::host_platform(),
        };
        let flat = plan.flatten(&plans, &combo).unwrap().unwrap();
        let toolchain = Toolchain::new(
            vec![tool(Source(ToolSpec::new("source").inputs([".src"]).outputs([".out"])))],
            IndexMap::new(),
        )
        .unwrap();
        let cache = SettingsCache::open(dir.join("settings-cache")).unwrap();
        Project::new(
            &plan,
            flat,
            toolchain,
            "tc".into(),
            "arch".into(),
            "release".into(),
            &cache,
        )
        .unwrap()
    }

    #[test]
    fn discovery_finds_matching_extensions_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.src"), "a").unwrap();
        fs::write(dir.path().join("b.src"), "b").unwrap();
        fs::write(dir.path().join("c.other"), "c").unwrap();

        let project = build_project(dir.path(), |_| {});
        let inputs = project.inputs_for(".src");
        assert_eq!(inputs.len(), 2);
        assert!(project.inputs_for(".other").is_empty());
    }

    #[test]
    fn discovery_skips_engine_directories_and_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.src"), "a").unwrap();

        // Seed a previous ledger naming b.src as a produced file.
        let produced = dir.path().join("b.src");
        fs::write(&produced, "b").unwrap();
        let csbuild = dir.path().join("intermediate/.csbuild");
        fs::create_dir_all(&csbuild).unwrap();
        fs::write(
            csbuild.join("proj_tc_arch_release.artifacts"),
            format!("{}\n", utils::absolutize(&produced).unwrap().display()),
        )
        .unwrap();
        // And a stray source inside the intermediate dir.
        fs::write(dir.path().join("intermediate/stray.src"), "x").unwrap();

        let project = build_project(dir.path(), |_| {});
        let inputs = project.inputs_for(".src");
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].path().ends_with("a.src"));
    }

    #[test]
    fn explicit_sources_bypass_discovery() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("manual.src"), "m").unwrap();
        let project = build_project(dir.path(), |plan| {
            plan.set_auto_discover_source_files(false);
            plan.add_source_files(["manual.src"]);
        });
        let inputs = project.inputs_for(".src");
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].path().ends_with("manual.src"));
    }

    #[test]
    fn macros_expand_to_fixed_point() {
        let dir = tempfile::tempdir().unwrap();
        let project = build_project(dir.path(), |plan| {
            plan.set_value("base", "{name}-{targetName}");
            plan.set_value("outputName", "{base}-bin");
        });
        assert_eq!(project.output_name, "proj-release-bin");
    }

    #[test]
    fn artifacts_round_trip_through_ledger() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.src"), "a").unwrap();
        let out = utils::absolutize(dir.path().join("out/a.out")).unwrap();
        {
            let project = build_project(dir.path(), |_| {});
            let input = project.inputs_for(".src")[0].clone();
            project.add_artifact(Some(&[input]), &out).unwrap();
            assert!(project.artifacts().contains(&out));
        }
        // The next run reads it back as a previous artifact.
        let project = build_project(dir.path(), |_| {});
        assert!(project.last_run_artifacts().contains(&out));
    }

    #[test]
    fn last_results_persist_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.src"), "a").unwrap();
        let out = utils::absolutize(dir.path().join("out/a.out")).unwrap();
        let cache = SettingsCache::open(dir.path().join("settings-cache")).unwrap();
        {
            let project = build_project(dir.path(), |_| {});
            let input = project.inputs_for(".src")[0].clone();
            project.add_artifact(Some(&[input]), &out).unwrap();
            project.persist_results(&cache).unwrap();
        }
        let project = build_project(dir.path(), |_| {});
        let input = project.inputs_for(".src")[0].clone();
        assert_eq!(project.get_last_result(Some(&[input])), Some(vec![out]));
    }
}
