//! The run orchestrator.
//!
//! [`Engine`] owns everything declared by a build script — plans, toolchain
//! registrations, checkers, hooks — and [`Engine::run`] drives a build: axis
//! requests are resolved against per-plan defaults, every plan is flattened
//! for every requested (toolchain × architecture × target) combination in
//! dependency order, dependency pointers are resolved, and the resulting
//! concrete projects are cleaned and/or handed to the scheduler.

use crate::{
    cache::SettingsCache,
    dag::Dag,
    error::{BuildError, Result},
    plan::{Combination, Plan, ProjectType},
    project::Project,
    recompile::CompileChecker,
    scheduler::{BuildScheduler, SchedulerOptions},
    settings::Value,
    tool::{SolutionGenerator, ToolHandle},
    toolchain::Toolchain,
    utils,
};
use indexmap::{IndexMap, IndexSet};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

/// Selection along one build axis.
#[derive(Clone, Debug, Default)]
pub enum AxisRequest {
    /// Use each plan's default for the axis.
    #[default]
    Default,
    /// Build every known value of the axis.
    All,
    /// Build exactly the named values.
    Named(Vec<String>),
}

impl AxisRequest {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Named(names.into_iter().map(Into::into).collect())
    }
}

/// Options for one invocation of [`Engine::run`].
#[derive(Debug)]
pub struct BuildOptions {
    pub targets: AxisRequest,
    pub architectures: AxisRequest,
    pub toolchains: AxisRequest,
    /// Restrict the build to these projects plus their dependencies.
    pub projects: Vec<String>,
    /// Remove previous artifacts instead of building.
    pub clean: bool,
    /// Clean, then build.
    pub rebuild: bool,
    /// Generate a solution with the named registered generator instead of a
    /// normal build; all tools report their work so project structure is
    /// complete.
    pub generate_solution: Option<String>,
    pub solution_path: Option<PathBuf>,
    pub solution_name: String,
    /// Worker thread count; defaults to the CPU count.
    pub jobs: Option<usize>,
    /// Wipe the persisted settings cache, forcing a full rebuild.
    pub clear_cache: bool,
    /// Ask tool adapters to echo the commands they spawn.
    pub show_commands: bool,
    /// Abort the whole run on the first tool failure.
    pub stop_on_error: bool,
    /// Write a Graphviz document describing the project dependency graph to
    /// this path and return without building.
    pub dependency_graph: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            targets: AxisRequest::Default,
            architectures: AxisRequest::Default,
            toolchains: AxisRequest::Default,
            projects: Vec::new(),
            clean: false,
            rebuild: false,
            generate_solution: None,
            solution_path: None,
            solution_name: "csbuild".to_string(),
            jobs: None,
            clear_cache: false,
            show_commands: false,
            stop_on_error: false,
            dependency_graph: None,
        }
    }
}

/// What a run produced.
#[derive(Debug)]
pub struct BuildSummary {
    /// Count of failed build tasks (plus projects that could not finish).
    pub failures: usize,
    /// Total tasks enqueued, including up-to-date short-circuits.
    pub total_tasks: usize,
    /// Every concrete project that participated, across all combinations.
    pub projects: Vec<Arc<Project>>,
}

impl BuildSummary {
    /// The conventional process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        self.failures.min(255) as i32
    }
}

struct ToolchainEntry {
    tools: Vec<ToolHandle>,
    checkers: IndexMap<String, Arc<dyn CompileChecker>>,
    default_architecture: String,
}

type Hook = Box<dyn Fn(&[Arc<Project>]) + Send + Sync>;

/// The build engine: declaration registry and run driver.
pub struct Engine {
    root: PathBuf,
    base_plan: Plan,
    plans: IndexMap<String, Plan>,
    toolchains: IndexMap<String, ToolchainEntry>,
    solution_generators: IndexMap<String, Arc<dyn SolutionGenerator>>,
    build_started_hooks: Vec<Hook>,
    build_finished_hooks: Vec<Hook>,
    add_default_targets: bool,
    default_targets_applied: bool,
    platform: String,
}

impl Engine {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = utils::absolutize(root.as_ref())?;
        let base_plan = Plan::new("", root.clone(), []);
        Ok(Self {
            root,
            base_plan,
            plans: IndexMap::new(),
            toolchains: IndexMap::new(),
            solution_generators: IndexMap::new(),
            build_started_hooks: Vec::new(),
            build_finished_hooks: Vec::new(),
            add_default_targets: true,
            default_targets_applied: false,
            platform: utils::host_platform().to_string(),
        })
    }

    /// The platform name used for `platform`-axis matching. Defaults to the
    /// host; override to pin declarations in tests or inspect foreign
    /// configurations.
    pub fn set_platform(&mut self, platform: impl Into<String>) {
        self.platform = platform.into();
    }

    /// Disable registration of the standard `release`/`debug`/`fastdebug`
    /// targets.
    pub fn set_add_default_targets(&mut self, add: bool) {
        self.add_default_targets = add;
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    /// Register a toolchain composed of the given tools.
    ///
    /// Toolchains must be registered before projects are declared so every
    /// plan carries the toolchain's override branch.
    pub fn register_toolchain(
        &mut self,
        name: &str,
        default_architecture: &str,
        tools: Vec<ToolHandle>,
    ) -> Result<()> {
        if self.toolchains.contains_key(name) {
            return Err(BuildError::msg(format!("toolchain `{name}` is already registered")));
        }
        for handle in &tools {
            handle.spec().validate()?;
        }
        self.base_plan.with_toolchains(&[name], |_| {});
        self.base_plan
            .default_architecture_map
            .insert(name.to_string(), default_architecture.to_string());
        self.toolchains.insert(
            name.to_string(),
            ToolchainEntry {
                tools,
                checkers: IndexMap::new(),
                default_architecture: default_architecture.to_string(),
            },
        );
        Ok(())
    }

    /// Register a compile checker for files of `extension` under the named
    /// toolchain.
    pub fn add_checker(
        &mut self,
        toolchain: &str,
        extension: &str,
        checker: Arc<dyn CompileChecker>,
    ) -> Result<()> {
        let entry = self
            .toolchains
            .get_mut(toolchain)
            .ok_or_else(|| BuildError::UnknownToolchain(toolchain.to_string()))?;
        entry.checkers.insert(extension.to_string(), checker);
        Ok(())
    }

    pub fn set_default_toolchain(&mut self, name: &str) -> Result<()> {
        if !self.toolchains.contains_key(name) {
            return Err(BuildError::UnknownToolchain(name.to_string()));
        }
        self.base_plan.default_toolchain = Some(name.to_string());
        Ok(())
    }

    pub fn set_default_target(&mut self, name: &str) {
        self.base_plan.default_target = name.to_string();
    }

    pub fn set_default_architecture(&mut self, name: &str) {
        self.base_plan.default_architecture = Some(name.to_string());
    }

    /// Declare settings on the base plan; all projects declared afterwards
    /// inherit them.
    pub fn global_settings(&mut self, f: impl FnOnce(&mut Plan)) {
        f(&mut self.base_plan);
    }

    /// Declare a project. `depends` names other projects this one links
    /// against and builds after.
    pub fn project(
        &mut self,
        name: &str,
        working_directory: impl AsRef<Path>,
        depends: &[&str],
        f: impl FnOnce(&mut Plan),
    ) -> Result<()> {
        if self.plans.contains_key(name) {
            return Err(BuildError::DuplicateProject(name.to_string()));
        }
        let working_directory = {
            let dir = working_directory.as_ref();
            if dir.is_absolute() {
                dir.to_path_buf()
            } else {
                self.root.join(dir)
            }
        };
        let mut plan = Plan::inherit(
            name,
            working_directory,
            depends.iter().map(|s| s.to_string()),
            &self.base_plan,
        );
        f(&mut plan);
        self.plans.insert(name.to_string(), plan);
        Ok(())
    }

    pub fn on_build_started(&mut self, hook: impl Fn(&[Arc<Project>]) + Send + Sync + 'static) {
        self.build_started_hooks.push(Box::new(hook));
    }

    pub fn on_build_finished(&mut self, hook: impl Fn(&[Arc<Project>]) + Send + Sync + 'static) {
        self.build_finished_hooks.push(Box::new(hook));
    }

    pub fn register_solution_generator(
        &mut self,
        name: &str,
        generator: Arc<dyn SolutionGenerator>,
    ) {
        self.solution_generators.insert(name.to_string(), generator);
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Execute a build (or clean, or solution generation) for the requested
    /// axis combinations.
    pub fn run(&mut self, options: BuildOptions) -> Result<BuildSummary> {
        let started = Instant::now();
        info!("preparing build...");

        let jobs = options.jobs.unwrap_or_else(num_cpus::get).max(1);
        let cache = SettingsCache::open(self.root.join(".csbuild").join("settings"))?;
        if options.clear_cache {
            cache.clear()?;
        }
        let rebuild = options.rebuild || options.clear_cache;
        let generating_solution = options.generate_solution.is_some();
        if let Some(generator) = &options.generate_solution {
            if !self.solution_generators.contains_key(generator) {
                return Err(BuildError::UnknownSolutionGenerator(generator.clone()));
            }
        }

        if self.add_default_targets && !self.default_targets_applied {
            self.default_targets_applied = true;
            self.setup_default_targets();
        }

        let ordered_plans = self.ordered_plan_names()?;
        let retained = self.filtered_plans(&options.projects)?;

        let toolchain_requests = self.axis_values(&options.toolchains, || {
            self.toolchains.keys().cloned().collect()
        });
        let target_requests = self.axis_values(&options.targets, || {
            self.plans.values().flat_map(|p| p.known_targets.iter().cloned()).collect()
        });
        let architecture_requests = self.axis_values(&options.architectures, || {
            self.all_architectures()
        });

        // Flatten every plan for every combination, keeping dependency
        // order within each combination.
        let mut project_map: IndexMap<(String, String, String), IndexMap<String, Arc<Project>>> =
            IndexMap::new();
        let mut build_list: Vec<Arc<Project>> = Vec::new();

        for toolchain_request in &toolchain_requests {
            for architecture_request in &architecture_requests {
                for target_request in &target_requests {
                    for name in &ordered_plans {
                        if let Some(retained) = &retained {
                            if !retained.contains(name) {
                                continue;
                            }
                        }
                        let plan = &self.plans[name];
                        let toolchain_name =
                            plan.resolve_toolchain(toolchain_request.as_deref())?;
                        let architecture = plan.resolve_architecture(
                            &toolchain_name,
                            architecture_request.as_deref(),
                        )?;
                        let target = plan.resolve_target(target_request.as_deref());

                        let key =
                            (toolchain_name.clone(), architecture.clone(), target.clone());
                        if project_map.get(&key).is_some_and(|m| m.contains_key(name)) {
                            continue;
                        }

                        let combo = Combination {
                            toolchain: &toolchain_name,
                            architecture: &architecture,
                            target: &target,
                            platform: &self.platform,
                        };
                        let Some(mut flat) = plan.flatten(&self.plans, &combo)? else {
                            continue;
                        };

                        let entry = self
                            .toolchains
                            .get(&toolchain_name)
                            .ok_or_else(|| BuildError::UnknownToolchain(toolchain_name.clone()))?;
                        if !tools_support_combination(&entry.tools, &combo) {
                            continue;
                        }

                        flat.settings
                            .insert("showCommands", Value::from(options.show_commands));

                        let toolchain =
                            Toolchain::new(entry.tools.clone(), entry.checkers.clone())?;
                        let project = Project::new(
                            plan,
                            flat,
                            toolchain,
                            toolchain_name.clone(),
                            architecture.clone(),
                            target.clone(),
                            &cache,
                        )?;

                        project_map.entry(key).or_default().insert(name.clone(), project.clone());
                        if project.project_type != ProjectType::Stub
                            || generating_solution
                            || options.dependency_graph.is_some()
                        {
                            build_list.push(project);
                        }
                    }
                }
            }
        }

        if build_list.is_empty() {
            return Err(BuildError::msg(
                "no projects were found supporting the requested architecture, toolchain, target, and platform combination",
            ));
        }

        // Resolve dependency pointers within each combination.
        for projects in project_map.values() {
            for project in projects.values() {
                let mut dependencies = Vec::new();
                for depend_name in &project.dependency_names {
                    let Some(depend) = projects.get(depend_name) else {
                        return Err(BuildError::UnknownDependency {
                            project: project.name.clone(),
                            dependency: depend_name.clone(),
                        });
                    };
                    dependencies.push(depend.clone());
                }
                project.set_dependencies(dependencies);
            }
        }

        if let Some(path) = &options.dependency_graph {
            let document = dependency_graph_dot(&build_list);
            fs::write(path, document).map_err(|err| BuildError::io(err, path))?;
            info!("wrote {}", path.display());
            return Ok(BuildSummary { failures: 0, total_tasks: 0, projects: build_list });
        }

        if !options.clean || rebuild {
            for project in &build_list {
                for handle in project.toolchain.tools() {
                    handle.tool().setup(project)?;
                }
            }
        }

        debug!("build preparation took {:?}", started.elapsed());

        if options.clean || rebuild {
            clean_projects(&build_list, rebuild)?;
        }

        let mut failures = 0;
        let mut total_tasks = 0;
        if !options.clean || rebuild {
            debug!("executing build start hooks");
            for hook in &self.build_started_hooks {
                hook(&build_list);
            }

            let mut scheduler = BuildScheduler::new(
                build_list.clone(),
                SchedulerOptions {
                    jobs,
                    stop_on_error: options.stop_on_error,
                    force_recompile: generating_solution,
                },
            );
            let outcome = scheduler.run()?;
            failures = outcome.failures;
            total_tasks = outcome.total_tasks;

            debug!("executing build completion hooks");
            for hook in &self.build_finished_hooks {
                hook(&build_list);
            }

            if let Some(generator_name) = &options.generate_solution {
                let generator = self.solution_generators[generator_name].clone();
                let output_dir = options
                    .solution_path
                    .clone()
                    .unwrap_or_else(|| self.root.join("Solutions").join(generator_name));
                fs::create_dir_all(&output_dir)
                    .map_err(|err| BuildError::io(err, &output_dir))?;
                generator.generate_solution(&output_dir, &options.solution_name, &build_list)?;
            }

            for project in &build_list {
                project.persist_results(&cache)?;
            }
        }

        info!("total execution took {:?}", started.elapsed());
        Ok(BuildSummary { failures, total_tasks, projects: build_list })
    }

    fn setup_default_targets(&mut self) {
        const DEFAULT_TARGETS: &[(&str, &str, &str, &[&str])] = &[
            ("release", "max", "disabled", &["NDEBUG"]),
            ("debug", "disabled", "embeddedSymbols", &["_DEBUG"]),
            ("fastdebug", "max", "embeddedSymbols", &["_DEBUG", "_FASTDEBUG"]),
        ];
        for plan in self.plans.values_mut() {
            trace!("setting up default targets for {}", plan.name());
            for (target, optimization, debug_level, defines) in DEFAULT_TARGETS {
                plan.with_target(target, |plan| {
                    plan.set_value_if_unset("optimizationLevel", *optimization);
                    plan.set_value_if_unset("debugLevel", *debug_level);
                    for define in *defines {
                        plan.append_list("defines", *define);
                    }
                });
            }
        }
    }

    /// Plans in dependency order, priority-adjusted.
    fn ordered_plan_names(&self) -> Result<Vec<String>> {
        let mut dag = Dag::new();
        for plan in self.plans.values() {
            dag.add(
                plan.name().to_string(),
                plan.name().to_string(),
                plan.depends().to_vec(),
            )?;
        }
        let mut ordered = dag.into_ordered()?;
        // Plans that opted out of dependency ordering sort globally by
        // priority; everything else keeps DAG order.
        ordered.sort_by_key(|name| {
            let plan = &self.plans[name];
            if plan.ignore_dependency_ordering() {
                -i64::from(plan.priority())
            } else {
                0
            }
        });
        Ok(ordered)
    }

    /// The project filter: the named projects plus their transitive
    /// dependencies, or `None` when no filter was requested.
    fn filtered_plans(&self, requested: &[String]) -> Result<Option<IndexSet<String>>> {
        if requested.is_empty() {
            return Ok(None);
        }
        let unknown: Vec<&String> =
            requested.iter().filter(|name| !self.plans.contains_key(*name)).collect();
        if !unknown.is_empty() {
            return Err(BuildError::NoSuchProjects(
                unknown.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
            ));
        }
        let mut retained = IndexSet::new();
        let mut stack: Vec<String> = requested.to_vec();
        while let Some(name) = stack.pop() {
            if !retained.insert(name.clone()) {
                continue;
            }
            for depend in self.plans[&name].depends() {
                stack.push(depend.clone());
            }
        }
        Ok(Some(retained))
    }

    fn axis_values(
        &self,
        request: &AxisRequest,
        all: impl FnOnce() -> IndexSet<String>,
    ) -> Vec<Option<String>> {
        match request {
            AxisRequest::Default => vec![None],
            AxisRequest::All => all().into_iter().map(Some).collect(),
            AxisRequest::Named(names) => names.iter().cloned().map(Some).collect(),
        }
    }

    fn all_architectures(&self) -> IndexSet<String> {
        let mut architectures = IndexSet::new();
        for entry in self.toolchains.values() {
            architectures.insert(entry.default_architecture.clone());
            for handle in &entry.tools {
                if let Some(supported) = &handle.spec().supported_architectures {
                    architectures.extend(supported.iter().cloned());
                }
            }
        }
        architectures
    }
}

fn tools_support_combination(tools: &[ToolHandle], combo: &Combination<'_>) -> bool {
    for handle in tools {
        let spec = handle.spec();
        if let Some(architectures) = &spec.supported_architectures {
            if !architectures.contains(combo.architecture) {
                debug!(
                    "tool {} does not support architecture {}",
                    spec.name, combo.architecture
                );
                return false;
            }
        }
        if let Some(platforms) = &spec.supported_platforms {
            if !platforms.contains(combo.platform) {
                debug!("tool {} does not support platform {}", spec.name, combo.platform);
                return false;
            }
        }
    }
    true
}

/// Remove everything the previous run produced. With
/// `keep_artifacts_and_directories` (a rebuild), the engine directories and
/// open ledgers stay in place for the build that follows.
fn clean_projects(projects: &[Arc<Project>], keep_artifacts_and_directories: bool) -> Result<()> {
    info!("cleaning...");
    for project in projects {
        trace!("cleaning project {project}");
        for artifact in project.last_run_artifacts() {
            if artifact.exists() {
                trace!("removing {}", artifact.display());
                fs::remove_file(&artifact).map_err(|err| BuildError::io(err, &artifact))?;
            }
        }
        project.clear_last_run_artifacts();

        if !keep_artifacts_and_directories {
            project.close_ledger();
            remove_dir_if_no_files(&project.csbuild_dir)?;
            remove_dir_if_no_files(&project.intermediate_dir)?;
            remove_dir_if_no_files(&project.output_dir)?;
        }
    }
    Ok(())
}

// Removes a directory tree only when it contains no files at all.
fn remove_dir_if_no_files(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let has_files = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .any(|entry| entry.file_type().is_file());
    if !has_files {
        trace!("removing {}", dir.display());
        fs::remove_dir_all(dir).map_err(|err| BuildError::io(err, dir))?;
    }
    Ok(())
}

/// Render the dependency graph as a Graphviz document. Stubs keep their
/// grouping role; transitive edges are reduced to direct ones.
fn dependency_graph_dot(projects: &[Arc<Project>]) -> String {
    let mut document = String::from(
        "digraph G {\n\toverlap=\"false\";\n\tsplines=\"spline\";\n\trankdir=\"LR\";\n",
    );
    for project in projects {
        let shape = match project.project_type {
            ProjectType::Application => "doublecircle",
            ProjectType::Stub => "oval",
            _ => "component",
        };
        document.push_str(&format!(
            "\t{} [shape=\"{shape}\"];\n",
            project.name.replace('-', "_")
        ));

        // A dependency also reachable through another dependency is not a
        // direct edge.
        let indirect: IndexSet<&String> = project
            .dependencies()
            .iter()
            .flat_map(|dep| dep.dependency_names.iter())
            .collect();
        for depend in &project.dependency_names {
            if indirect.contains(depend) {
                continue;
            }
            document.push_str(&format!(
                "\t{} -> {};\n",
                project.name.replace('-', "_"),
                depend.replace('-', "_")
            ));
        }
    }
    document.push_str("}\n");
    document
}
