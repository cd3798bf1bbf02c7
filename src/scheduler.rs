//! The dataflow build scheduler.
//!
//! Files are routed into tools as their extensions become producible. One
//! coordinator thread (the caller of [`BuildScheduler::run`]) consumes
//! completion events and performs *all* state mutation — input buckets,
//! reachability, active-tool sets, parallelism counters — while worker
//! threads only execute tool code against immutable project structure.
//!
//! The flow per task:
//!
//! 1. **Enqueue** bumps the tool's parallel counter and the project's
//!    reachability, marks the tool used on its inputs, and (for exclusive
//!    tools) consumes the inputs out of their bucket.
//! 2. The **worker** short-circuits if a previous result exists and the
//!    compile checker reports nothing changed, otherwise runs the tool.
//! 3. **Completion** releases counters, records artifacts, inserts produced
//!    files as new inputs, feeds them to single-input tools, and — whenever
//!    an extension drains to inactive — rescans this project and every
//!    project with cross-project dependencies for newly runnable work.
//!
//! The run ends when the in-flight count hits zero: the pool is stopped and
//! its stop sentinel unblocks the coordinator loop.

use crate::{
    error::{BuildError, BuildFailure, Result},
    input::InputFile,
    pool::{PoolEvent, WorkerPool},
    project::Project,
    recompile::{self, CompileChecker},
    tool::{ToolHandle, ToolId},
    utils,
};
use indexmap::IndexSet;
use std::{collections::HashMap, path::PathBuf, sync::Arc};

#[derive(Clone, Copy, Debug)]
pub(crate) struct SchedulerOptions {
    pub jobs: usize,
    pub stop_on_error: bool,
    /// Treat every input as dirty (solution generation).
    pub force_recompile: bool,
}

#[derive(Clone)]
enum TaskInput {
    Null,
    Single(Arc<InputFile>),
    Group(Vec<Arc<InputFile>>),
}

impl TaskInput {
    fn files(&self) -> Option<Vec<Arc<InputFile>>> {
        match self {
            Self::Null => None,
            Self::Single(file) => Some(vec![file.clone()]),
            Self::Group(files) => Some(files.clone()),
        }
    }
}

struct TaskCompletion {
    project: Arc<Project>,
    tool: ToolHandle,
    input_extension: Option<String>,
    inputs: Option<Vec<Arc<InputFile>>>,
    result: Result<(Vec<PathBuf>, bool)>,
}

pub(crate) struct BuildScheduler {
    projects: Vec<Arc<Project>>,
    /// Projects that declare any cross-project dependency or group; these
    /// are rescanned whenever another project drains an extension.
    cross_project: Vec<Arc<Project>>,
    pool: WorkerPool<TaskCompletion>,
    running: usize,
    cur_parallel: HashMap<ToolId, usize>,
    total_tasks: usize,
    completed_tasks: usize,
    failures: usize,
    aborted: bool,
    options: SchedulerOptions,
}

/// Outcome of a scheduler run.
pub(crate) struct SchedulerOutcome {
    pub failures: usize,
    pub total_tasks: usize,
}

impl BuildScheduler {
    pub(crate) fn new(projects: Vec<Arc<Project>>, options: SchedulerOptions) -> Self {
        let cross_project = projects
            .iter()
            .filter(|project| {
                project.toolchain.tools().iter().any(|tool| {
                    !tool.spec().cross_project_dependencies.is_empty()
                        || !tool.spec().cross_project_input_groups.is_empty()
                })
            })
            .cloned()
            .collect();
        Self {
            projects,
            cross_project,
            pool: WorkerPool::new(options.jobs),
            running: 0,
            cur_parallel: HashMap::new(),
            total_tasks: 0,
            completed_tasks: 0,
            failures: 0,
            aborted: false,
            options,
        }
    }

    /// Drive the build to completion, returning the failure count.
    pub(crate) fn run(&mut self) -> Result<SchedulerOutcome> {
        info!("starting builds");
        let queued_something = self.initial_enqueue()?;
        if !queued_something {
            info!("nothing to build");
            self.pool.stop();
        }

        loop {
            let event = match self.pool.events().recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                PoolEvent::Completed(completion) => self.build_finished(completion)?,
                PoolEvent::Stopped => break,
            }
        }

        if !self.aborted {
            for project in &self.projects {
                if project.toolchain.has_any_reachability() {
                    error!("project {project} did not finish building");
                    self.failures += 1;
                }
            }
        }
        info!("build finished; completed {} tasks", self.completed_tasks);
        Ok(SchedulerOutcome { failures: self.failures, total_tasks: self.total_tasks })
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    fn can_run(&self, tool: &ToolHandle) -> bool {
        let cap = tool.spec().max_parallel;
        cap == 0 || self.cur_parallel.get(&tool.id()).copied().unwrap_or(0) < cap
    }

    /// Every extension this tool waits on must have drained, in this project
    /// and (for cross-project dependencies) in every dependency.
    fn dependencies_met(&self, project: &Project, tool: &ToolHandle) -> bool {
        for depend in project.dependencies() {
            for ext in &tool.spec().cross_project_dependencies {
                if depend.toolchain.is_output_active(ext) {
                    return false;
                }
            }
        }
        for ext in &tool.spec().dependencies {
            if project.toolchain.is_output_active(ext) {
                return false;
            }
        }
        true
    }

    /// Collect a group tool's aggregated inputs, or `None` while any of its
    /// group extensions can still be produced (here or, for cross-project
    /// groups, in any dependency) or the group is empty.
    fn group_input_files(
        &self,
        project: &Arc<Project>,
        tool: &ToolHandle,
    ) -> Option<Vec<Arc<InputFile>>> {
        let spec = tool.spec();
        let mut files = Vec::new();
        if !spec.cross_project_input_groups.is_empty() {
            for ext in &spec.cross_project_input_groups {
                if project.toolchain.is_output_active(ext) {
                    trace!("extension {ext} is still active, can't build yet");
                    return None;
                }
                for depend in project.dependencies() {
                    if depend.toolchain.is_output_active(ext) {
                        trace!("extension {ext} is still active in dependency, can't build yet");
                        return None;
                    }
                }
                files.extend(
                    project
                        .inputs_for(ext)
                        .into_iter()
                        .filter(|file| !file.was_tool_used(tool.id())),
                );
                // Dependency buckets are taken as-is: the dependency's own
                // instance of this tool may already have marked them used.
                for depend in project.dependencies() {
                    files.extend(depend.inputs_for(ext));
                }
            }
        } else {
            for ext in &spec.input_groups {
                if project.toolchain.is_output_active(ext) {
                    trace!("extension {ext} is still active, can't build yet");
                    return None;
                }
                files.extend(
                    project
                        .inputs_for(ext)
                        .into_iter()
                        .filter(|file| !file.was_tool_used(tool.id())),
                );
            }
        }
        if files.is_empty() {
            None
        } else {
            Some(files)
        }
    }

    /// Pre-build gate for the initial enqueue: if any tool in the checked
    /// project could still produce one of `dependencies` and has sources
    /// feeding it, the dependent task must wait to be woken by a completion
    /// instead of enqueuing now.
    fn check_dependencies_pre_build(
        &self,
        check_project: &Project,
        dependencies: &IndexSet<String>,
    ) -> bool {
        for dependency in dependencies {
            for check_tool in check_project.toolchain.tools() {
                let spec = check_tool.spec();
                let has_sources = spec
                    .input_files
                    .iter()
                    .flatten()
                    .chain(&spec.input_groups)
                    .chain(&spec.cross_project_input_groups)
                    .any(|ext| check_project.has_inputs_for(ext));
                if has_sources
                    && check_project.toolchain.can_create_output(check_tool.id(), dependency)
                {
                    return false;
                }
            }
        }
        true
    }

    fn pre_checks_pass(&self, project: &Project, tool: &ToolHandle) -> bool {
        for depend in project.dependencies() {
            if !self.check_dependencies_pre_build(depend, &tool.spec().cross_project_dependencies)
            {
                return false;
            }
        }
        self.check_dependencies_pre_build(project, &tool.spec().dependencies)
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    fn enqueue(
        &mut self,
        project: Arc<Project>,
        tool: ToolHandle,
        input: TaskInput,
        do_compile_check: bool,
    ) {
        self.running += 1;
        self.total_tasks += 1;
        *self.cur_parallel.entry(tool.id()).or_insert(0) += 1;
        project.toolchain.create_reachability(tool.id());

        let input_extension = match &input {
            TaskInput::Single(file) => Some(file.extension()),
            _ => None,
        };
        match &input {
            TaskInput::Null => {
                // A null-input tool runs exactly once per project.
                project.toolchain.deactivate_tool(tool.id());
                debug!("enqueuing null-input build for {} for project {project}", tool.name());
            }
            TaskInput::Single(file) => {
                if tool.spec().exclusive {
                    if let Some(ext) = &input_extension {
                        project.remove_input(ext, file);
                    }
                }
                file.add_used_tool(tool.id());
                debug!("enqueuing build for {file} using {} for project {project}", tool.name());
            }
            TaskInput::Group(files) => {
                for file in files {
                    file.add_used_tool(tool.id());
                }
                debug!(
                    "enqueuing group build of {} files using {} for project {project}",
                    files.len(),
                    tool.name()
                );
            }
        }

        let checker = input
            .files()
            .and_then(|files| files.first().map(|f| project.toolchain.checker(&f.extension())));
        let force_recompile = self.options.force_recompile;
        let worker_project = project.clone();
        let worker_tool = tool.clone();
        let worker_input = input.clone();

        self.pool.submit(move || {
            let result = execute_task(
                &worker_project,
                &worker_tool,
                &worker_input,
                checker.as_deref(),
                do_compile_check,
                force_recompile,
            );
            TaskCompletion {
                inputs: worker_input.files(),
                input_extension,
                project: worker_project,
                tool: worker_tool,
                result,
            }
        });
    }

    fn initial_enqueue(&mut self) -> Result<bool> {
        let mut queued_something = false;
        let projects = self.projects.clone();
        for project in &projects {
            let mut extensions: Vec<Option<String>> = vec![None];
            extensions.extend(project.input_extensions().into_iter().map(Some));

            for extension in extensions {
                let mut tools = project.toolchain.tools_for(extension.as_deref(), None);
                tools.sort_by_key(|tool| !tool.spec().exclusive);
                for tool in tools {
                    if !self.pre_checks_pass(project, &tool) {
                        continue;
                    }
                    match &extension {
                        None => {
                            if !self.can_run(&tool)
                                || !project.toolchain.is_tool_active(tool.id())
                            {
                                continue;
                            }
                            // Null-input tools that also declare groups fire
                            // through group scheduling only.
                            if !tool.spec().input_groups.is_empty()
                                || !tool.spec().cross_project_input_groups.is_empty()
                            {
                                continue;
                            }
                            self.enqueue(project.clone(), tool, TaskInput::Null, false);
                            queued_something = true;
                        }
                        Some(ext) => {
                            for input in project.inputs_for(ext) {
                                if !self.can_run(&tool) {
                                    break;
                                }
                                if input.was_tool_used(tool.id()) {
                                    continue;
                                }
                                self.enqueue(
                                    project.clone(),
                                    tool.clone(),
                                    TaskInput::Single(input),
                                    true,
                                );
                                queued_something = true;
                            }
                        }
                    }
                }
            }

            trace!("checking for group inputs that can run already");
            for tool in project.toolchain.tools().to_vec() {
                if tool.spec().input_groups.is_empty()
                    && tool.spec().cross_project_input_groups.is_empty()
                {
                    continue;
                }
                if !self.can_run(&tool) || !self.pre_checks_pass(project, &tool) {
                    continue;
                }
                let Some(files) = self.group_input_files(project, &tool) else {
                    continue;
                };
                self.enqueue(project.clone(), tool, TaskInput::Group(files), true);
                queued_something = true;
            }
        }
        Ok(queued_something)
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn build_finished(&mut self, completion: TaskCompletion) -> Result<()> {
        let TaskCompletion { project, tool, input_extension, inputs, result } = completion;

        if let Some(count) = self.cur_parallel.get_mut(&tool.id()) {
            *count = count.saturating_sub(1);
        }
        self.running -= 1;
        project.toolchain.release_reachability(tool.id())?;

        let (outputs, up_to_date) = match result {
            Ok(ok) => ok,
            Err(err) => {
                self.record_failure(&project, inputs.as_deref(), err);
                if self.running == 0 && !self.aborted {
                    self.pool.stop();
                }
                return Ok(());
            }
        };

        self.maybe_deactivate(&project, &tool, input_extension.as_deref());

        let mut extensions_to_check: IndexSet<String> = IndexSet::new();
        for output in &outputs {
            trace!("checking for new tasks created by {}", output.display());
            project.add_artifact(inputs.as_deref(), output)?;

            let output_extension = utils::extension_of(output);
            if !up_to_date {
                project.mark_built(&output_extension, output);
            }
            extensions_to_check.insert(output_extension.clone());

            // Producing the same extension keeps the derivation chain; a new
            // extension starts a fresh one.
            let new_input = if input_extension.as_deref() == Some(output_extension.as_str()) {
                InputFile::derived(output, inputs.clone().unwrap_or_default(), up_to_date)
            } else {
                InputFile::derived(output, Vec::new(), up_to_date)
            };
            project.add_input(&output_extension, new_input.clone());

            // Feed the file to single-input tools right away. Exclusive
            // tools come first and consume the file, so at most one of them
            // sees it and non-exclusive tools only ever see post-exclusive
            // outputs.
            let mut next_tools =
                project.toolchain.tools_for(Some(&output_extension), Some(tool.id()));
            next_tools.sort_by_key(|t| !t.spec().exclusive);
            for next_tool in next_tools {
                if !project.toolchain.is_tool_active(next_tool.id())
                    || !self.can_run(&next_tool)
                    || !self.dependencies_met(&project, &next_tool)
                    || new_input.was_tool_used(next_tool.id())
                {
                    continue;
                }
                let exclusive = next_tool.spec().exclusive;
                self.enqueue(
                    project.clone(),
                    next_tool,
                    TaskInput::Single(new_input.clone()),
                    false,
                );
                if exclusive {
                    break;
                }
            }
        }

        for output_extension in &extensions_to_check {
            let is_active = project.toolchain.is_output_active(output_extension);
            trace!("extension {output_extension} still active: {is_active}");
            if is_active {
                continue;
            }
            // The last producer of this extension finished; whatever was
            // waiting on it may now be runnable.
            self.scan_project(&project)?;
            let cross = self.cross_project.clone();
            for other in &cross {
                self.scan_cross_project(other, output_extension)?;
            }
        }

        self.completed_tasks += 1;
        if up_to_date {
            debug!("finished (up to date) {:?} => {:?}", inputs, outputs);
        } else {
            debug!("finished building {:?} => {:?}", inputs, outputs);
        }

        if self.running == 0 {
            // Nothing in flight and this completion spawned nothing new.
            self.pool.stop();
        }
        Ok(())
    }

    fn record_failure(
        &mut self,
        project: &Arc<Project>,
        inputs: Option<&[Arc<InputFile>]>,
        err: BuildError,
    ) {
        let failure = match err {
            BuildError::Failure(failure) => failure,
            other => BuildFailure::new(
                project.name.clone(),
                inputs
                    .unwrap_or_default()
                    .iter()
                    .map(|file| file.path().to_path_buf()),
                other.to_string(),
            ),
        };
        error!("{failure}");
        self.failures += 1;
        if self.options.stop_on_error {
            self.aborted = true;
            self.pool.abort();
        }
    }

    /// Deactivate the tool once it has no remaining inputs and none of its
    /// input extensions can still be produced.
    fn maybe_deactivate(
        &self,
        project: &Arc<Project>,
        tool: &ToolHandle,
        input_extension: Option<&str>,
    ) {
        if !project.toolchain.is_tool_active(tool.id()) {
            return;
        }
        let remaining = input_extension.is_some_and(|ext| {
            project.inputs_for(ext).iter().any(|file| !file.was_tool_used(tool.id()))
        });
        if remaining {
            return;
        }
        let spec = tool.spec();
        for ext in spec.input_files.iter().flatten().chain(&spec.input_groups) {
            if project.toolchain.is_output_active(ext) {
                return;
            }
        }
        for ext in &spec.cross_project_input_groups {
            if project.toolchain.is_output_active(ext) {
                return;
            }
            for depend in project.dependencies() {
                if depend.toolchain.is_output_active(ext) {
                    return;
                }
            }
        }
        debug!("tool {} has finished building for project {project}", tool.name());
        project.toolchain.deactivate_tool(tool.id());
    }

    /// Enqueue everything in `project` that has become runnable.
    fn scan_project(&mut self, project: &Arc<Project>) -> Result<()> {
        let mut tools = project.toolchain.active_tools();
        tools.sort_by_key(|tool| !tool.spec().exclusive);
        for tool in tools {
            self.scan_tool(project, &tool, false)?;
        }
        Ok(())
    }

    /// Enqueue newly-runnable work in another project that waits on
    /// `changed_extension` across project boundaries.
    fn scan_cross_project(
        &mut self,
        project: &Arc<Project>,
        changed_extension: &str,
    ) -> Result<()> {
        let mut tools = project.toolchain.active_tools();
        tools.sort_by_key(|tool| !tool.spec().exclusive);
        for tool in tools {
            let spec = tool.spec();
            if !spec.cross_project_dependencies.contains(changed_extension)
                && !spec.cross_project_input_groups.contains(changed_extension)
            {
                continue;
            }
            self.scan_tool(project, &tool, false)?;
        }
        Ok(())
    }

    fn scan_tool(
        &mut self,
        project: &Arc<Project>,
        tool: &ToolHandle,
        do_compile_check: bool,
    ) -> Result<()> {
        if !self.can_run(tool) || !self.dependencies_met(project, tool) {
            return Ok(());
        }
        let spec = tool.spec();
        if spec.is_null_input() {
            if spec.input_groups.is_empty()
                && spec.cross_project_input_groups.is_empty()
                && project.toolchain.is_tool_active(tool.id())
            {
                self.enqueue(project.clone(), tool.clone(), TaskInput::Null, do_compile_check);
            }
        } else if let Some(input_files) = &spec.input_files {
            for ext in input_files {
                for input in project.inputs_for(ext) {
                    if !self.can_run(tool) {
                        break;
                    }
                    if input.was_tool_used(tool.id()) {
                        continue;
                    }
                    self.enqueue(
                        project.clone(),
                        tool.clone(),
                        TaskInput::Single(input),
                        do_compile_check,
                    );
                }
            }
        }

        if spec.input_groups.is_empty() && spec.cross_project_input_groups.is_empty() {
            return Ok(());
        }
        if let Some(files) = self.group_input_files(project, tool) {
            self.enqueue(project.clone(), tool.clone(), TaskInput::Group(files), do_compile_check);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Worker side
// ----------------------------------------------------------------------

/// Runs on a worker thread: consult the recompile checker, then either reuse
/// the previous result or execute the tool and validate its outputs.
fn execute_task(
    project: &Arc<Project>,
    tool: &ToolHandle,
    input: &TaskInput,
    checker: Option<&dyn CompileChecker>,
    do_compile_check: bool,
    force_recompile: bool,
) -> Result<(Vec<PathBuf>, bool)> {
    if let Some(files) = input.files() {
        // Anything rebuilt in a dependency this run invalidates our previous
        // outputs regardless of timestamps.
        let mut force_rebuild = false;
        'outer: for ext in &tool.spec().cross_project_dependencies {
            for depend in project.dependencies() {
                if depend.built_this_run(ext) {
                    trace!("cross-project rebuild trigger on {ext}, recompiling");
                    force_rebuild = true;
                    break 'outer;
                }
            }
        }

        if !force_rebuild {
            if let Some(last) = project.get_last_result(Some(&files)) {
                let reuse = if do_compile_check {
                    match checker {
                        Some(checker) => {
                            !recompile::should_recompile(project, checker, &files, force_recompile)?
                        }
                        None => false,
                    }
                } else {
                    files.iter().all(|file| file.up_to_date())
                };
                if reuse {
                    trace!("previous result exists and input has not changed; reusing it");
                    return Ok((last, true));
                }
            }
        }
    }

    trace!("processing inputs with {} for project {project}", tool.name());
    let outputs = match input {
        TaskInput::Null => tool.tool().run_once(project),
        TaskInput::Single(file) => tool.tool().run(project, file),
        TaskInput::Group(files) => tool.tool().run_group(project, files),
    }?;

    for output in &outputs {
        let ext = utils::extension_of(output);
        if !tool.spec().produces(&ext) {
            return Err(BuildError::internal(format!(
                "tool `{}` returned output `{}` whose extension is not in its declared outputs",
                tool.name(),
                output.display()
            )));
        }
    }
    Ok((outputs, false))
}
