//! The tool contract.
//!
//! A tool is a declarative [`ToolSpec`] — which extensions it consumes and
//! produces, whether it runs per file or per group, how it interacts with
//! dependent projects — plus an implementation of [`Tool`] providing the
//! actual build step. The engine only ever talks to tools through this
//! contract; compilers, linkers, archivers and code generators are all
//! adapters behind it.

use crate::{
    error::{BuildError, Result},
    input::InputFile,
    project::Project,
};
use indexmap::IndexSet;
use std::{
    any::TypeId,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Identity of a tool implementation type.
///
/// Used to namespace tool-scoped settings keys and to track which tools have
/// been applied to an input file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToolId(TypeId);

impl ToolId {
    pub fn of<T: 'static>() -> Self {
        Self(TypeId::of::<T>())
    }
}

impl fmt::Debug for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ToolId({:?})", self.0)
    }
}

/// Static declaration of a tool's inputs, outputs and scheduling behavior.
#[derive(Clone, Debug)]
pub struct ToolSpec {
    /// Display name used in logs and error messages.
    pub name: String,
    /// Extensions passed to [`Tool::run`] one file at a time, as soon as each
    /// file is available. `None` declares a null-input tool that runs once
    /// per project with no input at all.
    pub input_files: Option<IndexSet<String>>,
    /// Extensions passed to [`Tool::run_group`] in one call, only after every
    /// tool that can still produce them has drained.
    pub input_groups: IndexSet<String>,
    /// Like `input_groups`, but the group aggregates files from this project
    /// and every project it depends on.
    pub cross_project_input_groups: IndexSet<String>,
    /// Extensions whose active production must drain before this tool runs,
    /// even though it does not take them as inputs.
    pub dependencies: IndexSet<String>,
    /// Like `dependencies`, checked against every dependency project.
    pub cross_project_dependencies: IndexSet<String>,
    /// Extensions of the files this tool produces. Every path returned from a
    /// run must carry one of these.
    pub output_files: IndexSet<String>,
    /// Supported architectures; `None` means all.
    pub supported_architectures: Option<IndexSet<String>>,
    /// Supported platforms; `None` means all.
    pub supported_platforms: Option<IndexSet<String>>,
    /// Global cap on concurrent executions of this tool. `0` means unbounded.
    pub max_parallel: usize,
    /// An exclusive tool consumes its inputs: downstream tools receive its
    /// outputs, never its inputs. Exclusive tools for an extension run before
    /// non-exclusive tools for the same extension.
    pub exclusive: bool,
}

impl Default for ToolSpec {
    fn default() -> Self {
        Self::new("tool")
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_files: Some(IndexSet::new()),
            input_groups: IndexSet::new(),
            cross_project_input_groups: IndexSet::new(),
            dependencies: IndexSet::new(),
            cross_project_dependencies: IndexSet::new(),
            output_files: IndexSet::new(),
            supported_architectures: None,
            supported_platforms: None,
            max_parallel: 0,
            exclusive: false,
        }
    }

    /// Declare a null-input tool: no per-file inputs, one run per project.
    pub fn null_input(mut self) -> Self {
        self.input_files = None;
        self
    }

    pub fn inputs<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_files =
            Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    pub fn input_groups<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_groups = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn cross_project_input_groups<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cross_project_input_groups = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn cross_project_depends_on<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cross_project_dependencies = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_files = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn architectures<I, S>(mut self, architectures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_architectures =
            Some(architectures.into_iter().map(Into::into).collect());
        self
    }

    pub fn platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_platforms = Some(platforms.into_iter().map(Into::into).collect());
        self
    }

    pub fn max_parallel(mut self, cap: usize) -> Self {
        self.max_parallel = cap;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// True when this tool takes no per-file input.
    pub fn is_null_input(&self) -> bool {
        self.input_files.is_none()
    }

    pub fn takes_input(&self, extension: &str) -> bool {
        self.input_files.as_ref().is_some_and(|files| files.contains(extension))
    }

    pub fn produces(&self, extension: &str) -> bool {
        self.output_files.contains(extension)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let no_inputs = self
            .input_files
            .as_ref()
            .is_some_and(|files| files.is_empty())
            && self.input_groups.is_empty()
            && self.cross_project_input_groups.is_empty();
        if no_inputs {
            return Err(BuildError::msg(format!("tool `{}` has no inputs set", self.name)));
        }
        if self.output_files.is_empty() {
            return Err(BuildError::msg(format!("tool `{}` has no outputs set", self.name)));
        }
        Ok(())
    }
}

/// A build step implementation.
///
/// Run methods execute massively in parallel on worker threads. They must not
/// mutate shared state; the project and its settings are read-only views.
/// Whichever of the three run methods matches the spec's input declaration
/// must be implemented; the others keep their erroring defaults.
pub trait Tool: Send + Sync + 'static {
    fn spec(&self) -> &ToolSpec;

    /// Per-project setup, run once after dependency resolution and before any
    /// build step.
    fn setup(&self, project: &Project) -> Result<()> {
        let _ = project;
        Ok(())
    }

    /// Execute a single build step over one input file.
    ///
    /// Returns the files created; each must carry an extension listed in
    /// [`ToolSpec::output_files`].
    fn run(&self, project: &Project, input: &InputFile) -> Result<Vec<PathBuf>> {
        let _ = (project, input);
        Err(BuildError::internal(format!(
            "tool `{}` does not take single-file inputs",
            self.spec().name
        )))
    }

    /// Execute one build step over an aggregated group of input files.
    fn run_group(&self, project: &Project, inputs: &[Arc<InputFile>]) -> Result<Vec<PathBuf>> {
        let _ = (project, inputs);
        Err(BuildError::internal(format!(
            "tool `{}` does not take group inputs",
            self.spec().name
        )))
    }

    /// Execute the single null-input build step for a tool with no inputs.
    fn run_once(&self, project: &Project) -> Result<Vec<PathBuf>> {
        let _ = project;
        Err(BuildError::internal(format!(
            "tool `{}` does not run without inputs",
            self.spec().name
        )))
    }
}

/// A tool implementation paired with its type identity.
///
/// Constructed through [`tool`], which captures the implementation's
/// [`TypeId`] so the engine can track it without downcasting.
#[derive(Clone)]
pub struct ToolHandle {
    id: ToolId,
    tool: Arc<dyn Tool>,
}

impl ToolHandle {
    pub fn id(&self) -> ToolId {
        self.id
    }

    pub fn spec(&self) -> &ToolSpec {
        self.tool.spec()
    }

    pub fn name(&self) -> &str {
        &self.tool.spec().name
    }

    pub fn tool(&self) -> &dyn Tool {
        &*self.tool
    }
}

impl fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolHandle").field("name", &self.name()).finish()
    }
}

/// Wrap a tool implementation for registration with the engine.
pub fn tool<T: Tool>(tool: T) -> ToolHandle {
    ToolHandle { id: ToolId::of::<T>(), tool: Arc::new(tool) }
}

/// Writes IDE solution files describing the built projects.
///
/// Called from the build-finished hook when solution generation was
/// requested; under that mode every tool reports up-to-date work as built so
/// generators see the complete project structure.
pub trait SolutionGenerator: Send + Sync {
    fn generate_solution(
        &self,
        output_dir: &Path,
        name: &str,
        projects: &[Arc<Project>],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_ids_differ_per_type() {
        struct A;
        struct B;
        assert_ne!(ToolId::of::<A>(), ToolId::of::<B>());
        assert_eq!(ToolId::of::<A>(), ToolId::of::<A>());
    }

    #[test]
    fn spec_validation_requires_inputs_and_outputs() {
        assert!(ToolSpec::new("t").outputs([".o"]).validate().is_err());
        assert!(ToolSpec::new("t").inputs([".c"]).validate().is_err());
        assert!(ToolSpec::new("t").inputs([".c"]).outputs([".o"]).validate().is_ok());
        // Null-input tools are valid without file inputs.
        assert!(ToolSpec::new("t").null_input().outputs([".gen"]).validate().is_ok());
        // Group-only tools are valid too.
        assert!(ToolSpec::new("t").input_groups([".o"]).outputs([".bin"]).validate().is_ok());
    }
}
