//! Error types for the build engine.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// An error that occurred while declaring, planning or executing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Errors in the makefile declarations, detected before any build step runs.
    #[error("duplicate project name `{0}`")]
    DuplicateProject(String),
    #[error("project `{project}` references unknown dependency `{dependency}`")]
    UnknownDependency { project: String, dependency: String },
    #[error("toolchain `{toolchain}` has not been registered for project `{project}`")]
    UnregisteredToolchain { toolchain: String, project: String },
    #[error("no such toolchain `{0}`")]
    UnknownToolchain(String),
    #[error("no such project(s): {0}")]
    NoSuchProjects(String),
    #[error("no such solution generator: {0}")]
    UnknownSolutionGenerator(String),
    #[error(
        "unresolvable dependencies found in items: {0:?}; the dependency graph is missing nodes or contains a cycle"
    )]
    UnresolvedDependencies(Vec<String>),
    #[error("setting writes are not allowed while a context is still open for project `{0}`")]
    OpenContext(String),

    /// A tool failed to build one of its inputs.
    #[error(transparent)]
    Failure(#[from] BuildFailure),

    /// A linker-style tool could not locate a named library.
    #[error("could not find library `{name}`; searched in {searched:?}")]
    LibraryNotFound { name: String, searched: Vec<PathBuf> },

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    /// A violated scheduler invariant. These always indicate a modelling bug,
    /// never a user error.
    #[error("internal error: {0}")]
    Internal(String),

    /// General purpose message.
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        IoError::new(err, path).into()
    }
}

/// An `io::Error` annotated with the path that produced it.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct IoError {
    io: io::Error,
    path: PathBuf,
}

impl IoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which this error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`.
    pub fn source(&self) -> &io::Error {
        &self.io
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        err.io
    }
}

/// A build failure raised by a tool, attributed to the project and inputs it
/// was processing.
///
/// Failures are logged on the coordinator and counted; unless the run is
/// configured to stop on the first error, other work keeps going.
#[derive(Debug, Error)]
#[error("[{project}] failed to build {}: {message}", display_inputs(&self.inputs))]
pub struct BuildFailure {
    pub project: String,
    pub inputs: Vec<PathBuf>,
    pub message: String,
}

impl BuildFailure {
    pub fn new(
        project: impl Into<String>,
        inputs: impl IntoIterator<Item = PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            inputs: inputs.into_iter().collect(),
            message: message.into(),
        }
    }
}

fn display_inputs(inputs: &[PathBuf]) -> String {
    if inputs.is_empty() {
        return "<no input>".to_string();
    }
    inputs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_names_project_and_inputs() {
        let failure =
            BuildFailure::new("app", [PathBuf::from("/x/a.c")], "compiler exited with 1");
        let text = failure.to_string();
        assert!(text.contains("app"));
        assert!(text.contains("a.c"));
        assert!(text.contains("compiler exited with 1"));
    }

    #[test]
    fn null_input_failure_is_displayable() {
        let failure = BuildFailure::new("app", [], "generator failed");
        assert!(failure.to_string().contains("<no input>"));
    }
}
