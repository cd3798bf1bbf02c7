//! Input files and their tool history.
//!
//! An [`InputFile`] records the absolute path of a file fed to tools, the
//! inputs it was derived from, and the set of tools already applied anywhere
//! along its derivation chain. The applied-tool set is what keeps a tool from
//! running twice on outputs derived from its own inputs.

use crate::tool::ToolId;
use md5::{Digest, Md5};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

pub struct InputFile {
    path: PathBuf,
    source_inputs: Vec<Arc<InputFile>>,
    tools_used: RwLock<HashSet<ToolId>>,
    up_to_date: bool,
    directory_id: OnceCell<String>,
}

impl InputFile {
    /// A freshly discovered source file with no derivation history.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::derived(path, Vec::new(), false)
    }

    /// A file produced by a tool from `source_inputs`.
    ///
    /// The new file inherits the applied-tool sets of every source input, so
    /// history survives through chains of same-extension tools.
    pub fn derived(
        path: impl Into<PathBuf>,
        source_inputs: Vec<Arc<InputFile>>,
        up_to_date: bool,
    ) -> Arc<Self> {
        let mut tools_used = HashSet::new();
        for source in &source_inputs {
            tools_used.extend(source.tools_used.read().iter().copied());
        }
        Arc::new(Self {
            path: path.into(),
            source_inputs,
            tools_used: RwLock::new(tools_used),
            up_to_date,
            directory_id: OnceCell::new(),
        })
    }

    /// Absolute path to the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extension(&self) -> String {
        crate::utils::extension_of(&self.path)
    }

    /// The inputs this file was produced from; empty for discovered sources.
    pub fn source_inputs(&self) -> &[Arc<InputFile>] {
        &self.source_inputs
    }

    /// Whether the file was already up to date, i.e. no build was performed
    /// to produce it this run.
    pub fn up_to_date(&self) -> bool {
        self.up_to_date
    }

    /// Record that a tool has been applied to this file.
    pub fn add_used_tool(&self, tool: ToolId) {
        self.tools_used.write().insert(tool);
    }

    /// Check if a tool was used in the chain of inputs that led to this file.
    pub fn was_tool_used(&self, tool: ToolId) -> bool {
        self.tools_used.read().contains(&tool)
    }

    /// A digest of the containing directory, for adapters that flatten
    /// outputs from colliding file names into one directory.
    pub fn unique_directory_id(&self) -> &str {
        self.directory_id.get_or_init(|| {
            let dir = self.path.parent().unwrap_or(Path::new(""));
            let mut hasher = Md5::new();
            hasher.update(dir.to_string_lossy().as_bytes());
            format!("{:x}", hasher.finalize())
        })
    }
}

impl fmt::Debug for InputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFile")
            .field("path", &self.path)
            .field("up_to_date", &self.up_to_date)
            .finish()
    }
}

impl fmt::Display for InputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Compiler;
    struct Linker;

    #[test]
    fn derived_inputs_inherit_tool_history() {
        let source = InputFile::new("/src/a.c");
        source.add_used_tool(ToolId::of::<Compiler>());

        let object = InputFile::derived("/obj/a.o", vec![source.clone()], false);
        assert!(object.was_tool_used(ToolId::of::<Compiler>()));
        assert!(!object.was_tool_used(ToolId::of::<Linker>()));

        // History is a set: re-adding leaves a single entry.
        object.add_used_tool(ToolId::of::<Compiler>());
        assert!(object.was_tool_used(ToolId::of::<Compiler>()));
    }

    #[test]
    fn directory_id_is_stable_and_distinct() {
        let a1 = InputFile::new("/src/x/a.c");
        let a2 = InputFile::new("/src/x/b.c");
        let b = InputFile::new("/src/y/a.c");
        assert_eq!(a1.unique_directory_id(), a2.unique_directory_id());
        assert_ne!(a1.unique_directory_id(), b.unique_directory_id());
    }
}
