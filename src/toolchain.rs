//! Toolchain composition.
//!
//! A toolchain is an ordered collection of tools plus per-extension compile
//! checkers. Beyond holding the tools, it tracks two pieces of scheduling
//! state owned by the coordinator thread:
//!
//! * the **active set** — tools still capable of producing output; a tool
//!   leaves the set once it can never run again this build, and
//! * **reachability** — a counter per output extension that is non-zero
//!   while any in-flight or pending work could still produce that extension.
//!   Group tools wait on reachability draining to zero before they fire.
//!
//! For each tool the toolchain precomputes its *path*: the closure of tools
//! reachable by chaining outputs into inputs, which is what makes the
//! reachability counters cover indirect production.

use crate::{
    error::{BuildError, Result},
    recompile::{CompileChecker, TimestampChecker},
    tool::{ToolHandle, ToolId},
};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

pub struct Toolchain {
    tools: Vec<ToolHandle>,
    /// For every tool, the set of tools reachable by following output
    /// extensions into input extensions, fixed-point.
    paths: HashMap<ToolId, IndexSet<ToolId>>,
    checkers: IndexMap<String, Arc<dyn CompileChecker>>,
    default_checker: Arc<dyn CompileChecker>,
    state: Mutex<ToolchainState>,
}

struct ToolchainState {
    reachability: IndexMap<String, usize>,
    active: IndexSet<ToolId>,
}

impl Toolchain {
    pub fn new(
        tools: Vec<ToolHandle>,
        checkers: IndexMap<String, Arc<dyn CompileChecker>>,
    ) -> Result<Self> {
        for handle in &tools {
            handle.spec().validate()?;
        }

        let mut paths: HashMap<ToolId, IndexSet<ToolId>> = HashMap::new();
        for handle in &tools {
            let mut path = IndexSet::new();
            let mut outputs: IndexSet<String> = handle.spec().output_files.clone();
            let mut another_pass = true;
            while another_pass {
                another_pass = false;
                for other in &tools {
                    if other.id() == handle.id() || path.contains(&other.id()) {
                        continue;
                    }
                    let takes_one = other
                        .spec()
                        .input_files
                        .iter()
                        .flatten()
                        .chain(&other.spec().input_groups)
                        .any(|ext| outputs.contains(ext));
                    if takes_one {
                        path.insert(other.id());
                        outputs.extend(other.spec().output_files.iter().cloned());
                        another_pass = true;
                    }
                }
            }
            paths.insert(handle.id(), path);
        }

        let active = tools.iter().map(ToolHandle::id).collect();
        Ok(Self {
            tools,
            paths,
            checkers,
            default_checker: Arc::new(TimestampChecker::new()),
            state: Mutex::new(ToolchainState { reachability: IndexMap::new(), active }),
        })
    }

    /// All tools, in composition order.
    pub fn tools(&self) -> &[ToolHandle] {
        &self.tools
    }

    pub fn tool(&self, id: ToolId) -> Option<&ToolHandle> {
        self.tools.iter().find(|t| t.id() == id)
    }

    /// Mark one pending or in-flight use of `tool`: bumps the counter for
    /// every output the tool — or anything downstream of it — can produce.
    ///
    /// Must be called once for every unit of work assigned to the tool,
    /// whether it is dispatched immediately or parked as pending.
    pub fn create_reachability(&self, tool: ToolId) {
        let mut state = self.state.lock();
        for ext in self.reachable_outputs(tool) {
            *state.reachability.entry(ext).or_insert(0) += 1;
        }
    }

    /// Release one use of `tool`, the symmetric inverse of
    /// [`Self::create_reachability`].
    pub fn release_reachability(&self, tool: ToolId) -> Result<()> {
        let mut state = self.state.lock();
        for ext in self.reachable_outputs(tool) {
            let counter = state.reachability.entry(ext.clone()).or_insert(0);
            if *counter == 0 {
                return Err(BuildError::internal(format!(
                    "reachability for `{ext}` released without being created"
                )));
            }
            *counter -= 1;
        }
        Ok(())
    }

    fn reachable_outputs(&self, tool: ToolId) -> Vec<String> {
        let mut outputs = Vec::new();
        if let Some(handle) = self.tool(tool) {
            outputs.extend(handle.spec().output_files.iter().cloned());
        }
        if let Some(path) = self.paths.get(&tool) {
            for downstream in path {
                if let Some(handle) = self.tool(*downstream) {
                    outputs.extend(handle.spec().output_files.iter().cloned());
                }
            }
        }
        outputs
    }

    /// True while any started work has not finished.
    pub fn has_any_reachability(&self) -> bool {
        self.state.lock().reachability.values().any(|count| *count != 0)
    }

    /// Whether an output of the given extension can still be generated by
    /// queued or in-flight work.
    pub fn is_output_active(&self, extension: &str) -> bool {
        self.state.lock().reachability.get(extension).is_some_and(|count| *count != 0)
    }

    /// Whether the tool can ever create the given output, even indirectly
    /// through other tools.
    pub fn can_create_output(&self, tool: ToolId, extension: &str) -> bool {
        if self.tool(tool).is_some_and(|t| t.spec().produces(extension)) {
            return true;
        }
        self.paths.get(&tool).is_some_and(|path| {
            path.iter().any(|downstream| {
                self.tool(*downstream).is_some_and(|t| t.spec().produces(extension))
            })
        })
    }

    /// Remove the tool from the active set.
    pub fn deactivate_tool(&self, tool: ToolId) {
        self.state.lock().active.shift_remove(&tool);
    }

    pub fn is_tool_active(&self, tool: ToolId) -> bool {
        self.state.lock().active.contains(&tool)
    }

    /// The tools still in the active set, in composition order.
    pub fn active_tools(&self) -> Vec<ToolHandle> {
        let state = self.state.lock();
        self.tools.iter().filter(|t| state.active.contains(&t.id())).cloned().collect()
    }

    /// Active tools that take the given extension as a single-file input, or
    /// null-input tools when `extension` is `None`. The generating tool, if
    /// any, is excluded so a tool never feeds itself directly.
    pub fn tools_for(
        &self,
        extension: Option<&str>,
        generating_tool: Option<ToolId>,
    ) -> Vec<ToolHandle> {
        let state = self.state.lock();
        self.tools
            .iter()
            .filter(|t| state.active.contains(&t.id()))
            .filter(|t| Some(t.id()) != generating_tool)
            .filter(|t| match extension {
                None => t.spec().is_null_input(),
                Some(ext) => t.spec().takes_input(ext),
            })
            .cloned()
            .collect()
    }

    /// Every extension any tool consumes, as files or groups. Drives source
    /// discovery.
    pub fn search_extensions(&self) -> IndexSet<String> {
        let mut extensions = IndexSet::new();
        for handle in &self.tools {
            if let Some(files) = &handle.spec().input_files {
                extensions.extend(files.iter().cloned());
            }
            extensions.extend(handle.spec().input_groups.iter().cloned());
            extensions.extend(handle.spec().cross_project_input_groups.iter().cloned());
        }
        extensions
    }

    /// The compile checker for an extension, falling back to the timestamp
    /// checker.
    pub fn checker(&self, extension: &str) -> Arc<dyn CompileChecker> {
        self.checkers.get(extension).cloned().unwrap_or_else(|| self.default_checker.clone())
    }
}

impl std::fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolchain")
            .field("tools", &self.tools.iter().map(ToolHandle::name).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{tool, Tool, ToolSpec};

    macro_rules! stub_tool {
        ($name:ident, $spec:expr) => {
            struct $name(ToolSpec);
            impl $name {
                fn handle() -> ToolHandle {
                    tool(Self($spec))
                }
            }
            impl Tool for $name {
                fn spec(&self) -> &ToolSpec {
                    &self.0
                }
            }
        };
    }

    stub_tool!(Compiler, ToolSpec::new("compiler").inputs([".c"]).outputs([".o"]));
    stub_tool!(Linker, ToolSpec::new("linker").input_groups([".o"]).outputs([".elf"]));
    stub_tool!(Packager, ToolSpec::new("packager").inputs([".elf"]).outputs([".pkg"]));

    fn chain() -> Toolchain {
        Toolchain::new(
            vec![Compiler::handle(), Linker::handle(), Packager::handle()],
            IndexMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn paths_cover_indirect_outputs() {
        let tc = chain();
        let compiler = ToolId::of::<Compiler>();
        assert!(tc.can_create_output(compiler, ".o"));
        assert!(tc.can_create_output(compiler, ".elf"));
        assert!(tc.can_create_output(compiler, ".pkg"));
        assert!(!tc.can_create_output(ToolId::of::<Packager>(), ".o"));
    }

    #[test]
    fn reachability_counts_downstream_extensions() {
        let tc = chain();
        let compiler = ToolId::of::<Compiler>();
        tc.create_reachability(compiler);
        assert!(tc.is_output_active(".o"));
        assert!(tc.is_output_active(".elf"));
        assert!(tc.is_output_active(".pkg"));
        assert!(tc.has_any_reachability());

        tc.release_reachability(compiler).unwrap();
        assert!(!tc.is_output_active(".o"));
        assert!(!tc.has_any_reachability());
    }

    #[test]
    fn releasing_unseen_reachability_is_an_error() {
        let tc = chain();
        assert!(tc.release_reachability(ToolId::of::<Compiler>()).is_err());
    }

    #[test]
    fn tools_for_matches_single_inputs_only() {
        let tc = chain();
        let for_c = tc.tools_for(Some(".c"), None);
        assert_eq!(for_c.len(), 1);
        assert_eq!(for_c[0].name(), "compiler");
        // The linker takes .o as a group, not as a single input.
        assert!(tc.tools_for(Some(".o"), None).is_empty());
        // Excluding the generating tool.
        assert!(tc.tools_for(Some(".c"), Some(ToolId::of::<Compiler>())).is_empty());
    }

    #[test]
    fn deactivated_tools_drop_out() {
        let tc = chain();
        tc.deactivate_tool(ToolId::of::<Compiler>());
        assert!(!tc.is_tool_active(ToolId::of::<Compiler>()));
        assert!(tc.tools_for(Some(".c"), None).is_empty());
        assert_eq!(tc.active_tools().len(), 2);
    }

    #[test]
    fn search_extensions_cover_files_and_groups() {
        let tc = chain();
        let exts = tc.search_extensions();
        assert!(exts.contains(".c"));
        assert!(exts.contains(".o"));
        assert!(exts.contains(".elf"));
        assert!(!exts.contains(".pkg"));
    }
}
