//! Project plans and settings flattening.
//!
//! A [`Plan`] is the pre-specialization description of a project: its
//! identity, dependencies, and a tree of setting overrides keyed first by
//! axis (`toolchain`, `architecture`, `target`, `platform`, `scope`) and then
//! by name. Declarations write into the tree through a stack of contexts;
//! entering a context of several axes and names multiplies the write frame,
//! so one `set_value` can land in many branches at once.
//!
//! [`Plan::flatten`] collapses the tree — together with the override trees of
//! every transitive dependency — into one concrete [`Settings`] snapshot for
//! a single (toolchain, architecture, target, platform) combination. How a
//! dependency's settings bleed into a dependent is controlled by scope
//! labels: `all` applies to every dependent, `children` to direct and
//! transitive dependents, `final` only to applications, and `intermediate`
//! to libraries linking the dependency.

use crate::{
    error::{BuildError, Result},
    settings::{Scalar, Settings, SettingsKey, Value},
};
use indexmap::{IndexMap, IndexSet};
use std::path::{Path, PathBuf};

/// One axis of the override tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    Toolchain,
    Architecture,
    Target,
    Platform,
    Scope,
}

impl Axis {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Toolchain => "toolchain",
            Self::Architecture => "architecture",
            Self::Target => "target",
            Self::Platform => "platform",
            Self::Scope => "scope",
        }
    }
}

/// How a dependency's overrides are absorbed by its dependents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeLabel {
    /// Applied to the project itself and everything that depends on it.
    All,
    /// Applied to non-application dependents (libraries linking this one).
    Intermediate,
    /// Applied only to application dependents.
    Final,
    /// Applied to direct and transitive dependents regardless of kind.
    Children,
}

impl ScopeLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Intermediate => "intermediate",
            Self::Final => "final",
            Self::Children => "children",
        }
    }
}

/// What kind of artifact a project produces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProjectType {
    #[default]
    Application,
    SharedLibrary,
    StaticLibrary,
    /// A grouping node that produces nothing and is skipped by builds (but
    /// kept when generating solutions).
    Stub,
}

impl ProjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::SharedLibrary => "sharedLibrary",
            Self::StaticLibrary => "staticLibrary",
            Self::Stub => "stub",
        }
    }

    fn from_value(value: &Value) -> Self {
        match value.as_str() {
            Some("sharedLibrary") => Self::SharedLibrary,
            Some("staticLibrary") => Self::StaticLibrary,
            Some("stub") => Self::Stub,
            _ => Self::Application,
        }
    }
}

/// Axis-name sets that narrow what a plan supports. An empty set on an axis
/// means "everything".
#[derive(Clone, Debug, Default)]
pub struct AxisLimits {
    limits: IndexMap<Axis, IndexSet<String>>,
}

impl AxisLimits {
    fn narrow(&mut self, axis: Axis, names: &[String]) {
        let set = self.limits.entry(axis).or_default();
        if set.is_empty() {
            set.extend(names.iter().cloned());
        } else {
            // Nested contexts are restrictive: only the intersection remains.
            set.retain(|name| names.iter().any(|n| n == name));
        }
    }

    /// Whether the axis admits the given name.
    pub fn admits(&self, axis: Axis, name: &str) -> bool {
        self.limits.get(&axis).map_or(true, |set| set.is_empty() || set.contains(name))
    }
}

/// One node of a plan's override tree: raw setting values plus sub-trees per
/// axis and name.
#[derive(Clone, Debug, Default)]
pub struct OverrideNode {
    values: IndexMap<SettingsKey, Value>,
    overrides: IndexMap<Axis, IndexMap<String, OverrideNode>>,
}

impl OverrideNode {
    fn branch(&self, axis: Axis, name: &str) -> Option<&OverrideNode> {
        self.overrides.get(&axis).and_then(|named| named.get(name))
    }

    fn branch_mut(&mut self, axis: Axis, name: &str) -> &mut OverrideNode {
        self.overrides.entry(axis).or_default().entry(name.to_string()).or_default()
    }
}

type NodePath = Vec<(Axis, String)>;

/// The concrete settings produced by flattening a plan for one combination.
#[derive(Debug)]
pub struct FlatProject {
    pub settings: Settings,
    pub depends: IndexSet<String>,
    pub project_type: ProjectType,
}

/// The (toolchain, architecture, target, platform) combination a plan is
/// flattened against.
#[derive(Clone, Copy, Debug)]
pub struct Combination<'a> {
    pub toolchain: &'a str,
    pub architecture: &'a str,
    pub target: &'a str,
    pub platform: &'a str,
}

/// A plan to create one or more concrete projects.
#[derive(Clone, Debug)]
pub struct Plan {
    name: String,
    working_directory: PathBuf,
    depends: Vec<String>,
    priority: i32,
    ignore_dependency_ordering: bool,
    auto_discover_source_files: bool,

    root: OverrideNode,
    context_frames: Vec<Vec<NodePath>>,
    saved_child_limits: Vec<AxisLimits>,

    /// Axis names this plan itself supports; combinations outside are
    /// skipped, not errors.
    pub(crate) self_limits: AxisLimits,
    /// Axis limits inherited by plans declared below this one.
    pub(crate) child_limits: AxisLimits,
    pub(crate) known_targets: IndexSet<String>,
    pub(crate) child_targets: IndexSet<String>,

    pub(crate) default_target: String,
    pub(crate) default_toolchain: Option<String>,
    pub(crate) default_architecture: Option<String>,
    pub(crate) default_architecture_map: IndexMap<String, String>,
}

impl Plan {
    pub fn new(
        name: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        depends: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name: name.into(),
            working_directory: working_directory.into(),
            depends: depends.into_iter().collect(),
            priority: 0,
            ignore_dependency_ordering: false,
            auto_discover_source_files: true,
            root: OverrideNode::default(),
            context_frames: vec![vec![Vec::new()]],
            saved_child_limits: Vec::new(),
            self_limits: AxisLimits::default(),
            child_limits: AxisLimits::default(),
            known_targets: IndexSet::new(),
            child_targets: IndexSet::new(),
            default_target: "release".to_string(),
            default_toolchain: None,
            default_architecture: None,
            default_architecture_map: IndexMap::new(),
        }
    }

    /// Create a plan inheriting the settings, limits and defaults of `base`.
    pub fn inherit(
        name: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        depends: impl IntoIterator<Item = String>,
        base: &Plan,
    ) -> Self {
        let mut plan = Self::new(name, working_directory, depends);
        plan.root = base.root.clone();
        plan.self_limits = base.child_limits.clone();
        plan.child_limits = base.child_limits.clone();
        plan.known_targets = base.child_targets.clone();
        plan.child_targets = base.child_targets.clone();
        plan.default_target = base.default_target.clone();
        plan.default_toolchain = base.default_toolchain.clone();
        plan.default_architecture = base.default_architecture.clone();
        plan.default_architecture_map = base.default_architecture_map.clone();
        plan
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn depends(&self) -> &[String] {
        &self.depends
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Raise this project in the build queue within its dependency ordering.
    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn ignore_dependency_ordering(&self) -> bool {
        self.ignore_dependency_ordering
    }

    /// Treat priority as a global value, lifting this project above or below
    /// the dependency order.
    pub fn set_ignore_dependency_ordering(&mut self, ignore: bool) {
        self.ignore_dependency_ordering = ignore;
    }

    pub fn auto_discover_source_files(&self) -> bool {
        self.auto_discover_source_files
    }

    /// When disabled, only manually added source files are built.
    pub fn set_auto_discover_source_files(&mut self, discover: bool) {
        self.auto_discover_source_files = discover;
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    /// Enter a context for storing setting overrides. Each `(axis, names)`
    /// entry multiplies the current write frame.
    pub fn enter_context(&mut self, entries: &[(Axis, &[&str])]) {
        self.saved_child_limits.push(self.child_limits.clone());
        let current = self.context_frames.last().cloned().unwrap_or_default();
        let mut frame = Vec::new();
        for (axis, names) in entries {
            let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
            if *axis != Axis::Scope {
                self.child_limits.narrow(*axis, &names);
            }
            for name in &names {
                for path in &current {
                    let mut path = path.clone();
                    path.push((*axis, name.clone()));
                    // Materialize the branch immediately so registration
                    // alone (with no writes) is visible to validation.
                    self.node_mut(&path);
                    frame.push(path);
                }
            }
        }
        self.context_frames.push(frame);
    }

    /// Leave the innermost context, restoring the previous write frame.
    pub fn leave_context(&mut self) {
        if self.context_frames.len() > 1 {
            self.context_frames.pop();
        }
        if let Some(limits) = self.saved_child_limits.pop() {
            self.child_limits = limits;
        }
    }

    pub fn with_context<R>(
        &mut self,
        entries: &[(Axis, &[&str])],
        f: impl FnOnce(&mut Plan) -> R,
    ) -> R {
        self.enter_context(entries);
        let result = f(self);
        self.leave_context();
        result
    }

    pub fn with_toolchains<R>(
        &mut self,
        names: &[&str],
        f: impl FnOnce(&mut Plan) -> R,
    ) -> R {
        self.with_context(&[(Axis::Toolchain, names)], f)
    }

    pub fn with_architectures<R>(
        &mut self,
        names: &[&str],
        f: impl FnOnce(&mut Plan) -> R,
    ) -> R {
        self.with_context(&[(Axis::Architecture, names)], f)
    }

    /// Enter a target context. Targets named here become *known*: a plan
    /// flattened for a target it has never heard of is skipped.
    pub fn with_target<R>(&mut self, name: &str, f: impl FnOnce(&mut Plan) -> R) -> R {
        self.known_targets.insert(name.to_string());
        self.child_targets.insert(name.to_string());
        self.with_context(&[(Axis::Target, &[name])], f)
    }

    pub fn with_platforms<R>(
        &mut self,
        names: &[&str],
        f: impl FnOnce(&mut Plan) -> R,
    ) -> R {
        self.with_context(&[(Axis::Platform, names)], f)
    }

    /// Enter a scope context: writes inside apply to dependents according to
    /// the label, not to this project itself.
    pub fn with_scope<R>(&mut self, label: ScopeLabel, f: impl FnOnce(&mut Plan) -> R) -> R {
        self.with_context(&[(Axis::Scope, &[label.as_str()])], f)
    }

    fn node_mut(&mut self, path: &NodePath) -> &mut OverrideNode {
        let mut node = &mut self.root;
        for (axis, name) in path {
            node = node.branch_mut(*axis, name);
        }
        node
    }

    fn write(&mut self, f: impl Fn(&mut IndexMap<SettingsKey, Value>)) {
        let frame = self.context_frames.last().cloned().unwrap_or_default();
        for path in &frame {
            f(&mut self.node_mut(path).values);
        }
    }

    // ------------------------------------------------------------------
    // Setting verbs
    // ------------------------------------------------------------------

    /// Set a value, replacing any previous one in the current contexts.
    pub fn set_value(&mut self, key: impl Into<SettingsKey>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        self.write(|values| {
            values.insert(key.clone(), value.clone());
        });
    }

    /// Set a value only where the key has not been written in the current
    /// contexts yet.
    pub fn set_value_if_unset(
        &mut self,
        key: impl Into<SettingsKey>,
        value: impl Into<Value>,
    ) {
        let key = key.into();
        let value = value.into();
        self.write(|values| {
            values.entry(key.clone()).or_insert_with(|| value.clone());
        });
    }

    /// Remove a key from the current contexts.
    pub fn unset(&mut self, key: impl Into<SettingsKey>) {
        let key = key.into();
        self.write(|values| {
            values.shift_remove(&key);
        });
    }

    /// Extend a list with several values.
    pub fn extend_list<V: Into<Value>>(
        &mut self,
        key: impl Into<SettingsKey>,
        items: impl IntoIterator<Item = V>,
    ) {
        let key = key.into();
        let items: Vec<Value> = items.into_iter().map(Into::into).collect();
        self.write(|values| {
            let entry = values.entry(key.clone()).or_insert_with(|| Value::List(Vec::new()));
            if let Value::List(list) = entry {
                list.extend(items.iter().cloned());
            }
        });
    }

    /// Append one value to a list.
    pub fn append_list(&mut self, key: impl Into<SettingsKey>, item: impl Into<Value>) {
        let key = key.into();
        let item = item.into();
        self.write(|values| {
            let entry = values.entry(key.clone()).or_insert_with(|| Value::List(Vec::new()));
            if let Value::List(list) = entry {
                list.push(item.clone());
            }
        });
    }

    /// Merge key/value pairs into a map, later writes winning.
    pub fn update_map<K: Into<String>, V: Into<Value>>(
        &mut self,
        key: impl Into<SettingsKey>,
        entries: impl IntoIterator<Item = (K, V)>,
    ) {
        let key = key.into();
        let entries: Vec<(String, Value)> =
            entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.write(|values| {
            let entry = values.entry(key.clone()).or_insert_with(|| Value::Map(IndexMap::new()));
            if let Value::Map(map) = entry {
                for (k, v) in &entries {
                    map.insert(k.clone(), v.clone());
                }
            }
        });
    }

    /// Union several values into a set.
    pub fn union_set<S: Into<Scalar>>(
        &mut self,
        key: impl Into<SettingsKey>,
        items: impl IntoIterator<Item = S>,
    ) {
        let key = key.into();
        let items: Vec<Scalar> = items.into_iter().map(Into::into).collect();
        self.write(|values| {
            let entry = values.entry(key.clone()).or_insert_with(|| Value::Set(IndexSet::new()));
            if let Value::Set(set) = entry {
                set.extend(items.iter().cloned());
            }
        });
    }

    /// Add one value to a set.
    pub fn add_to_set(&mut self, key: impl Into<SettingsKey>, item: impl Into<Scalar>) {
        let key = key.into();
        let item = item.into();
        self.write(|values| {
            let entry = values.entry(key.clone()).or_insert_with(|| Value::Set(IndexSet::new()));
            if let Value::Set(set) = entry {
                set.insert(item.clone());
            }
        });
    }

    /// Perform an arbitrary transformation on the value in each current
    /// context, receiving the current value (or `None`) and returning the
    /// new one.
    pub fn perform(
        &mut self,
        key: impl Into<SettingsKey>,
        mut action: impl FnMut(Option<Value>) -> Value,
    ) {
        let key = key.into();
        let frame = self.context_frames.last().cloned().unwrap_or_default();
        for path in &frame {
            let values = &mut self.node_mut(path).values;
            let current = values.get(&key).cloned();
            values.insert(key.clone(), action(current));
        }
    }

    // ------------------------------------------------------------------
    // Common declarations
    // ------------------------------------------------------------------

    /// Set the output name and project type.
    pub fn set_output(&mut self, name: &str, project_type: ProjectType) {
        self.set_value("outputName", name);
        self.set_value("projectType", project_type.as_str());
    }

    pub fn set_intermediate_directory(&mut self, dir: impl AsRef<Path>) {
        self.set_value("intermediateDir", dir.as_ref());
    }

    pub fn set_output_directory(&mut self, dir: impl AsRef<Path>) {
        self.set_value("outputDir", dir.as_ref());
    }

    /// Explicitly add source files, bypassing discovery.
    pub fn add_source_files<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        self.union_set("sourceFiles", files.into_iter().map(|p| Scalar::from(p.as_ref())));
    }

    /// Exclude directories from source discovery.
    pub fn add_exclude_directories<I, S>(&mut self, dirs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        self.union_set("excludeDirs", dirs.into_iter().map(|p| Scalar::from(p.as_ref())));
    }

    /// Additional directories to discover sources in, beyond the working
    /// directory.
    pub fn add_extra_directories<I, S>(&mut self, dirs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        self.union_set("extraDirs", dirs.into_iter().map(|p| Scalar::from(p.as_ref())));
    }

    /// Link against the named libraries.
    pub fn add_libraries<I, S>(&mut self, libraries: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        self.union_set("libraries", libraries);
    }

    // ------------------------------------------------------------------
    // Flattening
    // ------------------------------------------------------------------

    /// Collapse this plan and its dependency chain into one settings snapshot
    /// for the given combination.
    ///
    /// Returns `Ok(None)` when the combination is valid but this plan does
    /// not participate in it (axis limits, unknown target). Configuration
    /// errors — unknown dependencies, an unregistered toolchain, flattening
    /// from inside an open context — fail the run.
    pub fn flatten(
        &self,
        plans: &IndexMap<String, Plan>,
        combo: &Combination<'_>,
    ) -> Result<Option<FlatProject>> {
        if self.context_frames.len() != 1 {
            return Err(BuildError::OpenContext(self.name.clone()));
        }
        if self.root.branch(Axis::Toolchain, combo.toolchain).is_none() {
            return Err(BuildError::UnregisteredToolchain {
                toolchain: combo.toolchain.to_string(),
                project: self.name.clone(),
            });
        }
        if !self.self_limits.admits(Axis::Toolchain, combo.toolchain) {
            debug!("project {} does not support toolchain {}", self.name, combo.toolchain);
            return Ok(None);
        }
        if !self.self_limits.admits(Axis::Platform, combo.platform) {
            debug!("project {} does not support platform {}", self.name, combo.platform);
            return Ok(None);
        }
        if !self.self_limits.admits(Axis::Architecture, combo.architecture) {
            debug!(
                "project {} does not support architecture {}",
                self.name, combo.architecture
            );
            return Ok(None);
        }
        if !self.self_limits.admits(Axis::Target, combo.target) {
            debug!("project {} does not support target {}", self.name, combo.target);
            return Ok(None);
        }
        if !self.known_targets.contains(combo.target) {
            debug!("project {} does not know about target {}", self.name, combo.target);
            return Ok(None);
        }

        let project_type = self
            .final_value(&SettingsKey::global("projectType"), combo)
            .map(|v| ProjectType::from_value(&v))
            .unwrap_or_default();

        let mut settings = Settings(self.root.values.clone());

        let mut depends = IndexSet::new();
        self.flatten_depends(plans, &mut depends, self)?;

        // Libraries declared directly on this plan link after everything
        // contributed by dependencies; stash them and re-union at the end.
        let own_libraries = settings.remove("libraries");

        self.flatten_overrides(&mut settings, &self.root, combo, Some("all"), false);

        for depend in &depends {
            let depend = &plans[depend];
            if project_type == ProjectType::Application {
                let output_name = depend
                    .final_value(&SettingsKey::global("outputName"), combo)
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| depend.name.clone());
                let merged = Value::merged(
                    settings.get("libraries"),
                    &Value::Set(IndexSet::from([Scalar::from(output_name)])),
                );
                settings.insert("libraries", merged);

                self.flatten_overrides(&mut settings, &depend.root, combo, Some("all"), false);
                self.flatten_overrides(
                    &mut settings,
                    &depend.root,
                    combo,
                    Some("children"),
                    false,
                );
                self.flatten_overrides(&mut settings, &depend.root, combo, Some("final"), false);
            } else {
                self.flatten_overrides(&mut settings, &depend.root, combo, Some("all"), false);
                self.flatten_overrides(
                    &mut settings,
                    &depend.root,
                    combo,
                    Some("children"),
                    false,
                );
                self.flatten_overrides(&mut settings, &depend.root, combo, Some("scope"), false);
            }
        }

        let restored = Value::merged(
            settings.get("libraries"),
            &own_libraries.unwrap_or_else(|| Value::Set(IndexSet::new())),
        );
        settings.insert("libraries", restored);

        self.flatten_overrides(&mut settings, &self.root, combo, None, false);

        Ok(Some(FlatProject { settings, depends, project_type }))
    }

    fn flatten_depends(
        &self,
        plans: &IndexMap<String, Plan>,
        out: &mut IndexSet<String>,
        plan: &Plan,
    ) -> Result<()> {
        for depend in &plan.depends {
            let Some(depend_plan) = plans.get(depend) else {
                return Err(BuildError::UnknownDependency {
                    project: plan.name.clone(),
                    dependency: depend.clone(),
                });
            };
            if *depend == self.name {
                continue;
            }
            self.flatten_depends(plans, out, depend_plan)?;
            out.insert(depend.clone());
        }
        Ok(())
    }

    fn flatten_overrides(
        &self,
        out: &mut Settings,
        node: &OverrideNode,
        combo: &Combination<'_>,
        scope: Option<&str>,
        in_scope: bool,
    ) {
        let branches = [
            (Axis::Toolchain, combo.toolchain),
            (Axis::Architecture, combo.architecture),
            (Axis::Target, combo.target),
            (Axis::Platform, combo.platform),
        ];
        for (axis, name) in branches {
            if let Some(branch) = node.branch(axis, name) {
                self.absorb_settings(out, branch, combo, scope, in_scope);
            }
        }
        if let Some(label) = scope {
            if let Some(branch) = node.branch(Axis::Scope, label) {
                self.absorb_settings(out, branch, combo, scope, true);
            }
        }
    }

    fn absorb_settings(
        &self,
        out: &mut Settings,
        node: &OverrideNode,
        combo: &Combination<'_>,
        scope: Option<&str>,
        in_scope: bool,
    ) {
        if scope.is_none() || in_scope {
            for (key, value) in &node.values {
                if key.tool.is_none() && key.name == "libraries" {
                    let merged = Value::merged_libraries(out.get(key.clone()), value);
                    out.insert(key.clone(), merged);
                    continue;
                }
                match value {
                    Value::List(_) | Value::Map(_) | Value::Set(_) => {
                        let merged = Value::merged(out.get(key.clone()), value);
                        out.insert(key.clone(), merged);
                    }
                    Value::Scalar(_) => {
                        // A scalar inherited through a dependency's scope must
                        // not clobber a value this plan wrote itself.
                        if !in_scope || !self.root.values.contains_key(key) {
                            out.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
        self.flatten_overrides(out, node, combo, scope, in_scope);
    }

    /// The most specific value for `key` under the given combination, without
    /// performing a full flatten.
    pub fn final_value(&self, key: &SettingsKey, combo: &Combination<'_>) -> Option<Value> {
        let current = self.root.values.get(key).cloned();
        self.final_value_from(&self.root, key, combo, current)
    }

    fn final_value_from(
        &self,
        node: &OverrideNode,
        key: &SettingsKey,
        combo: &Combination<'_>,
        mut current: Option<Value>,
    ) -> Option<Value> {
        let branches = [
            (Axis::Toolchain, combo.toolchain),
            (Axis::Architecture, combo.architecture),
            (Axis::Target, combo.target),
            (Axis::Platform, combo.platform),
        ];
        for (axis, name) in branches {
            if let Some(branch) = node.branch(axis, name) {
                if let Some(value) = branch.values.get(key) {
                    current = Some(value.clone());
                }
                current = self.final_value_from(branch, key, combo, current);
            }
        }
        current
    }

    // ------------------------------------------------------------------
    // Axis defaults
    // ------------------------------------------------------------------

    pub(crate) fn resolve_toolchain(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(name) => Ok(name.to_string()),
            None => self.default_toolchain.clone().ok_or_else(|| {
                BuildError::msg(format!(
                    "no toolchain requested and no default toolchain set for project `{}`",
                    self.name
                ))
            }),
        }
    }

    pub(crate) fn resolve_architecture(
        &self,
        toolchain: &str,
        requested: Option<&str>,
    ) -> Result<String> {
        if let Some(name) = requested {
            return Ok(name.to_string());
        }
        if let Some(default) = &self.default_architecture {
            return Ok(default.clone());
        }
        self.default_architecture_map.get(toolchain).cloned().ok_or_else(|| {
            BuildError::msg(format!(
                "no architecture requested and no default architecture known for toolchain `{toolchain}`"
            ))
        })
    }

    pub(crate) fn resolve_target(&self, requested: Option<&str>) -> String {
        requested.map(str::to_string).unwrap_or_else(|| self.default_target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLATFORM: &str = "testos";

    fn combo<'a>(toolchain: &'a str, architecture: &'a str, target: &'a str) -> Combination<'a> {
        Combination { toolchain, architecture, target, platform: PLATFORM }
    }

    /// A plan with toolchain branches registered and a known target, the way
    /// the engine prepares one.
    fn plan_with_toolchains(name: &str, depends: &[&str], toolchains: &[&str]) -> Plan {
        let mut plan = Plan::new(name, "test", depends.iter().map(|s| s.to_string()));
        plan.with_context(&[(Axis::Toolchain, toolchains)], |_| {});
        plan.with_target("target", |_| {});
        plan
    }

    fn assert_set_order(settings: &Settings, key: &str, expected: &[&str]) {
        let items: Vec<String> = settings
            .get_set(key)
            .map(|set| set.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        assert_eq!(items, expected.iter().map(|s| s.to_string()).collect::<Vec<_>>(), "{key}");
    }

    #[test]
    fn overrides_apply_per_combination() {
        let mut plan = plan_with_toolchains("test", &[], &["tc1", "tc2"]);
        let plans = IndexMap::new();

        plan.set_value("value", 1i64);
        plan.append_list("list", 2i64);
        plan.add_to_set("set", 3i64);
        plan.update_map("dict", [("4", 5i64)]);

        plan.with_toolchains(&["tc1"], |plan| {
            plan.set_value("value", 6i64);
            plan.append_list("list", 7i64);
            plan.add_to_set("set", 3i64);
            plan.add_to_set("set", 8i64);
            plan.update_map("dict", [("9", 10i64)]);
            plan.update_map("dict", [("4", 11i64)]);

            plan.with_architectures(&["ar1"], |plan| {
                plan.set_value("value", 12i64);
                plan.append_list("list", 13i64);
                plan.add_to_set("set", 14i64);
                plan.update_map("dict", [("15", 16i64), ("4", 17i64)]);
            });

            plan.with_architectures(&["ar2"], |plan| {
                plan.set_value("value", 18i64);
                plan.append_list("list", 19i64);
            });
        });

        plan.with_architectures(&["ar2"], |plan| {
            plan.append_list("list", 24i64);
        });

        plan.with_architectures(&["ar3"], |plan| {
            plan.set_value("value", 28i64);
            plan.append_list("list", 29i64);
            plan.with_toolchains(&["tc2"], |plan| {
                plan.set_value("value", 34i64);
                plan.append_list("list", 35i64);
            });
        });

        plan.with_toolchains(&["tc2"], |plan| {
            plan.append_list("list", 40i64);
        });

        let flat = |tc: &str, ar: &str| {
            plan.flatten(&plans, &combo(tc, ar, "target")).unwrap().unwrap().settings
        };

        let p1 = flat("tc1", "ar1");
        let p2 = flat("tc1", "ar2");
        let p3 = flat("tc1", "ar3");
        let p4 = flat("tc2", "ar1");
        let p5 = flat("tc2", "ar2");
        let p6 = flat("tc2", "ar3");

        assert_eq!(p1.get("value"), Some(&Value::from(12i64)));
        assert_eq!(p2.get("value"), Some(&Value::from(18i64)));
        assert_eq!(p3.get("value"), Some(&Value::from(28i64)));
        assert_eq!(p4.get("value"), Some(&Value::from(1i64)));
        assert_eq!(p5.get("value"), Some(&Value::from(1i64)));
        assert_eq!(p6.get("value"), Some(&Value::from(34i64)));

        let as_ints = |settings: &Settings| -> Vec<i64> {
            settings
                .get_list("list")
                .unwrap()
                .iter()
                .filter_map(|v| v.as_scalar().and_then(Scalar::as_int))
                .collect()
        };
        assert_eq!(as_ints(&p1), vec![2, 7, 13]);
        assert_eq!(as_ints(&p2), vec![2, 7, 19, 24]);
        assert_eq!(as_ints(&p3), vec![2, 7, 29]);
        assert_eq!(as_ints(&p4), vec![2, 40]);
        assert_eq!(as_ints(&p5), vec![2, 40, 24]);
        assert_eq!(as_ints(&p6), vec![2, 40, 29, 35]);

        let set_ints = |settings: &Settings| -> Vec<i64> {
            settings.get_set("set").unwrap().iter().filter_map(Scalar::as_int).collect()
        };
        assert_eq!(set_ints(&p1), vec![3, 8, 14]);
        assert_eq!(set_ints(&p4), vec![3]);

        let dict = p1.get("dict").unwrap().as_map().unwrap();
        assert_eq!(dict.get("9"), Some(&Value::from(10i64)));
        assert_eq!(dict.get("15"), Some(&Value::from(16i64)));
        assert_eq!(dict.get("4"), Some(&Value::from(17i64)));
        let dict = p6.get("dict").unwrap().as_map().unwrap();
        assert_eq!(dict.get("4"), Some(&Value::from(5i64)));
        assert_eq!(dict.get("9"), None);
    }

    #[test]
    fn scope_overrides_reach_dependents() {
        let toolchains =
            ["scope-then-toolchain", "toolchain-then-scope", "no-toolchain"];
        let mut first = plan_with_toolchains("first", &[], &toolchains);
        let mut second = plan_with_toolchains("second", &["first"], &toolchains);
        let mut third = plan_with_toolchains("third", &["second"], &toolchains);

        first.set_value("projectType", ProjectType::StaticLibrary.as_str());
        second.set_value("projectType", ProjectType::StaticLibrary.as_str());
        third.set_value("projectType", ProjectType::Application.as_str());

        third.add_to_set("libraries", "lib1");

        first.with_scope(ScopeLabel::Final, |plan| {
            plan.add_to_set("libraries", "lib2");
            plan.set_value("should_be_one", 2i64);
            plan.add_to_set("someSet", "final");
            plan.with_toolchains(&["scope-then-toolchain"], |plan| {
                plan.add_to_set("libraries", "lib3");
            });
        });
        first.with_scope(ScopeLabel::Intermediate, |plan| {
            plan.add_to_set("someSet", "intermediate");
        });
        first.with_toolchains(&["toolchain-then-scope"], |plan| {
            plan.with_scope(ScopeLabel::Final, |plan| {
                plan.add_to_set("libraries", "lib4");
            });
        });

        second.with_scope(ScopeLabel::Final, |plan| {
            plan.add_to_set("libraries", "lib5");
            plan.set_value("should_be_one", 3i64);
        });

        third.set_value("should_be_one", 1i64);
        third.add_to_set("libraries", "lib6");

        let mut plans = IndexMap::new();
        plans.insert("first".to_string(), first);
        plans.insert("second".to_string(), second);
        plans.insert("third".to_string(), third);

        let flat = |name: &str, tc: &str| {
            plans[name].flatten(&plans, &combo(tc, "none", "target")).unwrap().unwrap().settings
        };

        for tc in toolchains {
            let settings = flat("third", tc);
            assert_eq!(settings.get("should_be_one"), Some(&Value::from(1i64)), "{tc}");
        }

        assert_set_order(
            &flat("third", "scope-then-toolchain"),
            "libraries",
            &["first", "lib2", "lib3", "second", "lib5", "lib1", "lib6"],
        );
        assert_set_order(
            &flat("third", "toolchain-then-scope"),
            "libraries",
            &["first", "lib4", "lib2", "second", "lib5", "lib1", "lib6"],
        );
        assert_set_order(
            &flat("third", "no-toolchain"),
            "libraries",
            &["first", "lib2", "second", "lib5", "lib1", "lib6"],
        );

        // Final-scope values land on applications only.
        assert_set_order(&flat("third", "no-toolchain"), "someSet", &["final"]);
        assert_set_order(&flat("second", "no-toolchain"), "libraries", &[]);
        assert_set_order(&flat("first", "no-toolchain"), "libraries", &[]);
    }

    #[test]
    fn plans_inherit_base_settings() {
        let mut base = plan_with_toolchains("base", &[], &["none"]);
        base.append_list("list", 1i64);
        base.append_list("list", 2i64);
        base.update_map("dict", [("1", 2i64)]);

        let mut child = Plan::inherit("child", "test", [], &base);
        child.append_list("list", 3i64);
        child.update_map("dict", [("3", 4i64)]);

        let plans = IndexMap::new();
        let flat_base = base.flatten(&plans, &combo("none", "none", "target")).unwrap().unwrap();
        let flat_child =
            child.flatten(&plans, &combo("none", "none", "target")).unwrap().unwrap();

        let ints = |settings: &Settings| -> Vec<i64> {
            settings
                .get_list("list")
                .unwrap()
                .iter()
                .filter_map(|v| v.as_scalar().and_then(Scalar::as_int))
                .collect()
        };
        assert_eq!(ints(&flat_base.settings), vec![1, 2]);
        assert_eq!(ints(&flat_child.settings), vec![1, 2, 3]);
        assert_eq!(flat_child.settings.get("dict").unwrap().as_map().unwrap().len(), 2);
    }

    #[test]
    fn multi_name_contexts_write_every_branch() {
        let mut plan = plan_with_toolchains("test", &[], &["none", "tc1", "tc2"]);
        plan.set_value("a", 1i64);
        plan.with_toolchains(&["tc1", "tc2"], |plan| {
            plan.set_value("a", 2i64);
        });

        let plans = IndexMap::new();
        let value = |tc: &str| {
            plan.flatten(&plans, &combo(tc, "none", "target"))
                .unwrap()
                .unwrap()
                .settings
                .get("a")
                .cloned()
        };
        assert_eq!(value("none"), Some(Value::from(1i64)));
        assert_eq!(value("tc1"), Some(Value::from(2i64)));
        assert_eq!(value("tc2"), Some(Value::from(2i64)));
    }

    #[test]
    fn unknown_targets_are_skipped() {
        let plan = plan_with_toolchains("test", &[], &["tc1"]);
        let plans = IndexMap::new();
        assert!(plan.flatten(&plans, &combo("tc1", "none", "nosuch")).unwrap().is_none());
    }

    #[test]
    fn unregistered_toolchain_is_an_error() {
        let plan = plan_with_toolchains("test", &[], &["tc1"]);
        let plans = IndexMap::new();
        assert!(matches!(
            plan.flatten(&plans, &combo("tc9", "none", "target")),
            Err(BuildError::UnregisteredToolchain { .. })
        ));
    }

    #[test]
    fn axis_limits_narrow_by_intersection() {
        let mut plan = plan_with_toolchains("test", &[], &["tc1", "tc2"]);
        // A nested context narrows the limit to the intersection.
        plan.enter_context(&[(Axis::Architecture, &["a", "b"])]);
        plan.enter_context(&[(Axis::Architecture, &["b", "c"])]);
        assert!(plan.child_limits.admits(Axis::Architecture, "b"));
        assert!(!plan.child_limits.admits(Axis::Architecture, "a"));
        plan.leave_context();
        assert!(plan.child_limits.admits(Axis::Architecture, "a"));
        plan.leave_context();
    }

    #[test]
    fn unknown_dependency_fails_flatten() {
        let plan = plan_with_toolchains("test", &["ghost"], &["tc1"]);
        let plans = IndexMap::new();
        assert!(matches!(
            plan.flatten(&plans, &combo("tc1", "none", "target")),
            Err(BuildError::UnknownDependency { .. })
        ));
    }
}
