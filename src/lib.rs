#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BuildError, BuildFailure, IoError, Result};

pub mod utils;

pub mod dag;
pub use dag::Dag;

pub mod settings;
pub use settings::{Scalar, Settings, SettingsKey, Value};

pub mod plan;
pub use plan::{Axis, Combination, Plan, ProjectType, ScopeLabel};

pub mod tool;
pub use tool::{tool, SolutionGenerator, Tool, ToolHandle, ToolId, ToolSpec};

pub mod toolchain;
pub use toolchain::Toolchain;

pub mod input;
pub use input::InputFile;

pub mod project;
pub use project::Project;

pub mod recompile;
pub use recompile::{CompileChecker, IncludeScanChecker, Memo, RecompileStamp, TimestampChecker};

pub mod cache;
pub use cache::SettingsCache;

pub mod pool;
pub use pool::{PoolEvent, WorkerPool};

mod scheduler;

mod run;
pub use run::{AxisRequest, BuildOptions, BuildSummary, Engine};
