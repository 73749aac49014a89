pub mod context;
pub mod database;
pub mod error;
pub mod fits;
pub mod indexer;
pub mod manifest;
pub mod observability;
pub mod params;
pub mod pipeline;
pub mod presets;
pub mod repo;
pub mod resources;
pub mod scoring;
pub mod scratch;
pub mod selection;
pub mod session;
pub mod settings;
pub mod stage;
pub mod tools;
pub mod validation;

pub use context::ProcessingContext;
pub use database::{Database, MemoryDatabase};
pub use error::ProcessingError;
pub use pipeline::{Orchestrator, Outcome, ProcessOptions, ProcessingResult};
pub use repo::{Repo, RepoManager};
pub use settings::Settings;
pub use tools::{Tool, ToolRegistry};
