pub mod matching;
pub mod persistence;
pub mod process_controller;
pub mod procfs_scanner;
pub mod resource_registry;

pub use matching::{BasenameMatcher, ExecutablePathMatcher, MatchReport, MatchingEngine};
pub use persistence::{JsonFileStore, StatePersistence};
pub use process_controller::{ControllerConfig, ProcessController};
pub use procfs_scanner::ProcfsScanner;
pub use resource_registry::ResourceRegistry;
