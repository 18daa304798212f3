pub mod instance;
pub mod process;
pub mod resource;
pub mod template;

pub use instance::{Instance, InstanceStatus};
pub use process::ProcessInfo;
pub use resource::{Resource, ResourceType};
pub use template::Template;
