pub mod backend;
pub mod fake;
pub mod language;

pub use backend::{ContainerBackend, ContainerSpec, ExecHandle, LabelledNetwork, NetworkSpec, OutputChunk};
pub use language::{ExecRecipe, Language};
