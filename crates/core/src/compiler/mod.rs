pub mod codegen;
pub mod enhance;
pub mod lint;
pub mod orchestrator;
pub mod swagger;

pub use codegen::generate;
pub use orchestrator::{CompileSummary, Orchestrator};
pub use swagger::SwaggerParser;
