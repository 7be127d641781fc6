pub mod cache;
pub mod column;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod evaluation;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod query;
pub mod registry;
pub mod table;

pub use column::{ColumnIdentity, ColumnKind};
pub use config::{load_config, PrismConfig};
pub use errors::{PrismError, PrismResult};
pub use pipeline::{Pipeline, PipelineHandle, PipelineState, PipelineStatus};
pub use registry::{FunctionOptions, FunctionRegistry, Registration};
