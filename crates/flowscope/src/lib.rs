pub mod checkpoint;
pub mod config;
pub mod engine;
mod env;
pub mod error;
pub mod job;
pub mod logging;
pub mod mode;
pub mod optim;
pub mod placement;
pub mod scope;
pub mod session;
pub mod symbol;
pub mod tensor;
pub mod variable;

pub use config::SessionConfig;
pub use engine::{EngineError, EngineResult, InstructionsBuilder, ModelIo, NativeEngine};
pub use error::{Error, Result};
pub use job::{JobConfig, OpConf, PlacementSpec};
pub use mode::ExecutionMode;
pub use placement::{DeviceTag, Placement, PlacementStrategy};
pub use scope::{AttrValue, Scope};
pub use session::{Session, SessionStatus};
pub use symbol::SymbolId;
pub use tensor::{DType, HostTensor, Shape};
pub use variable::{Initializer, Regularizer, VariableBlob, VariableSpec};
