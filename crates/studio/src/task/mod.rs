/// Pure per-task state machine and the scene merge it is built on.
pub mod reducer;
pub mod scene;
pub mod state;

pub use reducer::{ReduceError, ReduceResult, Reduction, TaskEvent, reduce};
pub use scene::{SceneUpdate, merge};
pub use state::{CANCELLED_MESSAGE, Phase, PipelineStage, Scene, ScriptEntry, TaskState};
