// Tick processing, position lifecycle and stream supervision
pub mod candle_buffer;
pub mod engine;
pub mod position_manager;
pub mod supervisor;

pub use candle_buffer::{BufferError, CandleBuffer};
pub use engine::{TickOutcome, TradingEngine};
pub use position_manager::{
    ClosedTrade, ExitReason, LifecycleConfig, LifecycleEvent, Position, PositionManager, Stage,
    StageThresholds, StopMultipliers,
};
pub use supervisor::{Backoff, ConnectionState, StreamSupervisor, SupervisorConfig};
