pub mod client;
pub mod error;
pub mod memory;
pub mod model;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod redis_runtime;
pub mod runtime;
pub mod schedule;
pub mod task;
pub mod worker;

pub use client::JobQueueClient;
pub use error::{MonitorError, Result};
pub use memory::MemoryWorkRuntime;
pub use model::{Queue, Worker, WorkerPool, ALL, SCHEDULER_JOB_TYPE};
pub use monitor::MonitorController;
pub use pool::PoolManager;
pub use queue::QueueManager;
pub use redis_runtime::{KeyLayout, RedisWorkRuntime};
pub use runtime::{PoolHeartbeat, QueueDepth, WorkRuntime, WorkerObservation};
pub use schedule::{MemoryScheduleManager, Schedule, ScheduleManager};
pub use task::{MemoryTaskManager, Task, TaskField, TaskManager, TaskQuery, TaskStatus};
pub use worker::WorkerManager;
