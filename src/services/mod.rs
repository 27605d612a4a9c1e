pub mod batch_writer;
pub mod device_pool;
pub mod poll_loop;

pub use batch_writer::{BatchWriter, EnqueueOutcome, WriterHandle, WriterStats};
pub use device_pool::{DevicePool, ShutdownReport};
pub use poll_loop::{DevicePoller, PollOutcome, PollerOptions};
