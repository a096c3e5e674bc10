//! Blocking synchronization primitives built on top of
//! [`crate::scheduler::Scheduler`] and [`crate::mutex::MutexCb`].
pub mod condvar;
pub mod once;
pub mod queue;
pub mod semaphore;

pub use condvar::CondVarCb;
pub use once::OnceFlag;
pub use queue::{MessageQueueCb, QueueCb};
pub use semaphore::SemaphoreCb;
