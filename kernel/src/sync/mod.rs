pub mod mutex;
pub mod semaphore;

pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
