pub mod pool;
pub use pool::{CommitList, Transaction, TxPool};

pub mod logger;
pub use logger::{NestedTopAction, TxLogger, UndoDispatch};

pub mod deadlock;
pub use deadlock::DeadlockDetector;
