mod keyed_locks;

pub use keyed_locks::KeyedLocks;
