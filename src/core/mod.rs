// Core modules implementing buffer leasing, readers, writers and error modeling.
pub mod buffer;
pub mod error;
pub mod factory;
pub mod file;
pub mod pool;
pub mod reader;
pub mod task;
pub mod waiter;
pub mod window;
pub mod writer;
