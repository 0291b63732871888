pub mod codec;
pub mod deadline;
pub mod graph;
pub mod job;
pub mod keys;
pub mod memdb;
pub mod metrics;
pub mod observer;
pub mod operation;
pub mod output;
pub mod pipeline;
pub mod runner;
pub mod settings;
pub mod state;
pub mod storage;
pub mod task;
pub mod trace;

pub use depot_macros::test;
