//! The change feed processor.
//!
//! ```text
//!   PartitionDiscoverer ──► balancer ──► LeaseManager ──► WorkerRegistry
//!                                             ▲                 │
//!                                  checkpoint │                 ▼
//!                                        Dispatcher ◄── PartitionWorker ◄── FeedReader
//! ```
//!
//! [`ChangeFeedProcessor`] drives all of it; the other types are public for
//! embedding the pieces separately and for tests.

pub mod balancer;
pub mod controller;
pub mod discovery;
pub mod dispatcher;
pub mod feed_reader;
pub mod lease_manager;
pub mod supervisor;
pub mod worker;

pub use controller::{ChangeFeedProcessor, ProcessorState};
pub use discovery::PartitionDiscoverer;
pub use dispatcher::{ChangeHandler, Dispatcher, FnHandler, handler_fn};
pub use feed_reader::FeedReader;
pub use lease_manager::LeaseManager;
pub use supervisor::{WorkerExit, WorkerRegistry};
pub use worker::PartitionWorker;
