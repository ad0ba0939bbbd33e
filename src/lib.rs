//! killfeed - rate-limited ingestion pipeline
//!
//! Pulls reference data and loss records from a rate-limited upstream API
//! into local storage through durable priority queues:
//!
//! ```text
//! [orchestrator] --enumerate--> [organizations] --> EntityWorker --+
//!       |                                                          v
//!       +--stored ids--> [organization_discovery] --> DiscoveryWorker
//!                                                          |
//!                      [suborganizations] <--children------+
//!                              |
//!                              v
//!                        EntityWorker --> storage <-- ValueWorker <-- [loss_values]
//! ```
//!
//! Every upstream call goes through one [`upstream::RateLimitedClient`].

pub mod bus;
pub mod config;
pub mod entity;
pub mod loss;
pub mod message;
pub mod monitor;
pub mod orchestrator;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod upstream;
pub mod utils;
pub mod workers;
