//! Core of the TCP replay interception server.
//!
//! Response packets of a replayed flow are diverted by the kernel firewall
//! into a queue; this crate classifies them against a whitelist, suppresses
//! the replayed ones, and returns their fingerprints to the replay clients
//! registered over the control plane.

pub mod classifier;
pub mod combine;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod router;
pub mod server;
pub mod settings;
pub mod stats;
pub mod whitelist;

pub use classifier::{Classifier, Outcome};
pub use packet::{PacketDescriptor, ResponseHeader, Verdict};
pub use pool::{StagingPool, VerdictSlot};
pub use queue::KernelQueue;
pub use router::Router;
pub use server::InterceptServer;
pub use settings::{Backend, Settings};
pub use stats::InterceptStats;
pub use whitelist::Whitelist;

#[cfg(test)]
pub(crate) mod testutil;
