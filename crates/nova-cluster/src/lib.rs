//! Nova cluster plane: node membership, placement, and autoscaling.
//!
//! The registry tracks worker nodes through heartbeats mirrored to a shared
//! store, the scheduler places functions on nodes by strategy (with warm
//! affinity), and the autoscaler converts pool statistics and metric deltas
//! into per-function desired-replica targets on the nova-core sandbox pool.

pub mod autoscaler;
pub mod node;
pub mod registry;
pub mod scheduler;
