//! Silt Cluster Membership
//!
//! Gives the store tier a way to find ingest nodes and sibling stores. The
//! directory is deliberately small: a seed list from the command line, a
//! refresh loop that probes each seed's `/cluster/info` endpoint to learn its
//! type and liveness, and a typed `current()` listing for consumers. A full
//! gossip protocol is out of scope; this is the interface the core consumes.

mod peer;

pub use peer::{
    DirectoryError, HttpPeerDirectory, NodeInfo, NodeType, PeerDirectory,
    DEFAULT_REFRESH_INTERVAL,
};
