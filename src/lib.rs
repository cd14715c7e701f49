//! rankmesh — group/topology substrate and transport glue for collective
//! communication runtimes.
//!
//! Collective algorithms sit on top of three things this crate provides:
//! compact virtual-to-global rank maps, deterministic topology-aware
//! subgrouping (node/socket/subnet planes and their leader subsets, derived
//! identically on every process from per-rank placement metadata), and an
//! asynchronous tagged point-to-point engine over an externally provided
//! non-blocking transport.

pub mod algo;
pub mod config;
pub mod error;
pub mod group;
pub mod location;
pub mod p2p;
pub mod rankmap;
pub mod topology;
pub mod transport;
pub mod types;

pub use algo::{AlgoGroup, AlgoScope};
pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use group::VirtualGroup;
pub use location::{Location, LocationOracle};
pub use p2p::{
    Datatype, P2pEngine, RequestHandle, RequestPoll, TransferPoll, TransferState,
};
pub use rankmap::RankMap;
pub use topology::{GroupStatus, TopoGroup, TopoLevel, Topology};
pub use transport::{
    Completion, Endpoint, EndpointDirectory, PackStream, RecvData, RequestMode, RequestStatus,
    SendData, Transport, TransportRequest, UnpackStream, WireTag,
};
pub use types::{IoVec, Rank};
