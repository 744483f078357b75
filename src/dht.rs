//! Distributed Hash Table (BEP-5, BEP-42, BEP-44)
//!
//! A Kademlia DHT compatible with the BitTorrent mainline network: peer
//! discovery through `get_peers`/`announce_peer` and storage of signed and
//! unsigned items through `get`/`put`.
//!
//! Each transport gets its own [`RoutingTable`], whose bucket admission,
//! lookups and refreshes run on dedicated worker threads. The [`Dht`] front
//! end answers remote queries and exposes the lookup API.

mod bootstrap;
mod bucket;
mod config;
mod error;
mod id;
mod interest;
mod item;
mod message;
mod node;
mod queue;
mod routing;
mod secure_id;
mod server;
mod storage;
mod token;
mod transport;

pub use bucket::{Admission, Bucket, Reason};
pub use config::DhtConfig;
pub use error::{DataError, DhtError, KrpcError};
pub use id::Id;
pub use interest::{CandidateQueue, Interest, InterestFlags};
pub use item::{immutable_target, mutable_target, signable, Item};
pub use message::{Contact, DictExt, Envelope, TransactionId, Want};
pub use node::{GetReply, Liveness, Node, PeersReply};
pub use queue::{DistinctQueue, RejectCache};
pub use routing::{RoutingTable, TableStats};
pub use secure_id::{generate_secure_node_id, is_local_network, validate_node_id};
pub use server::{Dht, ValueHandle};
pub use storage::{DhtData, MergeFn, Observer, PeerSet, Storage};
pub use token::TokenIssuer;
pub use transport::{EndpointListener, Handler, KrpcSocket, Transport};

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;
