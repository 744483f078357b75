//! mldht - A BitTorrent mainline DHT node
//!
//! This library implements the Kademlia-based DHT used by BitTorrent clients,
//! following the BEP (BitTorrent Enhancement Proposals) specifications.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 routing and peer lookup, BEP-42 secure identifiers,
//!   BEP-44 mutable and immutable storage
//! - [`constants`] - Protocol sizes and tuning defaults

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{Dht, DhtConfig, DhtError, Id, Item, RoutingTable, ValueHandle};
