//! Bencode encoding and decoding ([BEP-3]).
//!
//! Every KRPC message exchanged by the DHT is a bencoded dictionary, and
//! BEP-44 items hash and sign the bencoded form of their value. The decoder is
//! therefore strict: it only accepts the canonical encoding (no leading zeros,
//! dictionary keys sorted and unique), so that `encode(decode(x)) == x` holds
//! for every accepted input.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! ```
//! use mldht::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:q4:ping1:y1:qe").unwrap();
//! assert_eq!(value.get(b"q").and_then(|v| v.as_str()), Some("ping"));
//! assert_eq!(encode(&value).unwrap(), b"d1:q4:ping1:y1:qe");
//!
//! // Unsorted keys are only accepted by the lenient decoder
//! assert!(decode(b"d1:y1:q1:q4:pinge").is_err());
//! assert!(mldht::bencode::decode_lenient(b"d1:y1:q1:q4:pinge").is_ok());
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_lenient};
pub use encode::encode;
pub use error::BencodeError;
pub use value::{Dict, Value};
