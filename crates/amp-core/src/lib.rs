//! Promise-pipelined messaging between vats.
//!
//! A [`Vat`] owns a persistent [`store::Root`], a promise arena and a turn
//! queue. Eventual operations on remote references are queued on per-peer
//! [`pipeline::Pipeline`]s; inbound calls are answered by [`callee::serve`]
//! behind a session replay table.

mod error;
pub use error::{Error, Result};

pub mod callee;
pub mod caller;
pub mod codec;
pub mod config;
pub mod host;
pub mod interface;
pub mod message;
pub mod pipeline;
pub mod promise;
pub mod samples;
pub mod session;
pub mod store;
pub mod turn;
pub mod value;
pub mod vat;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{config_schema_json, load_config, write_schema_file, Config, VatSettings};
pub use host::{spawn, HostError, MemoryNetwork, Transport, VatHandle};
pub use interface::{Capability, Interface, Member, OpKind};
pub use promise::{Resolver, State};
pub use store::{MemoryStore, Root, Store};
pub use turn::Executor;
pub use value::{ObjectId, PromiseId, Ref, Rejection, Settled, Value};
pub use vat::Vat;
pub use wire::{Outgoing, TransportError, WireRequest, WireResponse};
