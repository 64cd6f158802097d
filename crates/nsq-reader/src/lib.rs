// Consumer-side orchestration for nsq: decides which nsqd nodes to hold a
// subscribed connection to and routes every inbound message.
//
// READER DESIGN NOTES
// -------------------
// The engine is built around one rule: every piece of mutable orchestration
// state (tracked connection ids, the lookupd rotation, the closed flag) lives
// behind a single mutex and is only touched from the engine task or from the
// lifecycle calls on `Reader`. Network work never happens under that lock:
//
// - connection handshakes run on their own spawned tasks and report back
//   through an unbounded notice channel,
// - lookupd queries run on their own spawned tasks and report back through a
//   second channel,
// - the engine task drains both channels plus the poll timer and applies each
//   result under the lock.
//
// Because the engine task applies a connection event before it publishes the
// corresponding `ReaderEvent`, internal bookkeeping (untracking a closed
// connection, attempt-based routing) is always visible before any external
// listener observes the event.
//
// Collaborators that own protocol and flow-control details sit behind traits
// (`ConnectionFactory`, `FlowControl`, `LookupClient`) so they can be swapped
// out; the crate ships a TCP connection, a RDY balancer and an HTTP lookup
// client as defaults.
pub mod address;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod flow;
pub mod lookup;
pub mod reader;
pub mod round_robin;

pub use address::{ConnectionId, TargetAddress};
pub use config::{AddressList, ReaderConfig, ReaderOptions};
pub use connection::tcp::{NsqdConnection, TcpConnectionFactory};
pub use connection::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionParams, EventSink, Message,
    MessageResponse,
};
pub use error::{ConfigError, ConnectionError, ReaderError};
pub use events::{EventStream, ReaderEvent};
pub use flow::{FlowControl, ReadyBalancer};
pub use lookup::{HttpLookup, LookupClient, Producer};
pub use reader::router::{Route, classify};
pub use reader::{DiscoveryMode, Reader, ReaderBuilder};
pub use round_robin::RoundRobin;
