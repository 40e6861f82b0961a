//! Cross-node dispatch: routing, clients, transports and the receive path.

pub mod client;
pub mod dispatcher;
pub mod manager;
pub mod receiver;
pub mod topology;
pub mod transport;

pub use client::{RemoteClient, RemoteClientStats, SelfClient, StreamingClient, StreamingSettings};
pub use dispatcher::{DispatchStats, RemoteDispatcher};
pub use manager::{RemoteClientManager, TopologyChange};
pub use receiver::{ReceiveStats, RemoteReceiveService};
pub use topology::ClusterTopology;
pub use transport::{LoopbackTransport, RemoteServer, TcpTransport};
