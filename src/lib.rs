//! A browser/server-portable peer-to-peer mesh overlay runtime built on
//! WebRTC data channels: peer connection management, XOR-distance peer
//! discovery, epidemic gossip, a consistent-hash DHT, and end-to-end
//! authenticated encryption, all driven by a single injected `Clock`/
//! `Spawner` pair so the whole stack runs deterministically under test.
//!
//! Start at [`mesh::Mesh`]; it wires every subcomponent below together.

pub mod clock;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod dht;
pub mod error;
pub mod events;
pub mod frame;
pub mod gossip;
pub mod id;
pub mod mesh;
pub mod peer;
pub mod signaling;
pub mod transport;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult, TransportError};
pub use events::{Level, MeshEvent};
pub use id::PeerId;
pub use mesh::Mesh;
