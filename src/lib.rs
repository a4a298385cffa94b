// peerkeep - peer-to-peer encrypted block backup
//
// Files are split into content-addressed, encrypted blocks and replicated onto
// a bounded set of trusted peers (with an optional cloud fallback). Peers are
// challenged periodically to prove they still hold the exact bytes, and a node
// that lost its local catalog can rebuild it from whatever its peers still hold.

pub mod backup;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod host;
pub mod model;
pub mod network;
pub mod node;
pub mod pipeline;
pub mod protocol;
pub mod recovery;
pub mod replication;
pub mod scheduler;
pub mod store;
pub mod verification;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::NodeConfig;
pub use model::{Block, BlockId, BlockLocation, PeerId, RecoveryState};
pub use node::{Node, NodeDeps, NodeError};
