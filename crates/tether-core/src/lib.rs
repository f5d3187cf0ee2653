//! # tether-core
//!
//! Connection registry, call signaling, presence and stream relay for the
//! Tether coordination server.
//!
//! - **Coordinator** - accepts connections, validates and dispatches envelopes,
//!   computes audiences, owns disconnect cleanup
//! - **SignalingService** - call and peer lifecycle, offer/answer/ICE routing
//! - **PresenceService** - which connections belong to which user and channel
//! - **StreamRelay** - one-to-many control/media broadcast
//! - **Collaborators** - identity, directory and message store traits with
//!   in-memory implementations
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  envelope   ┌─────────────┐      ┌──────────────────┐
//! │ Connection │────────────▶│ Coordinator │─────▶│ SignalingService │
//! └────────────┘             └─────────────┘      └──────────────────┘
//!       ▲                      │    │    │               │
//!       │       outbox         │    │    ▼               ▼ SignalQueue
//!       └──────────────────────┘    │  Presence    (drained by the
//!                                   ▼               coordinator)
//!                          Identity / Directory / Store
//! ```

pub mod audience;
pub mod call;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod identity;
pub mod ids;
pub mod outbound;
pub mod presence;
pub mod relay;
pub mod signaling;
pub mod store;

pub use audience::Audience;
pub use call::{CallInfo, Lifecycle, Peer, Topology};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorStats, Dispatched};
pub use directory::{Channel, ChannelPatch, Directory, Hub, MemoryDirectory};
pub use error::DomainError;
pub use identity::{Grant, IdentityProvider, MemoryIdentity};
pub use ids::{CallId, ChannelId, ConnectionId, HubId, PeerId, UserId};
pub use outbound::{Outbound, Outbox};
pub use presence::PresenceService;
pub use relay::{Plane, RelayError, RelayStats, StreamRelay, StreamRole};
pub use signaling::{Seat, SignalEvent, SignalKind, SignalQueue, SignalingError, SignalingService};
pub use store::{MemoryMessageStore, MessageStore, SequenceAllocator, StoredMessage};
