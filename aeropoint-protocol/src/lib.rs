//! AeroPoint Protocol Implementation
//!
//! This library provides the wire codec, transport channels, and motion
//! reconstruction for AeroPoint, a wireless relative-pointer transport:
//! a handheld sender streams small movement reports over whichever local
//! transport is available, and a receiver turns them back into cursor
//! motion.

pub mod arbitrator;
pub mod reconstruct;
pub mod registry;
pub mod report;
pub mod transport;

mod error;

// Re-export local types
pub use arbitrator::{ActiveSource, ReceiverArbitrator, SenderArbitrator};
pub use error::{ProtocolError, Result};
pub use reconstruct::{
    DirectApply, Interpolating, InterpolatingConfig, MotionPolicy, PointerOutput, ScreenBounds,
    DEFAULT_ALPHA, DEFAULT_EPSILON, DEFAULT_TICK_HZ,
};
pub use registry::{DiscoveryRegistry, RegistryEvent};
pub use report::{
    decode_legacy, encode_legacy, ButtonFlags, MotionReport, PacketClass, WireFormat,
    COMPACT_HEADER_CONTROL, COMPACT_HEADER_MOVEMENT, MIN_REPORT_LEN,
};
pub use transport::{
    Channel, ChannelEvent, ChannelState, LanChannel, LanChannelConfig, MeshChannel,
    MeshChannelConfig, Peer, PeerAddress, RadioChannel, RadioChannelConfig, TransportKind,
    LAN_SERVICE_TYPE, MESH_DISCOVERY_PORT, RADIO_SERVICE_UUID,
};
