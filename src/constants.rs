use crate::wire::Seq;

// Capacity limits

/// Maximum number of daemons in one ring
pub const MAX_PROCS_RING: usize = 128;
/// Maximum number of segments in a configuration
pub const MAX_SEGMENTS: usize = 20;
/// Maximum number of representatives gathered while forming a ring
pub const MAX_REPS: usize = 64;
/// Maximum number of old rings that can be described on one form token
pub const MAX_FORM_RINGS: usize = 32;
/// Maximum number of holes a single ring may report on a form token
pub const MAX_SEQ_GAP: usize = 3000;
/// Number of slots in the packet store (a power of two)
pub const PACKET_STORE_SIZE: usize = 1 << 13;

// Sequence numbers

/// Gap between the highest known sequence number and the sequence stamped on a form token
pub const FORM_SEQ_GAP: Seq = 3333;
/// Above this value a token outside EVS is swallowed to force a fresh membership
pub const MAX_WRAP_SEQUENCE_VALUE: Seq = (1 << 31) - 25_000;
/// Token rounds allowed in EVS before giving up on the new ring
pub const MAX_EVS_ROUNDS: u32 = 250;

// Sizes

/// Largest datagram sent without a fragmentation warning
pub const MAX_PACKET_SIZE: usize = 1472;
/// Hard limit on the encoded size of a token body
pub const MAX_TOKEN_BODY: usize = 16 * 1024;
/// Largest message accepted from the upper layer
pub const MAX_MESSAGE_SIZE: usize = 144_000;
/// Queued outgoing messages above which the daemon reports congestion
pub const DOWN_QUEUE_WATER_MARK: usize = 500;

// Flow control

/// Default ring-wide window (new packets per token rotation)
pub const DEFAULT_WINDOW: i32 = 60;
/// Default per-daemon window (new packets per token visit)
pub const DEFAULT_PERSONAL_WINDOW: i32 = 15;
