/// Upper bound of cached keys for messages that have not arrived yet.
pub const MAX_SKIPPED_MESSAGE_KEYS: usize = 2000;

/// A single header may not advance a receiving chain further than this.
pub const MAX_FORWARD_JUMP: u32 = 25_000;

/// Superseded sessions kept per peer for messages still in flight.
pub const MAX_ARCHIVED_SESSIONS: usize = 5;
