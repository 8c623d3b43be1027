// ── Business grid ────────────────────────────────────────

/// First bookable start time of the day (hour, minute).
pub const OPEN_TIME: (u32, u32) = (10, 0);

/// Last bookable start time of the day. One slot before closing.
pub const LAST_SLOT_START: (u32, u32) = (17, 30);

/// Business closes at this time; no slot may start here.
pub const CLOSE_TIME: (u32, u32) = (18, 0);

/// Grid granularity in minutes. Starts must land on a multiple of this.
pub const SLOT_MINUTES: u32 = 30;

// ── Payload ──────────────────────────────────────────────

pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REF_LEN: usize = 256;
pub const MAX_RESOURCE_KEY_LEN: usize = 256;

// ── Storage ──────────────────────────────────────────────

/// Largest WAL record accepted on replay. Anything bigger is treated as corruption.
pub const MAX_WAL_RECORD_BYTES: usize = 1 << 20;

/// Bounded queue between callers and the WAL writer task.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
