pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_TIME_SLOT_LEN: usize = 32;
pub const MAX_CUSTOMER_FIELD_LEN: usize = 256;
pub const MAX_SEARCH_LEN: usize = 128;
pub const MAX_IDENTITY_LEN: usize = 128;

pub const MAX_BAYS: usize = 10_000;

/// Bound on the WAL writer queue; callers wait when it is full.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
