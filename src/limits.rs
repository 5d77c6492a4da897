/// Upper bound on a single quote line's quantity.
pub const MAX_QUANTITY_PER_LINE: u32 = 10_000;

/// Names of events, trucks, catalog items and tasks.
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_SKU_LEN: usize = 64;

pub const MAX_TASK_CHAIN_LEN: usize = 64;

pub const MAX_REASON_LEN: usize = 1024;

/// Organizations served by one process.
pub const MAX_ORGS: usize = 1024;

pub const MAX_ORG_NAME_LEN: usize = 128;
