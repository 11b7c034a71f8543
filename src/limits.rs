use crate::model::Ms;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_GROUP_LEN: usize = 128;
pub const MAX_HOLDER_ID_LEN: usize = 256;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_LIST_LIMIT: usize = 1_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
