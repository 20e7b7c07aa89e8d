use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Widest span a single booking may cover.
pub const MAX_SPAN_DURATION_MS: Ms = 2 * 366 * DAY_MS;

/// Longest accepted line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
