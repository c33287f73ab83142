/// Hard caps on input sizes. Rejected with `EngineError::LimitExceeded`.
pub const MAX_TOOLS: usize = 100_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_DEPARTMENT_LEN: usize = 255;
/// Allocations + reservations kept per tool, terminal ones included.
pub const MAX_RECORDS_PER_TOOL: usize = 50_000;
/// Widest borrow or reservation window, in days.
pub const MAX_WINDOW_DAYS: i64 = 366;
/// Widest availability query window, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3_660;
pub const MAX_RECURRENCE_INTERVAL: u32 = 365;
