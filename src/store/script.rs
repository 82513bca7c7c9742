//! The atomic check-and-record script executed inside the shared store.

/// Lua source of the sliding-window evaluation.
///
/// Arguments:
/// - `KEYS[1]`: the window key
/// - `ARGV[1]`: current time in milliseconds
/// - `ARGV[2]`: window length in milliseconds
/// - `ARGV[3]`: capacity
/// - `ARGV[4]`: unique member for this admission
///
/// Returns `1` when the call was admitted and recorded, `0` when the window
/// is full. A denial leaves the record untouched.
pub const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', key)
if count < capacity then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window)
    return 1
end
return 0
"#;

/// Script reply meaning the call was admitted.
pub const REPLY_ALLOW: i64 = 1;
/// Script reply meaning the window is full.
pub const REPLY_DENY: i64 = 0;
