//! # Token-Bucket Lua Scripts
//!
//! The three scripts that carry out drip-refill math server-side so a
//! read-modify-write cycle never races across clients: `take` (consume,
//! possibly denying), `put` (return tokens, possibly going negative), and
//! `get` (read without consuming). All three read `TIME` from the server
//! itself rather than trusting the caller's clock, and all three are
//! embedded as `&'static str` and driven through [`redis::Script`],
//! `.key(..).arg(..).invoke_async(..)`.
//!
//! Storage shape: a hash at `"<prefix><type>:<key>"` with fields `d` (last
//! drip timestamp, ms) and `r` (remaining tokens, a Lua number - may go
//! negative after `put`). A bucket sitting at exactly full capacity is
//! deleted rather than written (`full-is-absent`), so a fresh key and a
//! freshly-drained-back-to-full key are indistinguishable in storage,
//! which is the point: nothing needs to be stored for a bucket nobody
//! has touched.

use redis::{ErrorKind, RedisError, RedisResult, Script, Value};

use crate::bucket_config::EffectiveBucket;

/// `take(key, size, per_interval, interval_ms, ttl_secs, tokens, now_override)`
///
/// `now_override` is `-1` in production (server TIME is authoritative);
/// tests that need a controllable clock pass a positive ms value instead.
pub const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local size = tonumber(ARGV[1])
local per_interval = tonumber(ARGV[2])
local interval_ms = tonumber(ARGV[3])
local ttl_secs = tonumber(ARGV[4])
local tokens = tonumber(ARGV[5])
local now_override = tonumber(ARGV[6])

local now
if now_override >= 0 then
    now = now_override
else
    local t = redis.call('TIME')
    now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local last_drip = now
local remaining = size

local data = redis.call('HMGET', key, 'd', 'r')
if data[1] and data[2] then
    last_drip = tonumber(data[1])
    remaining = tonumber(data[2])

    if per_interval > 0 and interval_ms > 0 then
        local elapsed = now - last_drip
        if elapsed > 0 then
            local drip_ms = interval_ms / per_interval
            local dripped = math.floor(elapsed / drip_ms)
            if dripped > 0 then
                remaining = math.min(size, remaining + dripped)
                last_drip = last_drip + dripped * drip_ms
            end
        end
    end
end

local conformant = remaining >= tokens
if conformant then
    remaining = remaining - tokens
end

if remaining >= size then
    redis.call('DEL', key)
else
    redis.call('HMSET', key, 'd', last_drip, 'r', remaining)
    redis.call('EXPIRE', key, ttl_secs)
end

local reset_ms = now
if per_interval > 0 and interval_ms > 0 and remaining < size then
    local drip_ms = interval_ms / per_interval
    local deficit = size - remaining
    reset_ms = now + math.ceil(deficit * drip_ms)
end

return {tostring(remaining), conformant and 1 or 0, now, reset_ms}
"#;

/// `put(key, size, per_interval, interval_ms, ttl_secs, tokens, now_override)`
///
/// `tokens` may be negative (a caller returning a debt, or deliberately
/// over-drafting a bucket for bookkeeping purposes).
pub const PUT_SCRIPT: &str = r#"
local key = KEYS[1]
local size = tonumber(ARGV[1])
local per_interval = tonumber(ARGV[2])
local interval_ms = tonumber(ARGV[3])
local ttl_secs = tonumber(ARGV[4])
local tokens = tonumber(ARGV[5])
local now_override = tonumber(ARGV[6])

local now
if now_override >= 0 then
    now = now_override
else
    local t = redis.call('TIME')
    now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local last_drip = now
local remaining = size

local data = redis.call('HMGET', key, 'd', 'r')
if data[1] and data[2] then
    last_drip = tonumber(data[1])
    remaining = tonumber(data[2])

    if per_interval > 0 and interval_ms > 0 then
        local elapsed = now - last_drip
        if elapsed > 0 then
            local drip_ms = interval_ms / per_interval
            local dripped = math.floor(elapsed / drip_ms)
            if dripped > 0 then
                remaining = math.min(size, remaining + dripped)
                last_drip = last_drip + dripped * drip_ms
            end
        end
    end
end

remaining = remaining + tokens

if remaining >= size then
    redis.call('DEL', key)
else
    redis.call('HMSET', key, 'd', last_drip, 'r', remaining)
    redis.call('EXPIRE', key, ttl_secs)
end

return {tostring(remaining), now}
"#;

/// `get(key, size, per_interval, interval_ms, now_override)` - read-only,
/// no writes; computes the drip forward locally without persisting it.
pub const GET_SCRIPT: &str = r#"
local key = KEYS[1]
local size = tonumber(ARGV[1])
local per_interval = tonumber(ARGV[2])
local interval_ms = tonumber(ARGV[3])
local now_override = tonumber(ARGV[4])

local now
if now_override >= 0 then
    now = now_override
else
    local t = redis.call('TIME')
    now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local last_drip = now
local remaining = size

local data = redis.call('HMGET', key, 'd', 'r')
if data[1] and data[2] then
    last_drip = tonumber(data[1])
    remaining = tonumber(data[2])

    if per_interval > 0 and interval_ms > 0 then
        local elapsed = now - last_drip
        if elapsed > 0 then
            local drip_ms = interval_ms / per_interval
            local dripped = math.floor(elapsed / drip_ms)
            if dripped > 0 then
                remaining = math.min(size, remaining + dripped)
            end
        end
    end
end

return {tostring(remaining), now}
"#;

pub fn take_script() -> Script {
    Script::new(TAKE_SCRIPT)
}

pub fn put_script() -> Script {
    Script::new(PUT_SCRIPT)
}

pub fn get_script() -> Script {
    Script::new(GET_SCRIPT)
}

#[derive(Debug, Clone, Copy)]
pub struct TakeOutcome {
    pub remaining: i64,
    pub conformant: bool,
    pub now_ms: u64,
    pub reset_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    pub remaining: i64,
    pub now_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct GetOutcome {
    pub remaining: i64,
    pub now_ms: u64,
}

fn bulk_error(what: &str) -> RedisError {
    RedisError::from((ErrorKind::TypeError, "unexpected script reply", what.to_string()))
}

fn value_i64(value: &Value) -> RedisResult<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Data(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|f| f as i64)
            .ok_or_else(|| bulk_error("expected numeric string")),
        _ => Err(bulk_error("expected integer or bulk string")),
    }
}

pub fn parse_take_reply(value: Value) -> RedisResult<TakeOutcome> {
    let items = match value {
        Value::Bulk(items) if items.len() == 4 => items,
        _ => return Err(bulk_error("take script must return a 4-element array")),
    };
    Ok(TakeOutcome {
        remaining: value_i64(&items[0])?,
        conformant: value_i64(&items[1])? != 0,
        now_ms: value_i64(&items[2])? as u64,
        reset_ms: value_i64(&items[3])? as u64,
    })
}

pub fn parse_put_reply(value: Value) -> RedisResult<PutOutcome> {
    let items = match value {
        Value::Bulk(items) if items.len() == 2 => items,
        _ => return Err(bulk_error("put script must return a 2-element array")),
    };
    Ok(PutOutcome { remaining: value_i64(&items[0])?, now_ms: value_i64(&items[1])? as u64 })
}

pub fn parse_get_reply(value: Value) -> RedisResult<GetOutcome> {
    let items = match value {
        Value::Bulk(items) if items.len() == 2 => items,
        _ => return Err(bulk_error("get script must return a 2-element array")),
    };
    Ok(GetOutcome { remaining: value_i64(&items[0])?, now_ms: value_i64(&items[1])? as u64 })
}

/// Resolves the sentinel `"all"` count to the bucket's capacity before any
/// script ever sees it - the Lua bodies above only ever deal in plain
/// numbers.
pub fn resolve_take_tokens(count: crate::engine::Count, effective: &EffectiveBucket) -> u64 {
    count.resolve(effective.size)
}
