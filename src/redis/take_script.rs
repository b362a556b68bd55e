use redis::{Script, Value, aio::ConnectionLike};

use crate::{QuotaBucketError, TakeResult};

/// Server-side refill-and-take procedure.
///
/// Field names (`s`, `t`, `i`, `k`, `m`), argument order and the four-value
/// reply are shared with every other client of the same buckets; changing any
/// of them is a breaking change.
pub(crate) const TAKE_SCRIPT: &str = r#"
    local F_START    = "s"
    local F_TICK     = "t"
    local F_INTERVAL = "i"
    local F_TOKENS   = "k"
    local F_MAX      = "m"

    local BOOTSTRAP_TTL = 30

    local key          = KEYS[1]
    local now          = tonumber(ARGV[1])
    local def_tokens   = tonumber(ARGV[2])
    local def_interval = tonumber(ARGV[3])

    local function present(value)
        return value ~= nil and value ~= false and value ~= ""
    end

    local function steady_ttl(interval)
        local ttl = math.ceil(3 * interval / 1000000000)
        if ttl < 1 then
            return 1
        end
        return ttl
    end

    local raw = redis.call("HGETALL", key)
    local data = {}
    for i = 1, #raw, 2 do
        data[raw[i]] = raw[i + 1]
    end

    local start = now
    if present(data[F_START]) then
        start = tonumber(data[F_START])
    else
        redis.call("HSET", key, F_START, now)
        redis.call("EXPIRE", key, BOOTSTRAP_TTL)
    end

    local last_tick = 0
    if present(data[F_TICK]) then
        last_tick = tonumber(data[F_TICK])
    else
        redis.call("HSET", key, F_TICK, 0)
        redis.call("EXPIRE", key, BOOTSTRAP_TTL)
    end

    local capacity = def_tokens
    if present(data[F_MAX]) then
        capacity = tonumber(data[F_MAX])
    end

    local tokens = capacity
    if present(data[F_TOKENS]) then
        tokens = tonumber(data[F_TOKENS])
    end

    local interval = def_interval
    if present(data[F_INTERVAL]) then
        interval = tonumber(data[F_INTERVAL])
    end

    local curr_tick = math.floor((now - start) / interval)
    if curr_tick < 0 then
        curr_tick = 0
    end

    local reset_at = start + ((curr_tick + 1) * interval)

    if last_tick < curr_tick then
        -- rate derives from the pre-refill token count; the cap bounds it
        local fill_rate = interval / tokens
        local available = (curr_tick - last_tick) * fill_rate
        if available > capacity then
            available = capacity
        end

        tokens = math.floor(available)
        last_tick = curr_tick

        redis.call("HSET", key,
            F_START, start,
            F_TICK, last_tick,
            F_INTERVAL, interval,
            F_TOKENS, tokens)
        redis.call("EXPIRE", key, steady_ttl(interval))
    end

    if tokens > 0 then
        tokens = tokens - 1
        redis.call("HSET", key, F_TOKENS, tokens)
        redis.call("EXPIRE", key, steady_ttl(interval))
        return {capacity, tokens, reset_at, true}
    end

    return {capacity, tokens, reset_at, false}
"#;

/// Number of values the take script replies with.
pub(crate) const TAKE_REPLY_ARITY: usize = 4;

#[derive(Clone, Debug)]
pub(crate) struct TakeScriptProxy {
    take_script: Script,
}

impl TakeScriptProxy {
    pub(crate) fn new() -> Self {
        Self {
            take_script: Script::new(TAKE_SCRIPT),
        }
    }

    /// Run the procedure against `bucket_key`. One round trip; the script
    /// is loaded on first use and invoked by hash afterwards.
    pub(crate) async fn take<C>(
        &self,
        connection: &mut C,
        bucket_key: &str,
        now: u64,
        default_tokens: u64,
        default_interval: u64,
    ) -> Result<TakeResult, QuotaBucketError>
    where
        C: ConnectionLike + Send,
    {
        let reply: Vec<Value> = self
            .take_script
            .key(bucket_key)
            .arg(now)
            .arg(default_tokens)
            .arg(default_interval)
            .invoke_async(connection)
            .await
            .map_err(|err| QuotaBucketError::from_redis("failed to run script", err))?;

        decode_take_reply(&reply)
    } // end method take
}

/// Decode `{limit, remaining, reset_at, allowed}`.
///
/// Lua `true` arrives as integer 1 and `false` as nil; RESP3 connections may
/// deliver a native boolean instead.
pub(crate) fn decode_take_reply(reply: &[Value]) -> Result<TakeResult, QuotaBucketError> {
    if reply.len() < TAKE_REPLY_ARITY {
        return Err(QuotaBucketError::MalformedResponse(format!(
            "response has less than {TAKE_REPLY_ARITY} values: {reply:?}"
        )));
    }

    let allowed = match &reply[3] {
        Value::Nil => false,
        Value::Int(n) => *n != 0,
        Value::Boolean(b) => *b,
        other => {
            return Err(QuotaBucketError::MalformedResponse(format!(
                "expected boolean for allowed, got {other:?}"
            )));
        }
    };

    Ok(TakeResult {
        limit: reply_u64(&reply[0], "limit")?,
        remaining: reply_u64(&reply[1], "remaining")?,
        reset_at: reply_u64(&reply[2], "reset_at")?,
        allowed,
    })
}

fn reply_u64(value: &Value, field: &str) -> Result<u64, QuotaBucketError> {
    match value {
        Value::Int(n) if *n >= 0 => Ok(*n as u64),
        other => Err(QuotaBucketError::MalformedResponse(format!(
            "expected non-negative integer for {field}, got {other:?}"
        ))),
    }
}
