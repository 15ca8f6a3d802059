use std::time::Duration;

/// Hard cap on key size.
pub const MAX_KEY_SIZE_BYTES: usize = 1024;

/// Hard cap on value size (64 MiB).
pub const MAX_VALUE_SIZE_BYTES: usize = 64 * 1024 * 1024;

/// TTL applied to stored values when a PUT carries no explicit TTL.
pub const DEFAULT_VALUE_TTL: Duration = Duration::from_secs(30 * 60);

/// TTL applied to upload promises when a POST carries no explicit TTL.
pub const DEFAULT_PROMISE_TTL: Duration = Duration::from_secs(30);

/// Cadence of the background promise reaper.
pub const PROMISE_REAP_INTERVAL: Duration = Duration::from_secs(15);

/// Path prefix for cache operations; everything after it is the key.
pub const CACHE_PATH_PREFIX: &str = "/cache/";

// Wire header names shared by the server and the client.
pub const HEADER_SIZE: &str = "x-jc-size";
pub const HEADER_TTL: &str = "x-jc-ttl";
pub const HEADER_SUPERHOT: &str = "x-jc-superhot";
pub const HEADER_DRY_RUN: &str = "x-jc-dryrun";
pub const HEADER_PROMISE_TTL: &str = "x-jc-promise-ttl";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";
