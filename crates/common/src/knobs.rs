//! Tunable limits and parameters for the registry and its workers.
//!
//! Every knob here should have a comment explaining what it's for and the
//! upper/lower bounds if applicable so an oncall engineer can adjust these
//! safely for a deployment if needed.
//!
//! When running locally, these knobs can all be overridden with an
//! environment variable.
#![deny(missing_docs)]

use std::{
    fmt::Debug,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

/// Read one knob from the environment, keeping the built-in default when
/// the variable is unset or does not parse. A typo'd override must never
/// take a service down.
fn knob<T>(name: &str, default: T) -> T
where
    T: Debug + FromStr,
    T::Err: Debug,
{
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => {
            tracing::info!("Knob {name} overridden to {value:?} from the environment");
            value
        },
        Err(e) => {
            tracing::warn!("Ignoring invalid {name}={raw}: {e:?}; keeping default {default:?}");
            default
        },
    }
}

/// Hard ceiling on the `limit` query parameter for listing endpoints.
/// Requests asking for more get clamped down to this.
pub static API_LIMIT_MAX: LazyLock<usize> = LazyLock::new(|| knob("API_LIMIT_MAX", 1000));

/// Page size used by listing endpoints when the caller does not pass a
/// `limit`.
pub static DEFAULT_PAGE_SIZE: LazyLock<usize> =
    LazyLock::new(|| knob("DEFAULT_PAGE_SIZE", 25));

/// Maximum number of bytes accepted for one image body. Uploads that exceed
/// this mid-stream are aborted and the image is killed. Default 1 TiB.
pub static IMAGE_SIZE_CAP: LazyLock<u64> =
    LazyLock::new(|| knob("IMAGE_SIZE_CAP", 1 << 40));

/// Chunk size for hashing and transferring image bodies. Larger values trade
/// memory for fewer suspension points.
pub static TRANSFER_CHUNK_SIZE: LazyLock<usize> =
    LazyLock::new(|| knob("TRANSFER_CHUNK_SIZE", 16 * 1024));

/// How many times a catalog operation is retried after a transient database
/// error before the error is surfaced.
pub static DB_MAX_RETRIES: LazyLock<u32> = LazyLock::new(|| knob("DB_MAX_RETRIES", 10));

/// Sleep between catalog retry attempts.
pub static DB_RETRY_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(knob("DB_RETRY_INTERVAL_SECS", 1)));

/// SQLite extended result codes treated as transient connectivity failures,
/// comma separated. The defaults are busy, locked, ioerr and cantopen.
pub static DB_RETRIABLE_ERROR_CODES: LazyLock<Vec<i32>> = LazyLock::new(|| {
    let raw: String = knob("DB_RETRIABLE_ERROR_CODES", "5,6,10,14".to_owned());
    raw.split(',')
        .filter_map(|code| code.trim().parse().ok())
        .collect()
});

/// How long the scrubber sleeps between sweeps.
pub static SCRUB_TIME: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(knob("SCRUB_TIME_SECS", 300)));

/// Minimum age of a pending_delete image before the scrubber reclaims its
/// body. Zero drains immediately; production deployments usually want a
/// window in which a delete can be noticed before the bytes are gone.
pub static SCRUB_GRACE_PERIOD: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(knob("SCRUB_GRACE_PERIOD_SECS", 0)));

/// How many sweeps may fail for one image before the scrubber leaves it in
/// pending_delete and stops retrying.
pub static SCRUBBER_MAX_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| knob("SCRUBBER_MAX_ATTEMPTS", 5));

/// When true, deletes park images in pending_delete for the scrubber instead
/// of reclaiming bodies inline.
pub static DELAYED_DELETE: LazyLock<bool> = LazyLock::new(|| knob("DELAYED_DELETE", false));

/// 16-byte AES key for encrypting location URLs at rest. Empty disables
/// encryption; reads accept both encrypted and plaintext rows either way.
pub static METADATA_ENCRYPTION_KEY: LazyLock<Option<String>> = LazyLock::new(|| {
    let raw: String = knob("METADATA_ENCRYPTION_KEY", String::new());
    (!raw.is_empty()).then_some(raw)
});

/// Maximum number of members one image can be shared with.
pub static IMAGE_MEMBER_QUOTA: LazyLock<usize> =
    LazyLock::new(|| knob("IMAGE_MEMBER_QUOTA", 128));

/// Maximum number of custom properties on one image.
pub static IMAGE_PROPERTY_QUOTA: LazyLock<usize> =
    LazyLock::new(|| knob("IMAGE_PROPERTY_QUOTA", 128));

/// Maximum number of tags on one image.
pub static IMAGE_TAG_QUOTA: LazyLock<usize> =
    LazyLock::new(|| knob("IMAGE_TAG_QUOTA", 128));
