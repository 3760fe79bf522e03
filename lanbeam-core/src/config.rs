//! Protocol constants shared by the server, the peer runtime and the engine.
//!
//! Wire-format constants (frame type bytes, IV layout) stay in their own
//! modules; everything here is a tunable.

use std::time::Duration;

// ── Chunking ─────────────────────────────────────────────────────────────────

/// Chunk size on a direct (data channel) transport.
pub const DIRECT_CHUNK_SIZE: u32 = 64 * 1024;

/// Chunk size on the relay transport. Larger because each relay frame pays a
/// header and a socket write; the relay socket buffers on the server side.
pub const RELAY_CHUNK_SIZE: u32 = 2 * 1024 * 1024;

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Buffered-amount low-water mark. A blocked sender resumes once the
/// transport's outstanding bytes fall to this level.
pub const BUFFERED_AMOUNT_LOW: usize = 2 * 1024 * 1024;

/// Buffered-amount high-water mark. The sender stops enqueuing while the
/// transport holds more than this many unsent bytes.
pub const BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024;

/// Chunks the relay transport may enqueue before forcing a buffer drain.
pub const RELAY_MAX_IN_FLIGHT: usize = 10;

/// Poll cadence for relay buffer drains (the relay socket has no low-buffer event).
pub const RELAY_BUFFER_POLL: Duration = Duration::from_millis(10);

/// Delay before re-opening a dropped relay socket.
pub const RELAY_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Minimum spacing between progress updates.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

// ── Presence ─────────────────────────────────────────────────────────────────

/// A record with no registration for this long is evicted on the next list.
pub const PEER_TTL: Duration = Duration::from_secs(60);

/// Peers re-register this often.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Registrations for the same id closer together than this are acknowledged
/// but ignored.
pub const REGISTRATION_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Same-name records older than this are treated as a reconnected device.
pub const DUPLICATE_NAME_STALENESS: Duration = Duration::from_millis(5000);

/// Device list polling cadence while browsing.
pub const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(300);

// ── Handshake / negotiation ──────────────────────────────────────────────────

/// How long a sender waits for accept/decline.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Granularity of the accept/decline wait.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a send waits for an in-flight negotiation to yield an open transport.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Granularity of the open-transport wait.
pub const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long one direct (data channel) connection attempt may take to open.
pub const DIRECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries after the first failed connection attempt.
pub const CONNECT_MAX_RETRIES: u32 = 3;

/// Backoff before each retry.
pub const CONNECT_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

// ── Connection quality ───────────────────────────────────────────────────────

/// Connection quality sampling cadence.
pub const QUALITY_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// An open transport buffering less than this is sampled as high quality.
pub const QUALITY_GOOD_BUFFERED: usize = 100_000;
