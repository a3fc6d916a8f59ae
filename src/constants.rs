//! Fixed bounds for the ticket subsystem.
//!
//! # Tiger Style
//!
//! Every loop over storage is bounded by one of these limits so a single
//! request or cleaner pass cannot grow without bound.

/// Id prefix of ticket-granting tickets.
pub const TICKET_GRANTING_TICKET_PREFIX: &str = "TGT";

/// Id prefix of service tickets.
pub const SERVICE_TICKET_PREFIX: &str = "ST";

/// Id prefix of proxy-granting tickets.
pub const PROXY_GRANTING_TICKET_PREFIX: &str = "PGT";

/// Separator between the prefix and the rest of a ticket id.
pub const TICKET_ID_SEPARATOR: char = '-';

/// Default length of the random body of a generated ticket id.
pub const DEFAULT_TICKET_ID_BODY_LENGTH: usize = 32;

/// Lower bound on the random body length, keeps ids unguessable.
pub const MIN_TICKET_ID_BODY_LENGTH: usize = 16;

/// Width of one expiry bucket in milliseconds.
pub const DEFAULT_BUCKET_WIDTH_MS: u64 = 10_000;

/// Maximum number of expired TGT candidates returned by one index scan.
pub const DEFAULT_MAX_TGTS_TO_LOAD: u32 = 1_000;

/// Maximum entries fetched per key-value scan page.
pub const MAX_SCAN_PAGE: u32 = 1_000;

/// Upper bound on scan pages walked by a single enumeration.
pub const MAX_SCAN_PAGES: u32 = 1_000;

/// Maximum compare-and-update attempts before giving up on a contended ticket.
pub const MAX_UPDATE_RETRIES: u32 = 32;

/// Upper bound on retry jitter in milliseconds.
pub const RETRY_JITTER_MS: u64 = 2;

/// Maximum depth of a proxy chain walked when resolving expiry or cascading.
pub const MAX_CHAIN_DEPTH: u32 = 64;

/// Key prefix of the ticket-granting ticket table (TGT and PGT blobs).
pub const TGT_TABLE_PREFIX: &str = "_tickets:tgt:";

/// Key prefix of the service ticket table.
pub const ST_TABLE_PREFIX: &str = "_tickets:st:";

/// Key prefix of the expiry index, followed by `<bucket>:<ticket id>`.
pub const EXPIRY_INDEX_PREFIX: &str = "_tickets:expiry:";

/// Index entries for explicitly expired tickets, drained on every scan
/// regardless of the last-run marker.
pub const EXPIRED_QUEUE_PREFIX: &str = "_tickets:expiry:marked:";

/// Single-row marker holding the last fully processed expiry bucket.
pub const LAST_RUN_KEY: &str = "_tickets:cleaner:last_run";

/// Zero-padded width of bucket numbers so lexical order equals numeric order.
pub const BUCKET_KEY_WIDTH: usize = 20;
