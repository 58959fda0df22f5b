//! ─── XLN Protocol Constants ─────────────────────────────────────────────────
//!
//! Domain-separation tags, machine budgets and bilateral-protocol defaults.

// ── Hash domain tags ─────────────────────────────────────────────────────────

/// Prefix of every account-frame body digest.
pub const DOMAIN_FRAME: &[u8] = b"xln.frame/v1";

/// Prefix of the bilateral account signature digest.
pub const DOMAIN_ACCOUNT: &[u8] = b"xln.account/v1";

/// Prefix of the entity commit signature digest.
pub const DOMAIN_ENTITY: &[u8] = b"xln.entity/v1";

// ── Runtime ──────────────────────────────────────────────────────────────────

/// Maximum fan-out iterations per tick before the tick aborts with
/// `IterationLimitExceeded`.
pub const DEFAULT_ITERATION_BUDGET: u32 = 64;

// ── Account machine ──────────────────────────────────────────────────────────

/// Maximum transactions bundled into one account frame.
pub const FRAME_TX_LIMIT: usize = 32;

/// Ticks a proposer waits for an Ack before cancelling its own pending frame.
pub const DEFAULT_ACK_TIMEOUT_TICKS: u64 = 8;

/// Ticks a proposer must stay quiet after a Cancel before re-proposing.
pub const REPROPOSE_COOLDOWN_TICKS: u64 = 1;

/// Default per-hop forwarding fee in basis points.
pub const DEFAULT_HOP_FEE_BPS: u32 = 10;

/// Basis-point denominator for fee arithmetic.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Hops a forwarded payment may still traverse (route tail length cap).
pub const MAX_ROUTE_HOPS: usize = 8;
