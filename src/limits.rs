//! Hard limits enforced per tenant and per request.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_RESOURCE_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PRICE_RANGES_PER_DAY: usize = 48;

/// Slot length used when a resource is registered without one.
pub const DEFAULT_SLOT_MINUTES: u32 = 60;

pub const MAX_PAYMENT_REF_LEN: usize = 128;
pub const MAX_ACTOR_ID_LEN: usize = 128;
pub const MAX_SEARCH_LEN: usize = 128;

pub const MIN_PHONE_DIGITS: usize = 6;
pub const MAX_PHONE_DIGITS: usize = 15;

/// Booking code issuance gives up after this many collisions in a row.
pub const MAX_CODE_ATTEMPTS: u32 = 16;

/// Attempts (including the first) for idempotent store reads.
pub const STORE_READ_ATTEMPTS: u32 = 3;
pub const STORE_READ_BACKOFF_MS: u64 = 20;

/// Compare-and-swap rounds before a contended status change gives up.
pub const MAX_TRANSITION_ATTEMPTS: u32 = 3;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;
