//! Hard caps. Anything beyond these is refused with `LimitExceeded` rather
//! than letting one tenant grow without bound.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_CLINICS_PER_TENANT: usize = 10_000;
pub const MAX_PROVIDERS_PER_TENANT: usize = 100_000;
pub const MAX_PATIENTS_PER_TENANT: usize = 1_000_000;
pub const MAX_SERVICES_PER_TENANT: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 512;
pub const MAX_NOTES_LEN: usize = 4096;

pub const MAX_WINDOWS_PER_PROVIDER: usize = 512;
pub const MAX_APPOINTMENTS_PER_PROVIDER: usize = 100_000;

/// One day.
pub const MAX_SERVICE_DURATION_MIN: i64 = 24 * 60;

/// Rows returned by a single appointment listing.
pub const MAX_LISTED_APPOINTMENTS: usize = 1000;

/// 2000-01-01T00:00:00Z .. 2100-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SQL_LEN: usize = 64 * 1024;
