// Hard limits. Anything a client can grow without bound gets a ceiling here.

/// Max concurrent client connections (default for `CAMPUSD_MAX_CONNECTIONS`).
pub const MAX_CONNECTIONS: usize = 256;

/// Campuses (databases) served by one process.
pub const MAX_CAMPUSES: usize = 64;
pub const MAX_CAMPUS_NAME_LEN: usize = 128;

pub const MAX_FACILITIES_PER_CAMPUS: usize = 10_000;
pub const MAX_FACILITY_NAME_LEN: usize = 256;

pub const MAX_LOGIN_LEN: usize = 128;

/// Confirmed bookings plus waitlist entries held for one facility on one day.
pub const MAX_RECORDS_PER_PARTITION: usize = 4_096;

/// How far ahead a slot may be requested.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 366;
