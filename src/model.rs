use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for record timestamps, never for slots.
pub type Ms = i64;

pub type FacilityId = Ulid;

/// Half-open time interval `[start, end)` on a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Slot {
    /// Unchecked: `start < end` is enforced by the ledger on entry, not here.
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self { date, start, end }
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }

    /// Covers partial-left, partial-right and containment in either direction.
    /// Adjacent slots (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.date == other.date && self.start < other.end && other.start < self.end
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}-{}",
            self.date,
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Lock and storage unit of the ledger: one facility on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub facility: FacilityId,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn of(facility: FacilityId, slot: &Slot) -> Self {
        Self { facility, date: slot.date }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub owner: String,
    pub facility: FacilityId,
    pub slot: Slot,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub modified_at: Ms,
}

impl Booking {
    pub fn confirmed(id: Ulid, owner: String, facility: FacilityId, slot: Slot, at: Ms) -> Self {
        Self {
            id,
            owner,
            facility,
            slot,
            status: BookingStatus::Confirmed,
            created_at: at,
            modified_at: at,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// A request that could not be confirmed. Queue position is implied by
/// `created_at`, ties by insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub owner: String,
    pub facility: FacilityId,
    pub slot: Slot,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub key: PartitionKey,
    /// All bookings of the day, any status, sorted by `slot.start`.
    pub bookings: Vec<Booking>,
    /// FIFO queue, oldest first.
    pub waitlist: Vec<WaitlistEntry>,
}

impl Partition {
    pub fn new(key: PartitionKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    /// Confirmed bookings plus queued requests. Cancelled history is not
    /// counted, so cancelling always frees capacity.
    pub fn live_record_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.is_confirmed()).count() + self.waitlist.len()
    }

    /// Insert booking maintaining sort order by slot start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.slot.start <= booking.slot.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Append to the back of the queue. Keeps `created_at` order even if a
    /// clock step produced an older timestamp than the current tail.
    pub fn enqueue(&mut self, entry: WaitlistEntry) {
        let pos = self
            .waitlist
            .partition_point(|e| e.created_at <= entry.created_at);
        self.waitlist.insert(pos, entry);
    }

    pub fn waitlist_entry(&self, id: Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.id == id)
    }

    pub fn dequeue(&mut self, id: Ulid) -> Option<WaitlistEntry> {
        let pos = self.waitlist.iter().position(|e| e.id == id)?;
        Some(self.waitlist.remove(pos))
    }

    /// Confirmed bookings overlapping `slot`.
    /// Binary search skips bookings starting at or after `slot.end`.
    pub fn overlapping_confirmed(&self, slot: &Slot) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.slot.start < slot.end);
        let slot = *slot;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_confirmed() && b.slot.overlaps(&slot))
    }

    pub fn first_conflict(&self, slot: &Slot) -> Option<&Booking> {
        self.overlapping_confirmed(slot).next()
    }
}

/// One transaction of the ledger; also the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingConfirmed {
        id: Ulid,
        owner: String,
        facility: FacilityId,
        slot: Slot,
        at: Ms,
    },
    BookingWaitlisted {
        id: Ulid,
        owner: String,
        facility: FacilityId,
        slot: Slot,
        at: Ms,
    },
    /// Cancellation plus every promotion it triggered, committed together.
    BookingCancelled {
        id: Ulid,
        facility: FacilityId,
        date: NaiveDate,
        at: Ms,
        promotions: Vec<Promotion>,
    },
    WaitlistApproved {
        entry_id: Ulid,
        booking_id: Ulid,
        facility: FacilityId,
        date: NaiveDate,
        at: Ms,
    },
    WaitlistWithdrawn {
        id: Ulid,
        facility: FacilityId,
        date: NaiveDate,
    },
    WaitlistExpired {
        id: Ulid,
        facility: FacilityId,
        date: NaiveDate,
    },
}

impl Event {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::BookingConfirmed { .. } => "booking_confirmed",
            Event::BookingWaitlisted { .. } => "booking_waitlisted",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::WaitlistApproved { .. } => "waitlist_approved",
            Event::WaitlistWithdrawn { .. } => "waitlist_withdrawn",
            Event::WaitlistExpired { .. } => "waitlist_expired",
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        match self {
            Event::BookingConfirmed { facility, slot, .. }
            | Event::BookingWaitlisted { facility, slot, .. } => PartitionKey::of(*facility, slot),
            Event::BookingCancelled { facility, date, .. }
            | Event::WaitlistApproved { facility, date, .. }
            | Event::WaitlistWithdrawn { facility, date, .. }
            | Event::WaitlistExpired { facility, date, .. } => PartitionKey {
                facility: *facility,
                date: *date,
            },
        }
    }
}

/// Waitlist entry `entry_id` became booking `booking_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub entry_id: Ulid,
    pub booking_id: Ulid,
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Confirmed(Booking),
    Waitlisted(WaitlistEntry),
}

impl RequestOutcome {
    pub fn id(&self) -> Ulid {
        match self {
            RequestOutcome::Confirmed(b) => b.id,
            RequestOutcome::Waitlisted(e) => e.id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, RequestOutcome::Confirmed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promoted {
    pub entry_id: Ulid,
    pub booking: Booking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: Booking,
    pub promoted: Vec<Promoted>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Holdings {
    /// Newest first: date desc, start desc.
    pub bookings: Vec<Booking>,
    /// Oldest first.
    pub waitlist: Vec<WaitlistEntry>,
}

/// One facility's day: confirmed bookings by start, queue oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaySchedule {
    pub bookings: Vec<Booking>,
    pub waitlist: Vec<WaitlistEntry>,
}
