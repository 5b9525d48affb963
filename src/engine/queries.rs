use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::{Ledger, LedgerError};

/// Last representable instant of a day; `[00:00, end_of_day)` is the whole day
/// for availability purposes.
pub fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

fn sort_holdings(h: &mut Holdings) {
    h.bookings.sort_by(|a, b| {
        (b.slot.date, b.slot.start, b.id).cmp(&(a.slot.date, a.slot.start, a.id))
    });
    // Stable: ties keep their queue order.
    h.waitlist.sort_by_key(|e| e.created_at);
}

impl Ledger {
    /// Everything `login` holds: bookings newest first (date desc, start
    /// desc), queued requests oldest first.
    pub async fn list_bookings_for(&self, login: &str) -> Holdings {
        let mut holdings = Holdings::default();
        for (_, shared) in self.partition_handles() {
            let guard = shared.read().await;
            holdings
                .bookings
                .extend(guard.bookings.iter().filter(|b| b.owner == login).cloned());
            holdings
                .waitlist
                .extend(guard.waitlist.iter().filter(|e| e.owner == login).cloned());
        }
        sort_holdings(&mut holdings);
        holdings
    }

    /// Every booking and queued request across the campus, for admins.
    pub async fn list_all(&self) -> Holdings {
        let mut holdings = Holdings::default();
        for (_, shared) in self.partition_handles() {
            let guard = shared.read().await;
            holdings.bookings.extend(guard.bookings.iter().cloned());
            holdings.waitlist.extend(guard.waitlist.iter().cloned());
        }
        sort_holdings(&mut holdings);
        holdings
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let key = self.partition_for_entity(&id)?;
        let shared = self.get_partition(&key)?;
        let guard = shared.read().await;
        guard.booking(id).cloned()
    }

    pub async fn get_waitlist_entry(&self, id: Ulid) -> Option<WaitlistEntry> {
        let key = self.partition_for_entity(&id)?;
        let shared = self.get_partition(&key)?;
        let guard = shared.read().await;
        guard.waitlist_entry(id).cloned()
    }

    /// Confirmed bookings of one facility on one day, plus its queue.
    pub async fn facility_schedule(&self, facility: FacilityId, date: NaiveDate) -> DaySchedule {
        let Some(shared) = self.get_partition(&PartitionKey { facility, date }) else {
            return DaySchedule::default();
        };
        let guard = shared.read().await;
        DaySchedule {
            bookings: guard.bookings.iter().filter(|b| b.is_confirmed()).cloned().collect(),
            waitlist: guard.waitlist.clone(),
        }
    }

    /// Free windows of `facility` on `date`, inside `window` if given,
    /// otherwise across the whole day.
    pub async fn availability(
        &self,
        facility: FacilityId,
        date: NaiveDate,
        window: Option<(NaiveTime, NaiveTime)>,
    ) -> Result<Vec<Slot>, LedgerError> {
        if !self.catalog.exists(&facility) {
            return Err(LedgerError::FacilityUnknown(facility));
        }
        let (start, end) = window.unwrap_or((NaiveTime::MIN, end_of_day()));
        let window = Slot::new(date, start, end);
        if !window.is_well_formed() {
            return Err(LedgerError::InvalidInterval { start, end });
        }
        let Some(shared) = self.get_partition(&PartitionKey { facility, date }) else {
            return Ok(vec![window]);
        };
        let guard = shared.read().await;
        Ok(free_windows(&guard, &window))
    }
}
