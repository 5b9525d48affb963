use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_BOOKING_HORIZON_DAYS;
use crate::model::*;

use super::LedgerError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Campus-local calendar date.
pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Entry checks for a requested slot. Same-day requests are allowed.
pub(crate) fn validate_slot(slot: &Slot, today: NaiveDate) -> Result<(), LedgerError> {
    if !slot.is_well_formed() {
        return Err(LedgerError::InvalidInterval {
            start: slot.start,
            end: slot.end,
        });
    }
    if slot.date < today {
        return Err(LedgerError::PastDate(slot.date));
    }
    if (slot.date - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
        return Err(LedgerError::LimitExceeded("date beyond booking horizon"));
    }
    Ok(())
}

/// Waitlist entries that become confirmable once booking `cancelled` is gone.
///
/// Walks the queue oldest first. An entry is promoted when its slot overlaps
/// the freed slot and it conflicts with no remaining confirmed booking,
/// counting entries promoted earlier in the same walk. Blocked entries keep
/// their place and do not hold back later ones.
pub(crate) fn plan_promotions(p: &Partition, cancelled: Ulid, freed: &Slot) -> Vec<Ulid> {
    let mut taken: Vec<Slot> = Vec::new();
    let mut chosen = Vec::new();
    for entry in &p.waitlist {
        if !entry.slot.overlaps(freed) {
            continue;
        }
        let blocked = p
            .overlapping_confirmed(&entry.slot)
            .any(|b| b.id != cancelled)
            || taken.iter().any(|s| s.overlaps(&entry.slot));
        if !blocked {
            taken.push(entry.slot);
            chosen.push(entry.id);
        }
    }
    chosen
}
