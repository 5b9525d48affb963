use crate::model::*;

// ── Free-window algorithm ────────────────────────────────────────

/// Free windows of a partition inside `window`: the window minus every
/// confirmed booking, clamped and merged. Cancelled bookings and queued
/// requests never hold time.
pub fn free_windows(partition: &Partition, window: &Slot) -> Vec<Slot> {
    if !window.is_well_formed() || partition.key.date != window.date {
        return Vec::new();
    }
    let held: Vec<Slot> = partition
        .overlapping_confirmed(window)
        .map(|b| b.slot)
        .collect();
    // Bookings come out sorted by start already.
    subtract_slots(&[*window], &merge_overlapping(&held))
}

/// Merge sorted overlapping/adjacent slots of one day into disjoint slots.
pub fn merge_overlapping(sorted: &[Slot]) -> Vec<Slot> {
    let mut merged: Vec<Slot> = Vec::new();
    for &slot in sorted {
        if let Some(last) = merged.last_mut()
            && slot.start <= last.end
        {
            last.end = last.end.max(slot.end);
            continue;
        }
        merged.push(slot);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start, disjoint, same day.
pub fn subtract_slots(base: &[Slot], to_remove: &[Slot]) -> Vec<Slot> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Slot::new(b.date, current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Slot::new(b.date, current_start, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 9, 2).unwrap()
    }

    fn s(sh: u32, sm: u32, eh: u32, em: u32) -> Slot {
        Slot::new(
            day(),
            NaiveTime::from_hms_opt(sh, sm, 0).unwrap(),
            NaiveTime::from_hms_opt(eh, em, 0).unwrap(),
        )
    }

    fn partition_with(slots: &[Slot]) -> Partition {
        let mut p = Partition::new(PartitionKey { facility: Ulid::nil(), date: day() });
        for slot in slots {
            p.insert_booking(Booking::confirmed(Ulid::new(), "ana".into(), Ulid::nil(), *slot, 0));
        }
        p
    }

    #[test]
    fn subtract_no_overlap() {
        assert_eq!(subtract_slots(&[s(9, 0, 10, 0)], &[s(11, 0, 12, 0)]), vec![s(9, 0, 10, 0)]);
    }

    #[test]
    fn subtract_full_overlap() {
        assert!(subtract_slots(&[s(9, 0, 10, 0)], &[s(8, 0, 11, 0)]).is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        assert_eq!(subtract_slots(&[s(9, 0, 12, 0)], &[s(8, 0, 10, 0)]), vec![s(10, 0, 12, 0)]);
        assert_eq!(subtract_slots(&[s(9, 0, 12, 0)], &[s(11, 0, 13, 0)]), vec![s(9, 0, 11, 0)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let free = subtract_slots(
            &[s(8, 0, 18, 0)],
            &[s(9, 0, 10, 0), s(12, 0, 13, 30), s(17, 0, 18, 0)],
        );
        assert_eq!(free, vec![s(8, 0, 9, 0), s(10, 0, 12, 0), s(13, 30, 17, 0)]);
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let merged = merge_overlapping(&[s(9, 0, 10, 0), s(9, 30, 11, 0), s(11, 0, 12, 0), s(14, 0, 15, 0)]);
        assert_eq!(merged, vec![s(9, 0, 12, 0), s(14, 0, 15, 0)]);
    }

    #[test]
    fn free_windows_ignore_cancelled() {
        let mut p = partition_with(&[s(9, 0, 10, 0), s(13, 0, 14, 0)]);
        p.bookings[1].status = BookingStatus::Cancelled;
        assert_eq!(
            free_windows(&p, &s(8, 0, 18, 0)),
            vec![s(8, 0, 9, 0), s(10, 0, 18, 0)]
        );
    }

    #[test]
    fn free_windows_clamped_to_window() {
        let p = partition_with(&[s(7, 0, 9, 30), s(17, 0, 20, 0)]);
        assert_eq!(free_windows(&p, &s(8, 0, 18, 0)), vec![s(9, 30, 17, 0)]);
    }

    #[test]
    fn free_windows_other_day_or_bad_window() {
        let p = partition_with(&[]);
        let mut other = s(8, 0, 9, 0);
        other.date = day().succ_opt().unwrap();
        assert!(free_windows(&p, &other).is_empty());
        assert!(free_windows(&p, &s(10, 0, 9, 0)).is_empty());
    }
}
