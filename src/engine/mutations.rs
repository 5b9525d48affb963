use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::audit::{AuditAction, AuditRecord};
use crate::identity::Principal;
use crate::limits::MAX_RECORDS_PER_PARTITION;
use crate::model::*;

use super::conflict::{now_ms, plan_promotions, today, validate_slot};
use super::{Ledger, LedgerError, WalCommand};

impl Ledger {
    /// Confirm `slot` for `principal`, or queue the request if a confirmed
    /// booking overlaps it. `id` names whichever record is created.
    pub async fn request_booking(
        &self,
        principal: &Principal,
        id: Ulid,
        facility: FacilityId,
        slot: Slot,
    ) -> Result<RequestOutcome, LedgerError> {
        validate_slot(&slot, today())?;
        if !self.catalog.exists(&facility) {
            return Err(LedgerError::FacilityUnknown(facility));
        }
        if !self.catalog.is_active(&facility) {
            return Err(LedgerError::FacilityInactive(facility));
        }

        let mut guard = self.partition_write(PartitionKey::of(facility, &slot)).await;
        if guard.live_record_count() >= MAX_RECORDS_PER_PARTITION {
            return Err(LedgerError::LimitExceeded("too many bookings for facility on this date"));
        }
        // Ids are campus-wide, but the partition lock only covers one day.
        match self.entity_to_partition.entry(id) {
            Entry::Occupied(_) => return Err(LedgerError::AlreadyExists(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(guard.key);
            }
        }

        let at = now_ms();
        let owner = principal.login.clone();
        let outcome = match guard.first_conflict(&slot) {
            Some(blocking) => {
                debug!("request {id} for {slot} blocked by booking {}", blocking.id);
                RequestOutcome::Waitlisted(WaitlistEntry {
                    id,
                    owner: owner.clone(),
                    facility,
                    slot,
                    created_at: at,
                })
            }
            None => RequestOutcome::Confirmed(Booking::confirmed(id, owner.clone(), facility, slot, at)),
        };
        let event = match &outcome {
            RequestOutcome::Confirmed(_) => Event::BookingConfirmed { id, owner, facility, slot, at },
            RequestOutcome::Waitlisted(_) => Event::BookingWaitlisted { id, owner, facility, slot, at },
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.entity_to_partition.remove(&id);
            return Err(e);
        }
        drop(guard);

        let action = if outcome.is_confirmed() {
            AuditAction::BookingCreated
        } else {
            AuditAction::BookingWaitlisted
        };
        self.audit.record(AuditRecord {
            principal: Some(principal.login.clone()),
            action,
            details: format!("{id} facility {facility} {slot}"),
            at,
        });
        Ok(outcome)
    }

    /// Cancel a confirmed booking and promote every queued request that fits
    /// into the freed slot, oldest first. One WAL record covers both.
    pub async fn cancel_booking(
        &self,
        principal: &Principal,
        id: Ulid,
    ) -> Result<CancelOutcome, LedgerError> {
        let mut guard = self.resolve_entity_write(&id).await?;

        let (owner, freed, confirmed) = match guard.booking(id) {
            Some(b) => (b.owner.clone(), b.slot, b.is_confirmed()),
            None => {
                let entry = guard.waitlist_entry(id).ok_or(LedgerError::NotFound(id))?;
                if !principal.may_manage(&entry.owner) {
                    return Err(LedgerError::Forbidden(id));
                }
                return Err(LedgerError::InvalidState {
                    id,
                    reason: "request is waitlisted, not confirmed".into(),
                });
            }
        };
        if !principal.may_manage(&owner) {
            return Err(LedgerError::Forbidden(id));
        }
        if !confirmed {
            return Err(LedgerError::InvalidState {
                id,
                reason: "booking is already cancelled".into(),
            });
        }

        let at = now_ms();
        let promotions: Vec<Promotion> = plan_promotions(&guard, id, &freed)
            .into_iter()
            .map(|entry_id| Promotion {
                entry_id,
                booking_id: Ulid::new(),
            })
            .collect();
        let event = Event::BookingCancelled {
            id,
            facility: guard.key.facility,
            date: guard.key.date,
            at,
            promotions: promotions.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let cancelled = guard.booking(id).cloned().ok_or(LedgerError::NotFound(id))?;
        let promoted: Vec<Promoted> = promotions
            .iter()
            .filter_map(|p| {
                guard.booking(p.booking_id).cloned().map(|booking| Promoted {
                    entry_id: p.entry_id,
                    booking,
                })
            })
            .collect();
        drop(guard);

        self.audit.record(AuditRecord {
            principal: Some(principal.login.clone()),
            action: AuditAction::BookingCancelled,
            details: format!("{id} owner {owner} {freed}"),
            at,
        });
        for p in &promoted {
            info!("promoted waitlist entry {} to booking {}", p.entry_id, p.booking.id);
            self.audit.record(AuditRecord {
                principal: Some(p.booking.owner.clone()),
                action: AuditAction::BookingPromoted,
                details: format!("{} from waitlist {} {}", p.booking.id, p.entry_id, p.booking.slot),
                at,
            });
        }
        metrics::counter!(crate::observability::PROMOTIONS_TOTAL).increment(promoted.len() as u64);

        Ok(CancelOutcome { cancelled, promoted })
    }

    /// Admin override: confirm a waitlisted request. The conflict check runs
    /// again first, so approval can never double-book a slot.
    pub async fn approve_waitlisted(
        &self,
        principal: &Principal,
        entry_id: Ulid,
    ) -> Result<Booking, LedgerError> {
        if !principal.is_admin() {
            return Err(LedgerError::Forbidden(entry_id));
        }
        let mut guard = self.resolve_entity_write(&entry_id).await?;
        let entry = match guard.waitlist_entry(entry_id) {
            Some(entry) => entry.clone(),
            None if guard.booking(entry_id).is_some() => {
                return Err(LedgerError::InvalidState {
                    id: entry_id,
                    reason: "not a waitlisted request".into(),
                });
            }
            None => return Err(LedgerError::NotFound(entry_id)),
        };
        if entry.slot.date < today() {
            return Err(LedgerError::PastDate(entry.slot.date));
        }
        if let Some(blocking) = guard.first_conflict(&entry.slot) {
            return Err(LedgerError::InvalidState {
                id: entry_id,
                reason: format!("slot still held by booking {}", blocking.id),
            });
        }

        let at = now_ms();
        let booking_id = Ulid::new();
        let event = Event::WaitlistApproved {
            entry_id,
            booking_id,
            facility: guard.key.facility,
            date: guard.key.date,
            at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(LedgerError::NotFound(booking_id))?;
        drop(guard);

        self.audit.record(AuditRecord {
            principal: Some(principal.login.clone()),
            action: AuditAction::BookingApproved,
            details: format!("{booking_id} from waitlist {entry_id} for {} {}", entry.owner, entry.slot),
            at,
        });
        Ok(booking)
    }

    /// Owner (or admin) drops a queued request.
    pub async fn withdraw_waitlisted(
        &self,
        principal: &Principal,
        entry_id: Ulid,
    ) -> Result<WaitlistEntry, LedgerError> {
        let mut guard = self.resolve_entity_write(&entry_id).await?;
        let entry = match guard.waitlist_entry(entry_id) {
            Some(entry) => entry.clone(),
            None if guard.booking(entry_id).is_some() => {
                return Err(LedgerError::InvalidState {
                    id: entry_id,
                    reason: "not a waitlisted request".into(),
                });
            }
            None => return Err(LedgerError::NotFound(entry_id)),
        };
        if !principal.may_manage(&entry.owner) {
            return Err(LedgerError::Forbidden(entry_id));
        }

        let event = Event::WaitlistWithdrawn {
            id: entry_id,
            facility: guard.key.facility,
            date: guard.key.date,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        self.audit.record(AuditRecord {
            principal: Some(principal.login.clone()),
            action: AuditAction::WaitlistWithdrawn,
            details: format!("{entry_id} owner {} {}", entry.owner, entry.slot),
            at: now_ms(),
        });
        Ok(entry)
    }

    /// Drop queued requests for days before `today`; they can never be served.
    pub async fn expire_waitlist(&self, today: NaiveDate) -> Result<Vec<Ulid>, LedgerError> {
        let mut expired = Vec::new();
        for (key, _) in self.partition_handles() {
            if key.date >= today {
                continue;
            }
            let mut guard = self.partition_write(key).await;
            let stale: Vec<Ulid> = guard.waitlist.iter().map(|e| e.id).collect();
            for id in stale {
                let event = Event::WaitlistExpired {
                    id,
                    facility: key.facility,
                    date: key.date,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                expired.push(id);
            }
        }
        Ok(expired)
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Cancelled bookings are kept as history.
    pub async fn compact_wal(&self) -> Result<(), LedgerError> {
        // Held until the new log is in place; a commit landing between the
        // snapshot and the swap would be dropped with the old file.
        let _commits = self.commit_gate.write().await;
        let mut handles = self.partition_handles();
        handles.sort_by_key(|(key, _)| *key);

        let mut events = Vec::new();
        for (key, shared) in handles {
            let guard = shared.read().await;
            for b in &guard.bookings {
                events.push(Event::BookingConfirmed {
                    id: b.id,
                    owner: b.owner.clone(),
                    facility: b.facility,
                    slot: b.slot,
                    at: b.created_at,
                });
                if !b.is_confirmed() {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        facility: key.facility,
                        date: key.date,
                        at: b.modified_at,
                        promotions: Vec::new(),
                    });
                }
            }
            for e in &guard.waitlist {
                events.push(Event::BookingWaitlisted {
                    id: e.id,
                    owner: e.owner.clone(),
                    facility: e.facility,
                    slot: e.slot,
                    at: e.created_at,
                });
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| LedgerError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
