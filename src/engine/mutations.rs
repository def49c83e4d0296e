use chrono::{DateTime, Datelike, Utc};

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{override_note, validate_new_booking, validate_text};
use super::{Engine, EngineError, SharedSchedule, WalCommand};

/// Bookings removed by one retention purge, by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub approved: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

impl PurgeCounts {
    fn record(&mut self, status: BookingStatus) {
        match status {
            BookingStatus::Approved => self.approved += 1,
            BookingStatus::Rejected => self.rejected += 1,
            BookingStatus::Cancelled => self.cancelled += 1,
            BookingStatus::Pending => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.approved + self.rejected + self.cancelled
    }
}

fn purge_eligible(booking: &Booking, cutoff: DateTime<Utc>) -> bool {
    BookingStatus::PROCESSED.contains(&booking.status) && booking.created_at < cutoff
}

fn invalid(id: &BookingId, from: BookingStatus, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        id: id.clone(),
        from,
        action,
    }
}

impl Engine {
    /// Store a new `Pending` booking. Fails with `Conflict` if the slot
    /// overlaps an approved booking of the same room and day.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let slot = validate_new_booking(&req)?;
        let _gate = self.commit_gate.read().await;

        let key = SlotKey::new(req.room_id.clone(), req.date);
        let ds = self.schedule_or_create(&key);
        let mut guard = ds.write().await;

        let clashes: Vec<Booking> = guard.approved_conflicts(&slot, None).cloned().collect();
        if !clashes.is_empty() {
            drop(guard);
            metrics::counter!(observability::CONFLICTS_DETECTED_TOTAL, "operation" => "create")
                .increment(1);
            return Err(EngineError::Conflict(self.conflict_infos(clashes).await));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SCHEDULE {
            return Err(EngineError::BadRequest(format!(
                "{key} already holds {MAX_BOOKINGS_PER_SCHEDULE} bookings"
            )));
        }

        let now = Utc::now();
        let booking = Booking {
            id: self.allocate_id(now.year()),
            room_id: req.room_id,
            user_id: req.user_id,
            date: req.date,
            start_time: slot.start,
            end_time: slot.end,
            title: req.title,
            attendees: req.attendees,
            description: req.description,
            priority: req.priority,
            equipment: req.equipment,
            status: BookingStatus::Pending,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        let result = self.commit(&mut *guard, &event).await;
        drop(guard);
        drop(ds);
        if let Err(e) = result {
            // The schedule may have been created for this request alone.
            self.prune_empty_schedules([&key]);
            return Err(e);
        }

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::debug!("created {} for {key} {slot}", booking.id);
        Ok(booking)
    }

    /// Approve a pending booking. With `cancel_conflicts`, every approved
    /// booking it clashes with is cancelled in the same WAL record.
    pub async fn approve_booking(
        &self,
        id: &BookingId,
        cancel_conflicts: bool,
    ) -> Result<Approval, EngineError> {
        // The owner never changes, so the name can be looked up unlocked.
        let owner = if cancel_conflicts {
            let target = self.get_booking(id).await?;
            Some(self.owner_name(&target.user_id).await)
        } else {
            None
        };

        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_booking_write(id).await?;
        let target = guard
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let approved_status = target
            .status
            .apply(Transition::Approve)
            .ok_or_else(|| invalid(id, target.status, Transition::Approve.as_str()))?;

        let clashes: Vec<Booking> = guard
            .approved_conflicts(&target.slot(), Some(id))
            .cloned()
            .collect();

        let owner = match owner {
            Some(owner) => owner,
            None if clashes.is_empty() => String::new(),
            None => {
                drop(guard);
                metrics::counter!(observability::CONFLICTS_DETECTED_TOTAL, "operation" => "approve")
                    .increment(1);
                return Err(EngineError::Conflict(self.conflict_infos(clashes).await));
            }
        };

        let note = override_note(&owner, id);
        let mut changes = Vec::with_capacity(clashes.len() + 1);
        for clash in &clashes {
            if let Some(status) = clash.status.apply(Transition::Override) {
                changes.push(StatusChange {
                    id: clash.id.clone(),
                    status,
                    notes: Some(note.clone()),
                });
            }
        }
        changes.push(StatusChange {
            id: id.clone(),
            status: approved_status,
            notes: None,
        });
        let event = Event::StatusChanged {
            changes,
            at: Utc::now(),
        };
        self.commit(&mut *guard, &event).await?;

        let approved = guard
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let cancelled: Vec<Booking> = clashes
            .iter()
            .filter_map(|c| guard.get(&c.id).cloned())
            .collect();

        metrics::counter!(observability::APPROVALS_TOTAL).increment(1);
        if !cancelled.is_empty() {
            metrics::counter!(observability::OVERRIDES_TOTAL).increment(cancelled.len() as u64);
            tracing::info!(
                "approved {id} over {} conflicting booking(s)",
                cancelled.len()
            );
        } else {
            tracing::debug!("approved {id}");
        }
        Ok(Approval {
            approved,
            cancelled,
        })
    }

    pub async fn reject_booking(
        &self,
        id: &BookingId,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.transition_one(id, Transition::Reject, reason).await
    }

    pub async fn cancel_booking(
        &self,
        id: &BookingId,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.transition_one(id, Transition::Cancel, reason).await
    }

    /// Single-booking status change; `reason` replaces the notes when given.
    async fn transition_one(
        &self,
        id: &BookingId,
        transition: Transition,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        if let Some(reason) = &reason {
            validate_text("reason", reason)?;
        }
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_booking_write(id).await?;
        let from = guard
            .get(id)
            .map(|b| b.status)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let status = from
            .apply(transition)
            .ok_or_else(|| invalid(id, from, transition.as_str()))?;

        let event = Event::StatusChanged {
            changes: vec![StatusChange {
                id: id.clone(),
                status,
                notes: reason,
            }],
            at: Utc::now(),
        };
        self.commit(&mut *guard, &event).await?;
        tracing::debug!("{id}: {from} -> {status}");
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))
    }

    /// Administrative delete. Only rejected or cancelled bookings may go.
    pub async fn delete_booking(&self, id: &BookingId) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_booking_write(id).await?;
        let booking = guard
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        if !booking.status.is_terminal() {
            return Err(invalid(id, booking.status, "delete"));
        }

        let key = guard.key.clone();
        let event = Event::BookingsDeleted {
            ids: vec![id.clone()],
        };
        self.commit(&mut *guard, &event).await?;
        drop(guard);
        self.prune_empty_schedules([&key]);
        tracing::info!("deleted {id}");
        Ok(booking)
    }

    /// Remove every processed booking created before `cutoff`.
    ///
    /// Affected schedules are write-locked in key order and stay locked until
    /// the single `BookingsDeleted` record is committed, so either every
    /// counted booking is gone or none is.
    pub async fn purge_processed(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts, EngineError> {
        let _gate = self.commit_gate.read().await;

        let mut keys: Vec<SlotKey> = self.schedules.iter().map(|e| e.key().clone()).collect();
        keys.sort();

        let mut guards = Vec::new();
        let mut ids = Vec::new();
        let mut counts = PurgeCounts::default();
        for key in &keys {
            let Some(ds) = self.get_schedule(key) else {
                continue;
            };
            let guard = ds.write_owned().await;
            let before = ids.len();
            for booking in guard.bookings.iter().filter(|b| purge_eligible(b, cutoff)) {
                counts.record(booking.status);
                ids.push(booking.id.clone());
            }
            if ids.len() > before {
                guards.push(guard);
            }
        }

        if ids.is_empty() {
            return Ok(counts);
        }

        let event = Event::BookingsDeleted { ids };
        self.commit(&mut guards, &event).await?;
        let touched: Vec<SlotKey> = guards.iter().map(|g| g.key.clone()).collect();
        drop(guards);
        self.prune_empty_schedules(&touched);
        Ok(counts)
    }

    /// Rewrite the WAL with only what is needed to rebuild the current state:
    /// the per-year sequence floors, then one `BookingCreated` per booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut floors: Vec<(i32, u32)> =
            self.sequences.iter().map(|e| (*e.key(), *e.value())).collect();
        floors.sort_unstable();
        let mut events: Vec<Event> = floors
            .into_iter()
            .map(|(year, last)| Event::SequenceAdvanced { year, last })
            .collect();

        let schedules: Vec<SharedSchedule> =
            self.schedules.iter().map(|e| e.value().clone()).collect();
        for ds in schedules {
            let guard = ds.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let count = events.len();
        self.store_call(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("compacted WAL to {count} record(s)");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store_call(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}
