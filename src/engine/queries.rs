use chrono::NaiveDate;

use crate::limits::MAX_LIST_ROWS;
use crate::model::*;

use super::{Engine, EngineError, SharedSchedule};

impl Engine {
    pub async fn get_booking(&self, id: &BookingId) -> Result<Booking, EngineError> {
        let key = self
            .get_key_for_booking(id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let ds = self
            .get_schedule(&key)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let guard = ds.read().await;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))
    }

    /// Matching bookings, newest date first and latest start first within a
    /// day, capped at `MAX_LIST_ROWS`.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let schedules: Vec<SharedSchedule> = self
            .schedules
            .iter()
            .filter(|e| filter.matches_key(e.key()))
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::new();
        for ds in schedules {
            let guard = ds.read().await;
            out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then(b.start_time.cmp(&a.start_time))
                .then(b.id.cmp(&a.id))
        });
        out.truncate(MAX_LIST_ROWS);
        out
    }

    /// Approved bookings in `room_id` on `date` overlapping `slot`.
    /// An unknown room or day simply has none.
    pub async fn find_conflicts(
        &self,
        room_id: &str,
        date: NaiveDate,
        slot: &TimeSlot,
        exclude: Option<&BookingId>,
    ) -> Vec<Booking> {
        let key = SlotKey::new(room_id.to_string(), date);
        let Some(ds) = self.get_schedule(&key) else {
            return Vec::new();
        };
        let guard = ds.read().await;
        guard.approved_conflicts(slot, exclude).cloned().collect()
    }

    /// Approved bookings that would block approving `id`.
    pub async fn list_conflicts(&self, id: &BookingId) -> Result<Vec<ConflictInfo>, EngineError> {
        let booking = self.get_booking(id).await?;
        let clashes = self
            .find_conflicts(&booking.room_id, booking.date, &booking.slot(), Some(id))
            .await;
        Ok(self.conflict_infos(clashes).await)
    }

    #[cfg(test)]
    pub(crate) fn booking_count(&self) -> usize {
        self.booking_index.len()
    }

    #[cfg(test)]
    pub(crate) fn schedule_count(&self) -> usize {
        self.schedules.len()
    }
}
