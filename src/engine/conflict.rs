use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn bad(msg: impl Into<String>) -> EngineError {
    EngineError::BadRequest(msg.into())
}

/// Structural checks on a new booking. Room existence and capacity are the
/// directory's business and are checked before the engine sees the request.
pub(crate) fn validate_new_booking(req: &NewBooking) -> Result<TimeSlot, EngineError> {
    let slot = TimeSlot::try_new(req.start_time, req.end_time)
        .ok_or_else(|| bad("end time must be after start time"))?;
    validate_key("room_id", &req.room_id)?;
    validate_key("user_id", &req.user_id)?;
    if req.title.trim().is_empty() {
        return Err(bad("title is required"));
    }
    if req.title.chars().count() > MAX_TITLE_LEN {
        return Err(bad(format!("title exceeds {MAX_TITLE_LEN} characters")));
    }
    if req.attendees == 0 {
        return Err(bad("attendees must be at least 1"));
    }
    if req.attendees > MAX_ATTENDEES {
        return Err(bad(format!("attendees exceed {MAX_ATTENDEES}")));
    }
    if let Some(desc) = &req.description {
        validate_text("description", desc)?;
    }
    if req.equipment.len() > MAX_EQUIPMENT_ITEMS {
        return Err(bad(format!("more than {MAX_EQUIPMENT_ITEMS} equipment items")));
    }
    if req.equipment.iter().any(|e| e.is_empty() || e.chars().count() > MAX_EQUIPMENT_ITEM_LEN) {
        return Err(bad(format!(
            "equipment items must be 1..={MAX_EQUIPMENT_ITEM_LEN} characters"
        )));
    }
    Ok(slot)
}

fn validate_key(field: &str, value: &str) -> Result<(), EngineError> {
    if value.is_empty() || value.len() > MAX_KEY_LEN {
        return Err(bad(format!("{field} must be 1..={MAX_KEY_LEN} bytes")));
    }
    Ok(())
}

/// Free text stored on a booking: description, rejection or cancellation reason.
pub(crate) fn validate_text(field: &str, value: &str) -> Result<(), EngineError> {
    if value.chars().count() > MAX_TEXT_LEN {
        return Err(bad(format!("{field} exceeds {MAX_TEXT_LEN} characters")));
    }
    Ok(())
}

impl Engine {
    /// Attach owner display names to clashing bookings.
    pub(super) async fn conflict_infos(&self, bookings: Vec<Booking>) -> Vec<ConflictInfo> {
        let mut infos = Vec::with_capacity(bookings.len());
        for b in bookings {
            let user_name = self.directory.user_name(&b.user_id).await;
            infos.push(ConflictInfo {
                slot: b.slot(),
                id: b.id,
                user_id: b.user_id,
                user_name,
            });
        }
        infos
    }

    /// Display name used in override notes; falls back to the user id.
    pub(super) async fn owner_name(&self, user_id: &str) -> String {
        self.directory
            .user_name(user_id)
            .await
            .unwrap_or_else(|| user_id.to_string())
    }
}

pub(crate) fn override_note(owner: &str, winner: &BookingId) -> String {
    format!("Revoked by Admin for Priority Override by {owner} (booking {winner})")
}
