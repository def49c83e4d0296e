use crate::model::{BookingId, BookingStatus, ConflictInfo};

#[derive(Debug)]
pub enum EngineError {
    /// Booking or room absent.
    NotFound(String),
    BadRequest(String),
    InvalidTransition {
        id: BookingId,
        from: BookingStatus,
        action: &'static str,
    },
    /// Every approved booking the request clashes with.
    Conflict(Vec<ConflictInfo>),
    StoreUnavailable(String),
}

impl EngineError {
    pub(crate) fn booking_not_found(id: &BookingId) -> Self {
        EngineError::NotFound(format!("booking {id}"))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "cannot {action} booking {id}: status is {from}")
            }
            EngineError::Conflict(conflicts) => {
                write!(
                    f,
                    "conflicts with {} approved booking(s): ",
                    conflicts.len()
                )?;
                for (i, c) in conflicts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{c}")?;
                }
                Ok(())
            }
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
