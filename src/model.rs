use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Booking identifier in the form `BK-<year>-<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookingId(String);

impl BookingId {
    /// Sequence numbers are zero-padded to four digits and widen past 9999.
    pub fn new(year: i32, sequence: u32) -> Self {
        Self(format!("BK-{year}-{sequence:04}"))
    }

    /// Parse and validate an id supplied by a caller.
    pub fn parse(s: &str) -> Option<Self> {
        split_id(s).map(|_| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(year, sequence)`, or `None` for ids that do not follow the format.
    pub fn parts(&self) -> Option<(i32, u32)> {
        split_id(&self.0)
    }
}

fn split_id(s: &str) -> Option<(i32, u32)> {
    let rest = s.strip_prefix("BK-")?;
    let (year, seq) = rest.split_once('-')?;
    if year.len() != 4 || seq.len() < 4 {
        return None;
    }
    if !year.bytes().all(|b| b.is_ascii_digit()) || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((year.parse().ok()?, seq.parse().ok()?))
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open wall-clock interval `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeSlot start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Touching slots (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

/// What is being asked of a booking's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Approve,
    Reject,
    Cancel,
    /// Forced cancellation of an approved booking while another one is
    /// approved over it. Only the engine issues this.
    Override,
}

impl BookingStatus {
    pub const PROCESSED: [BookingStatus; 3] = [
        BookingStatus::Approved,
        BookingStatus::Rejected,
        BookingStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Rejected | BookingStatus::Cancelled)
    }

    /// The status reached by applying `transition`, or `None` if the
    /// transition is illegal from this status.
    pub fn apply(self, transition: Transition) -> Option<BookingStatus> {
        use BookingStatus::*;
        use Transition::*;
        match (self, transition) {
            (Pending, Approve) => Some(Approved),
            (Pending, Reject) => Some(Rejected),
            (Pending, Cancel) | (Approved, Cancel) | (Approved, Override) => Some(Cancelled),
            (Pending, Override) | (Approved, Approve) | (Approved, Reject) => None,
            (Rejected, _) | (Cancelled, _) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Approved => "Approved",
            BookingStatus::Rejected => "Rejected",
            BookingStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "approved" => Ok(BookingStatus::Approved),
            "rejected" => Ok(BookingStatus::Rejected),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Approve => "approve",
            Transition::Reject => "reject",
            Transition::Cancel => "cancel",
            Transition::Override => "override",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub title: String,
    pub attendees: u32,
    pub description: Option<String>,
    pub priority: Priority,
    pub equipment: Vec<String>,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn slot(&self) -> TimeSlot {
        TimeSlot::new(self.start_time, self.end_time)
    }

    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.room_id.clone(), self.date)
    }
}

/// Input for a new booking, as received from the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub user_id: String,
    pub room_id: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub title: String,
    pub attendees: u32,
    pub description: Option<String>,
    pub priority: Priority,
    pub equipment: Vec<String>,
}

/// The unit of locking: one room on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub room_id: String,
    pub date: NaiveDate,
}

impl SlotKey {
    pub fn new(room_id: String, date: NaiveDate) -> Self {
        Self { room_id, date }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.room_id, self.date)
    }
}

/// All bookings of one room on one day, any status.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub key: SlotKey,
    /// Sorted by `start_time`.
    pub bookings: Vec<Booking>,
}

impl DaySchedule {
    pub fn new(key: SlotKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.start_time <= booking.start_time);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: &BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| &b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| &b.id == id)
    }

    pub fn get_mut(&mut self, id: &BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| &b.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// Bookings of any status whose slot overlaps `query`.
    /// Binary search cuts off everything starting at or after `query.end`;
    /// the earlier ones are still checked one by one against `query.start`.
    pub fn overlapping(&self, query: &TimeSlot) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.start_time < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.end_time > query.start)
    }

    /// Approved bookings overlapping `query`, other than `exclude`.
    pub fn approved_conflicts<'a>(
        &'a self,
        query: &TimeSlot,
        exclude: Option<&'a BookingId>,
    ) -> impl Iterator<Item = &'a Booking> {
        self.overlapping(query).filter(move |b| {
            b.status == BookingStatus::Approved && exclude.is_none_or(|id| &b.id != id)
        })
    }
}

/// One status change inside a `StatusChanged` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: BookingId,
    pub status: BookingStatus,
    /// `None` leaves existing notes untouched.
    pub notes: Option<String>,
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    /// Every change in one record commits together.
    StatusChanged {
        changes: Vec<StatusChange>,
        at: DateTime<Utc>,
    },
    BookingsDeleted {
        ids: Vec<BookingId>,
    },
    /// Written by compaction so purged ids are never handed out again.
    SequenceAdvanced {
        year: i32,
        last: u32,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A clashing approved booking, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub id: BookingId,
    pub user_id: String,
    pub user_name: Option<String>,
    pub slot: TimeSlot,
}

impl fmt::Display for ConflictInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self.user_name.as_deref().unwrap_or(&self.user_id);
        write!(f, "{} ({}, {})", self.id, owner, self.slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub approved: Booking,
    pub cancelled: Vec<Booking>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub user_id: Option<String>,
    pub room_id: Option<String>,
    pub status: Option<BookingStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl BookingFilter {
    pub fn matches_key(&self, key: &SlotKey) -> bool {
        self.room_id.as_ref().is_none_or(|r| r == &key.room_id)
            && self.date_from.is_none_or(|d| key.date >= d)
            && self.date_to.is_none_or(|d| key.date <= d)
    }

    pub fn matches(&self, booking: &Booking) -> bool {
        self.user_id.as_ref().is_none_or(|u| u == &booking.user_id)
            && self.status.is_none_or(|s| s == booking.status)
    }
}
