pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_EQUIPMENT_ITEMS: usize = 32;
pub const MAX_EQUIPMENT_ITEM_LEN: usize = 64;
pub const MAX_ATTENDEES: u32 = 10_000;
pub const MAX_KEY_LEN: usize = 64;

/// Bookings held by a single (room, date) schedule, any status.
pub const MAX_BOOKINGS_PER_SCHEDULE: usize = 10_000;

pub const MAX_RETENTION_DAYS: u32 = 3650;
pub const MAX_LIST_ROWS: usize = 10_000;
