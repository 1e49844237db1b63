use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Raised when a status string is not one of the enum's wire names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($wire => Ok($name::$variant),)+
                    _ => Err(UnknownStatus { kind: $kind, value: s.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

wire_enum!(AppointmentStatus, "appointment", {
    Pending => "pending",
    Confirmed => "confirmed",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BayStatus {
    Available,
    Occupied,
    Maintenance,
}

wire_enum!(BayStatus, "bay", {
    Available => "available",
    Occupied => "occupied",
    Maintenance => "maintenance",
});

/// No `pending`/`cancelled`: a progress row only exists once work has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressStatus {
    InProgress,
    WaitingParts,
    Testing,
    Completed,
}

wire_enum!(ProgressStatus, "repair progress", {
    InProgress => "in_progress",
    WaitingParts => "waiting_parts",
    Testing => "testing",
    Completed => "completed",
});

/// Which staff desk owns an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentKind {
    /// Maintenance slot; carries a time slot.
    Service,
    /// Vehicle test drive; no time slot.
    TestDrive,
}

wire_enum!(AppointmentKind, "appointment kind", {
    Service => "service",
    TestDrive => "test_drive",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub account_id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl CustomerRef {
    /// Case-insensitive substring match over the identity fields.
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.name.to_lowercase().contains(&needle)
            || self.email.to_lowercase().contains(&needle)
            || self
                .phone
                .as_deref()
                .is_some_and(|p| p.to_lowercase().contains(&needle))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub kind: AppointmentKind,
    pub customer: CustomerRef,
    /// Priced service (maintenance) or product (test drive) being booked.
    pub subject_id: Ulid,
    pub scheduled_date: NaiveDate,
    pub time_slot: Option<String>,
    pub status: AppointmentStatus,
    pub note: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    /// Key of the slot this appointment holds, if it is a slotted service booking.
    pub fn slot_key(&self) -> Option<SlotKey> {
        match (self.kind, &self.time_slot) {
            (AppointmentKind::Service, Some(slot)) => Some(SlotKey {
                subject_id: self.subject_id,
                date: self.scheduled_date,
                time_slot: slot.clone(),
            }),
            _ => None,
        }
    }
}

/// `(service, date, time slot)`, unique among non-cancelled service appointments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub subject_id: Ulid,
    pub date: NaiveDate,
    pub time_slot: String,
}

/// A physical service bay.
///
/// `status == Occupied` iff `current_booking.is_some()`. The mutators below
/// are the only way the two fields change together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bay {
    pub id: Ulid,
    pub number: u32,
    pub status: BayStatus,
    pub current_booking: Option<Ulid>,
    pub last_maintenance: Option<Ms>,
    pub notes: Option<String>,
    pub updated_at: Ms,
}

impl Bay {
    pub fn new(id: Ulid, number: u32, notes: Option<String>, last_maintenance: Option<Ms>) -> Self {
        Self {
            id,
            number,
            status: BayStatus::Available,
            current_booking: None,
            last_maintenance,
            notes,
            updated_at: now_ms(),
        }
    }

    pub fn seat(&mut self, appointment_id: Ulid) {
        self.status = BayStatus::Occupied;
        self.current_booking = Some(appointment_id);
        self.updated_at = now_ms();
    }

    pub fn vacate(&mut self) {
        self.status = BayStatus::Available;
        self.current_booking = None;
        self.updated_at = now_ms();
    }

    pub fn set_maintenance(&mut self, on: bool) {
        debug_assert!(self.current_booking.is_none());
        self.status = if on {
            BayStatus::Maintenance
        } else {
            BayStatus::Available
        };
        self.updated_at = now_ms();
    }

    pub fn is_consistent(&self) -> bool {
        (self.status == BayStatus::Occupied) == self.current_booking.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairProgress {
    pub id: Ulid,
    pub appointment_id: Ulid,
    /// Authoring staff identity; only this identity may mutate the row.
    pub staff_id: String,
    pub status: ProgressStatus,
    pub notes: Option<String>,
    pub estimated_completion: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub recipient: Ulid,
    pub message: String,
    pub read: bool,
    pub created_at: Ms,
}

impl Notification {
    pub fn new(recipient: Ulid, message: String) -> Self {
        Self {
            id: Ulid::new(),
            recipient,
            message,
            read: false,
            created_at: now_ms(),
        }
    }
}

/// The WAL record format: whole-document saves and deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentSaved(Appointment),
    BaySaved(Bay),
    BayDeleted { id: Ulid },
    ProgressSaved(RepairProgress),
    ProgressDeleted { id: Ulid },
    NotificationSaved(Notification),
}

// ── Acting identity ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Test-drive desk.
    Sale,
    /// Maintenance desk; the only role that touches bays and repair progress.
    Service,
    Customer,
}

wire_enum!(Role, "role", {
    Sale => "sale",
    Service => "service",
    Customer => "customer",
});

impl Role {
    /// Appointment kind owned by a staff role; `None` for customers.
    pub fn staff_domain(&self) -> Option<AppointmentKind> {
        match self {
            Role::Sale => Some(AppointmentKind::TestDrive),
            Role::Service => Some(AppointmentKind::Service),
            Role::Customer => None,
        }
    }
}

/// The authenticated caller of every workflow operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub identity: String,
    pub role: Role,
}

impl Actor {
    pub fn new(identity: impl Into<String>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }

    /// Customer account id, when the actor is a customer with a well-formed identity.
    pub fn account_id(&self) -> Option<Ulid> {
        match self.role {
            Role::Customer => Ulid::from_string(&self.identity).ok(),
            _ => None,
        }
    }
}

// ── Paging ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: crate::limits::DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}
