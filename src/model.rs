use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rand::Rng;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for wall-clock timestamps.
pub type Ms = i64;

/// Whole currency units.
pub type Price = i64;

pub const MINUTES_PER_DAY: u32 = 1440;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Parse an ISO `YYYY-MM-DD` date.
///
/// chrono also takes unpadded fields (`2024-6-1`), so anything used as a key
/// must go through [`date_key`] rather than the raw input.
pub fn parse_iso_date(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()
}

/// Zero-padded `YYYY-MM-DD`, the only form dates are stored and compared in.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Day of week, 0 = Sunday.
pub fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Time of day ──────────────────────────────────────────────────

/// Minutes since local midnight, always in `0..1440`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct TimeOfDay(u16);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day: {0:?}")]
pub struct InvalidTime(pub String);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes as u16))
    }

    pub fn from_hm(hours: u32, minutes: u32) -> Option<Self> {
        if minutes >= 60 {
            return None;
        }
        Self::from_minutes(hours * 60 + minutes)
    }

    /// Fold a position on the day-relative axis (which may run past midnight) back into a clock time.
    pub fn wrapping(minutes: u32) -> Self {
        Self((minutes % MINUTES_PER_DAY) as u16)
    }

    pub fn minutes(self) -> u32 {
        u32::from(self.0)
    }
}

impl TryFrom<u16> for TimeOfDay {
    type Error = InvalidTime;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_minutes(u32::from(value)).ok_or_else(|| InvalidTime(value.to_string()))
    }
}

impl From<TimeOfDay> for u16 {
    fn from(t: TimeOfDay) -> u16 {
        t.0
    }
}

impl FromStr for TimeOfDay {
    type Err = InvalidTime;

    /// Accepts `H:MM` and `HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || InvalidTime(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(bad());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let hours: u32 = h.parse().map_err(|_| bad())?;
        let minutes: u32 = m.parse().map_err(|_| bad())?;
        Self::from_hm(hours, minutes).ok_or_else(bad)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Half-open minute range `[start, end)` on a day-relative axis.
/// `end` runs past 1440 when the range crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u32,
    pub end: u32,
}

impl Window {
    /// Normalize a clock range: an end at or before the start means the next day.
    pub fn wrapping(start: TimeOfDay, end: TimeOfDay) -> Self {
        let start = start.minutes();
        let mut end = end.minutes();
        if end <= start {
            end += MINUTES_PER_DAY;
        }
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn contains_instant(&self, t: u32) -> bool {
        self.start <= t && t < self.end
    }

    /// True if the clock time falls inside the window on either side of midnight.
    pub fn covers(&self, t: TimeOfDay) -> bool {
        let m = t.minutes();
        self.contains_instant(m) || self.contains_instant(m + MINUTES_PER_DAY)
    }
}

// ── Schedules ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub multiplier: f64,
}

impl PriceRange {
    pub fn window(&self) -> Window {
        Window::wrapping(self.start, self.end)
    }
}

/// Opening hours and price ranges of one resource on one weekday.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub opening: TimeOfDay,
    pub closing: TimeOfDay,
    /// Declaration order matters: the first range covering a slot start prices it.
    pub price_ranges: Vec<PriceRange>,
}

impl WeeklySchedule {
    pub fn new(opening: TimeOfDay, closing: TimeOfDay) -> Self {
        Self {
            opening,
            closing,
            price_ranges: Vec::new(),
        }
    }

    pub fn window(&self) -> Window {
        Window::wrapping(self.opening, self.closing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateSlot {
    /// Day-relative minutes; past-midnight slots start at or after 1440.
    pub start: u32,
    pub end: u32,
    pub price_multiplier: f64,
}

impl CandidateSlot {
    pub fn start_time(&self) -> TimeOfDay {
        TimeOfDay::wrapping(self.start)
    }

    pub fn end_time(&self) -> TimeOfDay {
        TimeOfDay::wrapping(self.end)
    }

    pub fn duration(&self) -> u32 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotAvailability {
    pub slot: CandidateSlot,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: String,
    pub name: Option<String>,
    pub hourly_price: Price,
    pub slot_minutes: u32,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Paid,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reservation status: {0:?}")]
pub struct UnknownStatus(pub String);

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 5] = [
        ReservationStatus::Pending,
        ReservationStatus::Confirmed,
        ReservationStatus::Paid,
        ReservationStatus::Completed,
        ReservationStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Paid => "paid",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Holds its slot. Every status but `cancelled` does.
    pub fn is_live(self) -> bool {
        self != ReservationStatus::Cancelled
    }
}

impl FromStr for ReservationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const CODE_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const CODE_LEN: usize = 6;

/// Guest-facing reservation handle: six uppercase alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookingCode(String);

impl BookingCode {
    /// Normalizes case and surrounding whitespace; `None` if the shape is wrong.
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().to_ascii_uppercase();
        let well_formed =
            code.len() == CODE_LEN && code.bytes().all(|b| CODE_ALPHABET.contains(&b));
        well_formed.then_some(Self(code))
    }

    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Contact {
    Phone(String),
    Email(String),
}

impl Contact {
    pub fn value(&self) -> &str {
        match self {
            Contact::Phone(v) | Contact::Email(v) => v,
        }
    }

    pub fn phone(&self) -> Option<&str> {
        match self {
            Contact::Phone(v) => Some(v),
            Contact::Email(_) => None,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            Contact::Email(v) => Some(v),
            Contact::Phone(_) => None,
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            Contact::Phone(_) => "phone",
            Contact::Email(_) => "email",
        }
    }

    /// Case-insensitive substring match against the stored value.
    pub fn matches(&self, needle: &str) -> bool {
        self.value()
            .to_lowercase()
            .contains(&needle.trim().to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub first_name: String,
    pub last_name: String,
    pub contact: Contact,
}

impl Guest {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Guest,
    Manager,
    Owner,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Manager => "manager",
            Role::Owner => "owner",
            Role::Admin => "admin",
        }
    }

    pub fn is_staff(self) -> bool {
        !matches!(self, Role::Guest)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller identity supplied by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.role)
    }
}

/// One audited lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: ReservationStatus,
    pub to: ReservationStatus,
    pub actor: Actor,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DayKey {
    pub resource_id: String,
    pub date: String,
}

impl DayKey {
    pub fn new(resource_id: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            date: date.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: String,
    /// `YYYY-MM-DD`. Slots past midnight stay keyed under the date their window opened on.
    pub date: String,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub duration_minutes: u32,
    pub total_price: Price,
    pub status: ReservationStatus,
    pub guest: Guest,
    pub booking_code: BookingCode,
    pub booked_at: Ms,
    pub payment_ref: Option<String>,
    pub history: Vec<StatusChange>,
}

impl Reservation {
    pub fn day_key(&self) -> DayKey {
        DayKey::new(self.resource_id.clone(), self.date.clone())
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

/// Staff-side filter over reservations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReservationQuery {
    pub resource_id: Option<String>,
    pub date: Option<String>,
    pub status: Option<ReservationStatus>,
    /// Case-insensitive match on booking code or guest name.
    pub search: Option<String>,
    /// 1-based; 0 is treated as 1.
    pub page: usize,
    /// 0 means the default page size.
    pub page_size: usize,
}

impl ReservationQuery {
    pub fn matches(&self, r: &Reservation) -> bool {
        if self.resource_id.as_ref().is_some_and(|id| *id != r.resource_id) {
            return false;
        }
        if self.date.as_ref().is_some_and(|d| *d != r.date) {
            return false;
        }
        if self.status.is_some_and(|s| s != r.status) {
            return false;
        }
        match &self.search {
            Some(term) if !term.trim().is_empty() => {
                let term = term.trim().to_lowercase();
                r.booking_code.as_str().to_lowercase().contains(&term)
                    || r.guest.full_name().to_lowercase().contains(&term)
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationPage {
    pub reservations: Vec<Reservation>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Journal record. Flat, one variant per durable state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: String,
        name: Option<String>,
        hourly_price: Price,
        slot_minutes: u32,
    },
    /// Replaces the day's schedule, dropping its price ranges.
    ScheduleSet {
        resource_id: String,
        weekday: u8,
        opening: TimeOfDay,
        closing: TimeOfDay,
    },
    PriceRangeAdded {
        resource_id: String,
        weekday: u8,
        range: PriceRange,
    },
    ScheduleCleared {
        resource_id: String,
        weekday: u8,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    StatusChanged {
        id: Ulid,
        resource_id: String,
        change: StatusChange,
        payment_ref: Option<String>,
    },
}

impl Event {
    pub fn resource_id(&self) -> &str {
        match self {
            Event::ResourceRegistered { id, .. } => id,
            Event::ScheduleSet { resource_id, .. }
            | Event::PriceRangeAdded { resource_id, .. }
            | Event::ScheduleCleared { resource_id, .. }
            | Event::StatusChanged { resource_id, .. } => resource_id,
            Event::ReservationCreated { reservation } => &reservation.resource_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn time_of_day_parse_and_display() {
        assert_eq!(t("22:00").minutes(), 1320);
        assert_eq!(t("9:05").minutes(), 545);
        assert_eq!(t("00:00"), TimeOfDay::MIDNIGHT);
        assert_eq!(t("23:59").to_string(), "23:59");
        assert_eq!(t("7:30").to_string(), "07:30");
    }

    #[test]
    fn time_of_day_rejects_garbage() {
        for bad in ["24:00", "12:60", "12", "ab:cd", "1:5", "123:00", "", "-1:00", "12:00:00"] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad} should not parse");
        }
        assert!(TimeOfDay::from_minutes(1440).is_none());
        assert!(TimeOfDay::try_from(1439u16).is_ok());
    }

    #[test]
    fn wrapping_folds_past_midnight() {
        assert_eq!(TimeOfDay::wrapping(1440), TimeOfDay::MIDNIGHT);
        assert_eq!(TimeOfDay::wrapping(1500).to_string(), "01:00");
    }

    #[test]
    fn window_crossing_midnight() {
        let w = Window::wrapping(t("22:00"), t("02:00"));
        assert_eq!(w, Window { start: 1320, end: 1560 });
        assert_eq!(w.len(), 240);
        assert!(w.covers(t("23:30")));
        assert!(w.covers(t("01:59")));
        assert!(!w.covers(t("02:00"))); // half-open
        assert!(!w.covers(t("12:00")));
    }

    #[test]
    fn window_equal_ends_is_a_full_day() {
        let w = Window::wrapping(t("08:00"), t("08:00"));
        assert_eq!(w.len(), MINUTES_PER_DAY);
        assert!(w.covers(t("07:59")));
        assert!(w.covers(t("08:00")));
    }

    #[test]
    fn status_names_round_trip() {
        for st in ReservationStatus::ALL {
            assert_eq!(st.as_str().parse::<ReservationStatus>().unwrap(), st);
        }
        assert_eq!("PAID".parse::<ReservationStatus>().unwrap(), ReservationStatus::Paid);
        assert!("Payé".parse::<ReservationStatus>().is_err());
        assert!(!ReservationStatus::Cancelled.is_live());
        assert!(ReservationStatus::Completed.is_live());
    }

    #[test]
    fn booking_code_parse_normalizes() {
        let code = BookingCode::parse(" ab12c3 ").unwrap();
        assert_eq!(code.as_str(), "AB12C3");
        assert!(BookingCode::parse("AB12C").is_none());
        assert!(BookingCode::parse("AB12C3D").is_none());
        assert!(BookingCode::parse("AB-2C3").is_none());
    }

    #[test]
    fn booking_code_generate_uses_alphabet() {
        let mut rng = rand::rng();
        for _ in 0..100 {
            let code = BookingCode::generate(&mut rng);
            assert_eq!(code.as_str().len(), CODE_LEN);
            assert!(code.as_str().bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert_eq!(BookingCode::parse(code.as_str()), Some(code));
        }
    }

    #[test]
    fn contact_matching_is_case_insensitive_substring() {
        let email = Contact::Email("Awa.Diop@Example.com".into());
        assert!(email.matches("awa.diop"));
        assert!(email.matches("EXAMPLE.COM"));
        assert!(!email.matches("someone@else.com"));

        let phone = Contact::Phone("+221 77 123 45 67".into());
        assert!(phone.matches("45 67"));
        assert!(!phone.matches("notmatching@x.com"));
        assert_eq!(phone.phone(), Some("+221 77 123 45 67"));
        assert_eq!(phone.email(), None);
    }

    #[test]
    fn weekday_from_iso_date() {
        let day = |s: &str| parse_iso_date(s).map(weekday_of);
        assert_eq!(day("2024-06-01"), Some(6)); // Saturday
        assert_eq!(day("2024-06-02"), Some(0)); // Sunday
        assert_eq!(day("2024-02-30"), None);
        assert_eq!(day("01/06/2024"), None);
    }

    #[test]
    fn date_keys_are_zero_padded() {
        for raw in ["2024-06-01", "2024-6-1", " 2024-06-01", "2024-06-01 "] {
            let date = parse_iso_date(raw).unwrap_or_else(|| panic!("{raw:?} should parse"));
            assert_eq!(date_key(date), "2024-06-01");
        }
    }

    #[test]
    fn query_search_covers_code_and_name() {
        let r = Reservation {
            id: Ulid::new(),
            resource_id: "R1".into(),
            date: "2024-06-01".into(),
            start: t("14:00"),
            end: t("15:00"),
            duration_minutes: 60,
            total_price: 25_000,
            status: ReservationStatus::Pending,
            guest: Guest {
                first_name: "Awa".into(),
                last_name: "Diop".into(),
                contact: Contact::Phone("771234567".into()),
            },
            booking_code: BookingCode::parse("AB12C3").unwrap(),
            booked_at: 0,
            payment_ref: None,
            history: Vec::new(),
        };
        let q = |search: &str| ReservationQuery {
            search: Some(search.into()),
            ..Default::default()
        };
        assert!(q("ab12").matches(&r));
        assert!(q("awa d").matches(&r));
        assert!(!q("moussa").matches(&r));

        let other_day = ReservationQuery {
            date: Some("2024-06-02".into()),
            ..Default::default()
        };
        assert!(!other_day.matches(&r));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::PriceRangeAdded {
            resource_id: "R1".into(),
            weekday: 5,
            range: PriceRange {
                start: t("18:00"),
                end: t("01:00"),
                multiplier: 1.5,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn out_of_range_time_fails_to_deserialize() {
        let bytes = bincode::serialize(&2000u16).unwrap();
        assert!(bincode::deserialize::<TimeOfDay>(&bytes).is_err());
    }
}
