//! Shared value types: identifiers, time, money, roles and the acting user.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc};
use minicbor::Encode;
use rust_decimal::Decimal;

pub type Id = u64;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn date(&self) -> NaiveDate {
        self.0.date_naive()
    }
    /// Due date `days` calendar days after this instant, or `None` past the
    /// end of the supported calendar.
    pub fn due_in(&self, days: u32) -> Option<DueDate> {
        self.date().checked_add_days(Days::new(u64::from(days))).map(DueDate)
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// SLA deadlines are calendar dates, not instants.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct DueDate(NaiveDate);

impl DueDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }
    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl From<NaiveDate> for DueDate {
    fn from(value: NaiveDate) -> Self {
        DueDate(value)
    }
}

impl<C> minicbor::Encode<C> for DueDate {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i32(self.0.num_days_from_ce())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for DueDate {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let days = d.i32()?;

        NaiveDate::from_num_days_from_ce_opt(days)
            .map(DueDate)
            .ok_or(minicbor::decode::Error::message("due date out of range"))
    }
}

// newtype wrapper because Decimal doesn't implement minicbor traits.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Money(Decimal);

impl Money {
    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }
    pub fn amount(&self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<C> minicbor::Encode<C> for Money {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        self.0.serialize().encode(e, ctx)
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Money {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let raw: [u8; 16] = d.decode()?;

        Ok(Money(Decimal::deserialize(raw)))
    }
}

/// Global role assigned to a user. `Unknown` stands for "no role".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum Role {
    #[n(0)]
    Employee,
    #[n(1)]
    Manager,
    #[n(2)]
    RiskOfficer,
    #[n(3)]
    GroupOrm,
    #[n(4)]
    Unknown,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Employee => "Employee",
            Role::Manager => "Manager",
            Role::RiskOfficer => "Risk Officer",
            Role::GroupOrm => "Group ORM",
            Role::Unknown => "Unknown",
        }
    }

    /// Lenient lookup used for configuration rows; unrecognised names map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or(Role::Unknown)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Employee" => Ok(Role::Employee),
            "Manager" => Ok(Role::Manager),
            "Risk Officer" => Ok(Role::RiskOfficer),
            "Group ORM" => Ok(Role::GroupOrm),
            "Unknown" => Ok(Role::Unknown),
            other => Err(format!("unknown role name '{other}'")),
        }
    }
}

/// An already-authenticated identity as presented to the core.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct User {
    #[n(0)]
    pub id: Id,
    #[n(1)]
    pub email: String,
    #[n(2)]
    pub role: Role,
    #[n(3)]
    pub business_unit_id: Option<Id>,
    #[n(4)]
    pub manager_id: Option<Id>,
}

impl User {
    pub fn new(id: Id, email: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            email: email.into(),
            role,
            business_unit_id: None,
            manager_id: None,
        }
    }
    pub fn in_business_unit(mut self, business_unit_id: Id) -> Self {
        self.business_unit_id = Some(business_unit_id);
        self
    }
    pub fn reporting_to(mut self, manager_id: Id) -> Self {
        self.manager_id = Some(manager_id);
        self
    }
    pub fn has_role(&self, role: Role) -> bool {
        self.role == role
    }
    pub fn is_manager_of(&self, other: &User) -> bool {
        other.manager_id == Some(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_dates_are_calendar_days() {
        let ts = TimeStamp::new_with(2024, 6, 15, 23, 59, 0).unwrap();
        assert_eq!(
            ts.due_in(5).unwrap().date(),
            NaiveDate::from_ymd_opt(2024, 6, 20).unwrap()
        );
    }

    #[test]
    fn due_dates_beyond_the_calendar_are_none() {
        let ts = TimeStamp::new_with(2024, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(ts.due_in(u32::MAX), None);
    }

    #[test]
    fn money_survives_storage_encoding() {
        let original: Money = "12345.67".parse().unwrap();

        let encoding = minicbor::to_vec(original).unwrap();
        let decoded: Money = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn role_names_round_trip() {
        for role in [Role::Employee, Role::Manager, Role::RiskOfficer, Role::GroupOrm] {
            assert_eq!(role.name().parse::<Role>().unwrap(), role);
        }
        assert_eq!(Role::from_name("Auditor"), Role::Unknown);
    }
}
