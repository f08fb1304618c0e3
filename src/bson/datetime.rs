//! UTC datetime support.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::de::{Deserialize, Deserializer, Visitor};

/// A BSON UTC datetime: a signed 64-bit count of milliseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime(i64);

impl DateTime {
    /// The current time, truncated to millisecond precision.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Construct a `DateTime` from a count of milliseconds since the Unix epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// The number of milliseconds since the Unix epoch.
    pub const fn timestamp_millis(self) -> i64 {
        self.0
    }

    /// Convert a [`SystemTime`] to a `DateTime`, saturating at the representable range.
    pub fn from_system_time(st: SystemTime) -> Self {
        match st.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
            Err(e) => {
                let millis = i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX);
                Self(millis.checked_neg().unwrap_or(i64::MIN))
            }
        }
    }

    /// Convert this datetime to a [`SystemTime`].
    pub fn to_system_time(self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(self.0.unsigned_abs())
        }
    }
}

impl fmt::Debug for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DateTime").field(&self.0).finish()
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DateTime({} ms)", self.0)
    }
}

impl From<SystemTime> for DateTime {
    fn from(st: SystemTime) -> Self {
        Self::from_system_time(st)
    }
}

impl<'de> Deserialize<'de> for DateTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DateTimeVisitor;

        impl Visitor<'_> for DateTimeVisitor {
            type Value = DateTime;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a millisecond timestamp")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<DateTime, E> {
                Ok(DateTime::from_millis(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<DateTime, E> {
                i64::try_from(v)
                    .map(DateTime::from_millis)
                    .map_err(|_| E::custom("millisecond timestamp out of range"))
            }
        }

        deserializer.deserialize_i64(DateTimeVisitor)
    }
}
