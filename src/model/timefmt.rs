//! Wire formats for the naive station-local timestamps the device reports.

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

/// `2024-01-05T10:00:00`
pub const DEVICE_TIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// `2024-01-05 10:00:00`, the reply to the `initialize` handshake.
pub const HANDSHAKE_TIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// `2024-01-05`
pub const DEVICE_DATE: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

pub mod device_time {
    use super::DEVICE_TIME;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use time::PrimitiveDateTime;

    pub fn serialize<S: Serializer>(
        value: &PrimitiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let formatted = value
            .format(DEVICE_TIME)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<PrimitiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PrimitiveDateTime::parse(&raw, DEVICE_TIME).map_err(D::Error::custom)
    }

    pub mod option {
        use super::DEVICE_TIME;
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};
        use time::PrimitiveDateTime;

        pub fn serialize<S: Serializer>(
            value: &Option<PrimitiveDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<PrimitiveDateTime>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| PrimitiveDateTime::parse(&raw, DEVICE_TIME).map_err(D::Error::custom))
                .transpose()
        }
    }
}

pub mod device_date {
    use super::DEVICE_DATE;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = value
            .format(DEVICE_DATE)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Date::parse(&raw, DEVICE_DATE).map_err(D::Error::custom)
    }

    pub mod option {
        use super::DEVICE_DATE;
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        pub fn serialize<S: Serializer>(
            value: &Option<Date>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Date>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| Date::parse(&raw, DEVICE_DATE).map_err(D::Error::custom))
                .transpose()
        }
    }
}
