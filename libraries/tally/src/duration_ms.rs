//! Serialize a [`Duration`] as a whole number of milliseconds.
//!
//! Use with `#[serde(with = "tally::duration_ms")]`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Wrapper {
        #[serde(with = "crate::duration_ms")]
        interval: Duration,
    }

    #[test]
    fn durations_are_plain_millisecond_numbers() {
        let json = serde_json::to_string(&Wrapper {
            interval: Duration::from_millis(250),
        })
        .unwrap();
        assert_eq!(json, r#"{"interval":250}"#);

        let parsed: Wrapper = serde_json::from_str(r#"{"interval":1500}"#).unwrap();
        assert_eq!(parsed.interval, Duration::from_millis(1500));
    }
}
