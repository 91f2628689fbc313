/// Durations in the `<number>[ns|us|ms|s|m|h]` grammar, e.g. `1h30m`.
pub mod duration {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse::<humantime::Duration>()
            .map(Into::into)
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Window {
        #[serde(with = "super::duration")]
        interval: Duration,
    }

    #[test]
    fn test_duration_grammar() {
        let w: Window = serde_json::from_str(r#"{ "interval": "1h30m" }"#).unwrap();
        assert_eq!(w.interval, Duration::from_secs(90 * 60));

        let w: Window = serde_json::from_str(r#"{ "interval": "250ms" }"#).unwrap();
        assert_eq!(w.interval, Duration::from_millis(250));
    }
}
