use serde::de::{Error, Visitor};

use super::config_watcher::MonitorConfig;

pub(crate) struct MonitorConfigVisitor;

impl<'de> Visitor<'de> for MonitorConfigVisitor {
    type Value = MonitorConfig;
    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut regular_interval_minutes = None;
        let mut flex_minutes = None;
        let mut poll_interval_ms = None;
        let mut poll_window_secs = None;
        let mut near_recheck_minutes = None;
        let mut approaching_recheck_minutes = None;
        let mut flag_retention_days = None;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "regular_interval_minutes" => {
                    regular_interval_minutes = Some(map.next_value::<u64>()?.clamp(5, 240))
                }
                "flex_minutes" => flex_minutes = Some(map.next_value::<u64>()?),
                "poll_interval_ms" => {
                    poll_interval_ms = Some(map.next_value::<u64>()?.clamp(250, 10_000))
                }
                "poll_window_secs" => poll_window_secs = Some(map.next_value::<u64>()?.clamp(2, 120)),
                "near_recheck_minutes" => {
                    near_recheck_minutes = Some(map.next_value::<u64>()?.clamp(1, 30))
                }
                "approaching_recheck_minutes" => {
                    approaching_recheck_minutes = Some(map.next_value::<u64>()?.clamp(1, 60))
                }
                "flag_retention_days" => {
                    flag_retention_days = Some(map.next_value::<u32>()?.clamp(1, 30))
                }
                _ => {
                    let _: serde::de::IgnoredAny = map.next_value()?;
                }
            }
        }
        let regular_interval_minutes = regular_interval_minutes
            .ok_or_else(|| A::Error::missing_field("regular_interval_minutes"))?;
        // Flex can never exceed the window it sits in.
        let flex_minutes = flex_minutes
            .ok_or_else(|| A::Error::missing_field("flex_minutes"))?
            .min(regular_interval_minutes);
        let poll_interval_ms =
            poll_interval_ms.ok_or_else(|| A::Error::missing_field("poll_interval_ms"))?;
        let poll_window_secs =
            poll_window_secs.ok_or_else(|| A::Error::missing_field("poll_window_secs"))?;
        let near_recheck_minutes =
            near_recheck_minutes.ok_or_else(|| A::Error::missing_field("near_recheck_minutes"))?;
        let approaching_recheck_minutes = approaching_recheck_minutes
            .ok_or_else(|| A::Error::missing_field("approaching_recheck_minutes"))?;
        let flag_retention_days =
            flag_retention_days.ok_or_else(|| A::Error::missing_field("flag_retention_days"))?;

        Ok(MonitorConfig {
            regular_interval_minutes,
            flex_minutes,
            poll_interval_ms,
            poll_window_secs,
            near_recheck_minutes,
            approaching_recheck_minutes,
            flag_retention_days,
        })
    }

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a map representing MonitorConfig")
    }
}
