use chrono::{DateTime, Local, Utc};

/// Seconds since last heartbeat under which a user counts as online
const ONLINE_THRESHOLD_SECS: i64 = 60;

/// `HH:MM` in local time, empty when there is no timestamp.
pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.with_timezone(&Local).format("%H:%M").to_string(),
        None => String::new(),
    }
}

pub fn presence_label(last_seen: Option<DateTime<Utc>>) -> String {
    presence_label_at(last_seen, Utc::now())
}

pub fn presence_label_at(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match last_seen {
        None => "never seen".to_string(),
        Some(seen) if (now - seen).num_seconds() < ONLINE_THRESHOLD_SECS => "online".to_string(),
        Some(seen) => format!("last seen {}", format_time(Some(seen))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_time_empty_for_none() {
        assert_eq!(format_time(None), "");
        assert_eq!(format_time(Some(Utc::now())).len(), 5);
    }

    #[test]
    fn test_presence_label() {
        let now = Utc::now();
        assert_eq!(presence_label_at(None, now), "never seen");
        assert_eq!(
            presence_label_at(Some(now - Duration::seconds(10)), now),
            "online"
        );

        let stale = now - Duration::minutes(5);
        assert_eq!(
            presence_label_at(Some(stale), now),
            format!("last seen {}", format_time(Some(stale)))
        );
    }
}
