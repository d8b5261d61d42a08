use chrono::{SecondsFormat, Utc};

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Compact UTC stamp used in dead-letter filenames.
pub fn now_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}
