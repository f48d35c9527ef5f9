//! `serde(default = ...)` helpers for [`super::types`].

pub fn default_status_nick() -> String {
    "*status".to_string()
}

pub fn default_storage_path() -> String {
    "bnc.redb".to_string()
}
