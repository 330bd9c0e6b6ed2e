//! Identifier and timestamp helpers shared across the crate.

mod ids;
pub mod timestamps;

pub use ids::RunId;
pub use timestamps::{iso_timestamp, millis_between, now_utc, Timestamp};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_is_time_ordered() {
        let id = RunId::new();
        assert_eq!(id.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.contains(':'));
    }
}
