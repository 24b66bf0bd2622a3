//! Migrations shipped with the `rustmigrate` binary.
//!
//! Each file holds one descriptor. File names and ids share the
//! `YYYY_MM_DD_HHMMSS_name` form so that lexical order is application order.

mod m2025_05_18_000001_create_events_table;
mod m2025_05_18_103615_create_sessions_table;

use crate::core::Result;
use crate::descriptor::DescriptorSet;

/// Every bundled descriptor, validated.
pub fn descriptors() -> Result<DescriptorSet> {
    DescriptorSet::new([
        m2025_05_18_000001_create_events_table::descriptor(),
        m2025_05_18_103615_create_sessions_table::descriptor(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_descriptors_validate_in_order() {
        let set = descriptors().unwrap();
        let ids: Vec<&str> = set.iter().map(|d| d.id()).collect();
        assert_eq!(
            ids,
            vec![
                "2025_05_18_000001_create_events_table",
                "2025_05_18_103615_create_sessions_table",
            ]
        );
    }
}
