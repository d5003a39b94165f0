//! Proptest strategies for container and data-space values.
//!
//! Strategies produce plain values (names, labels, version components,
//! payloads) so any crate can build its own types from them.
//!
//! # Usage
//!
//! ```no_run
//! use dataspace_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(name in strategies::arb_element_name()) {
//!         // test invariant with a randomly generated element name
//!     }
//! }
//! ```

use proptest::prelude::*;

/// Generates a valid user element name of 1-31 characters.
///
/// Names start with a letter and never contain `\ / : !`.
pub fn arb_element_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9 _.-]{0,30}"
}

/// Generates a path of 0-4 element names.
pub fn arb_storage_path() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec(arb_element_name(), 0..5)
}

/// Generates a data-space or transform label of 1-40 characters.
pub fn arb_label() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9]{0,39}"
}

/// Generates a set of 1-8 labels that are distinct when compared case-insensitively.
pub fn arb_distinct_labels() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::btree_set("[a-z][a-z0-9]{0,15}", 1..9)
        .prop_map(|labels| labels.into_iter().collect())
}

/// Generates `(major, minor)` version components.
pub fn arb_version_components() -> impl Strategy<Value = (i16, i16)> {
    (any::<i16>(), any::<i16>())
}

/// Generates a feature identifier of 1-64 characters.
pub fn arb_feature_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9.]{0,63}"
}

/// Generates an opaque extra-data blob of 0-63 bytes.
pub fn arb_extra_data() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..64)
}

/// Generates stream contents of 0-4095 bytes, biased toward compressible runs.
pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 0..4096),
        (any::<u8>(), 0usize..4096).prop_map(|(byte, len)| vec![byte; len]),
    ]
}

/// Generates a 32-byte content key.
pub fn arb_content_key() -> impl Strategy<Value = [u8; 32]> {
    any::<[u8; 32]>()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_element_names_fit_limits(name in arb_element_name()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.encode_utf16().count() <= 31);
            prop_assert!(!name.contains(['\\', '/', ':', '!']));
        }

        #[test]
        fn test_distinct_labels_are_unique(labels in arb_distinct_labels()) {
            let folded: std::collections::BTreeSet<String> =
                labels.iter().map(|l| l.to_lowercase()).collect();
            prop_assert_eq!(folded.len(), labels.len());
        }
    }
}
