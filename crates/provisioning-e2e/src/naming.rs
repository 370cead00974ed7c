//! Random, run-unique resource names.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock, PoisonError};
use uuid::Uuid;

/// Length of the lowercase suffix appended to generated names
pub const RANDOM_SUFFIX_LEN: usize = 5;

static ISSUED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// `len` random lowercase ASCII letters
#[must_use]
pub fn random_lowercase(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        for byte in Uuid::new_v4().as_bytes() {
            if out.len() == len {
                break;
            }
            out.push(char::from(b'a' + byte % 26));
        }
    }
    out
}

/// `base` followed by a random suffix never issued before in this process
#[must_use]
pub fn append_random_string(base: &str) -> String {
    let issued = ISSUED.get_or_init(|| Mutex::new(HashSet::new()));
    let mut issued = issued.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        let candidate = format!("{base}{}", random_lowercase(RANDOM_SUFFIX_LEN));
        if issued.insert(candidate.clone()) {
            return candidate;
        }
    }
}

/// generateName prefix for a cluster's first machine pool config
#[must_use]
pub fn machine_pool_prefix(cluster_name: &str) -> String {
    format!("nc-{cluster_name}-pool1-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_shape() {
        let name = append_random_string("test-cluster-");
        let suffix = name.strip_prefix("test-cluster-").unwrap();
        assert_eq!(suffix.len(), RANDOM_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn test_names_are_unique() {
        let names: HashSet<String> = (0..500).map(|_| append_random_string("u")).collect();
        assert_eq!(names.len(), 500);
    }

    #[test]
    fn test_long_random_strings_span_several_uuids() {
        assert_eq!(random_lowercase(40).len(), 40);
        assert!(random_lowercase(0).is_empty());
    }

    #[test]
    fn test_machine_pool_prefix() {
        assert_eq!(machine_pool_prefix("automationdo-abcde"), "nc-automationdo-abcde-pool1-");
    }
}
