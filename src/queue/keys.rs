/// Key layout and encoding utilities for queue partitions
///
/// Partition structure:
/// - `jobs`: job:{id:020} -> QueueJob (JSON)
/// - `states`: state:{queue}:{state}:{id:020} -> empty (secondary index)
/// - `deps`: dep:{parent:020}:{child:020} -> "pending" | "processed"
/// - `metadata`: meta:{key} -> value
///
/// Ids are zero-padded so lexicographic order matches numeric order, which
/// makes the first entry of a state prefix the oldest job in that state.
use super::job::{JobId, JobState};

pub const DEP_PENDING: &[u8] = b"pending";
pub const DEP_PROCESSED: &[u8] = b"processed";

/// Encode a job key: job:{id}
pub fn encode_job_key(id: JobId) -> Vec<u8> {
    format!("job:{:020}", id.0).into_bytes()
}

/// Encode a state index key: state:{queue}:{state}:{id}
pub fn encode_state_key(queue: &str, state: JobState, id: JobId) -> Vec<u8> {
    format!("state:{}:{}:{:020}", queue, state.as_str(), id.0).into_bytes()
}

/// Encode a state index prefix for range scan: state:{queue}:{state}:
pub fn encode_state_prefix(queue: &str, state: JobState) -> Vec<u8> {
    format!("state:{}:{}:", queue, state.as_str()).into_bytes()
}

/// Decode the trailing id of a state index key
pub fn decode_state_key(key: &[u8]) -> Option<JobId> {
    let key_str = std::str::from_utf8(key).ok()?;
    let id = key_str.rsplit(':').next()?;
    id.parse().ok().map(JobId)
}

/// Encode a dependency edge key: dep:{parent}:{child}
pub fn encode_dep_key(parent: JobId, child: JobId) -> Vec<u8> {
    format!("dep:{:020}:{:020}", parent.0, child.0).into_bytes()
}

/// Encode a dependency prefix for range scan: dep:{parent}:
pub fn encode_dep_prefix(parent: JobId) -> Vec<u8> {
    format!("dep:{:020}:", parent.0).into_bytes()
}

/// Decode a dependency edge key: dep:{parent}:{child} -> (parent, child)
pub fn decode_dep_key(key: &[u8]) -> Option<(JobId, JobId)> {
    let key_str = std::str::from_utf8(key).ok()?;
    let parts: Vec<&str> = key_str.strip_prefix("dep:")?.split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let parent = parts[0].parse().ok()?;
    let child = parts[1].parse().ok()?;
    Some((JobId(parent), JobId(child)))
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_key_round_trip() {
        let key = encode_state_key("part", JobState::Waiting, JobId(7));
        assert_eq!(key, b"state:part:waiting:00000000000000000007");
        assert!(key.starts_with(&encode_state_prefix("part", JobState::Waiting)));
        assert_eq!(decode_state_key(&key), Some(JobId(7)));
    }

    #[test]
    fn test_state_keys_sort_numerically() {
        let low = encode_state_key("part", JobState::Waiting, JobId(9));
        let high = encode_state_key("part", JobState::Waiting, JobId(10));
        assert!(low < high);
    }

    #[test]
    fn test_dep_key_encoding() {
        let key = encode_dep_key(JobId(1), JobId(2));
        assert!(key.starts_with(&encode_dep_prefix(JobId(1))));
        assert_eq!(decode_dep_key(&key), Some((JobId(1), JobId(2))));
        assert_eq!(decode_dep_key(b"dep:garbage"), None);
    }

    #[test]
    fn test_meta_key_encoding() {
        assert_eq!(encode_meta_key("next_seq"), b"meta:next_seq");
    }
}
