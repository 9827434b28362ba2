//! Service info key/value entries and size-bounded chunking

use fdo_core::{cbor_array, codec, FdoError, FdoResult, DEFAULT_MAX_SERVICE_INFO_SIZE};
use serde_bytes::ByteBuf;

cbor_array! {
    /// One service info entry: `[ServiceInfoKey, ServiceInfoVal]`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ServiceInfoKv {
        /// Module and message name, such as `devmod:os`
        pub key: String,
        /// CBOR-encoded value
        pub value: ByteBuf,
    }
}

impl ServiceInfoKv {
    /// Build an entry from a key and an already encoded value
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value: ByteBuf::from(value),
        }
    }
}

/// Ordered service info entries
pub type ServiceInfo = Vec<ServiceInfoKv>;

/// Bytes a service info message adds around its entry list
pub const MESSAGE_OVERHEAD: usize = 3;

/// Size limit to apply when a peer announces `announced`
///
/// Zero and absent both mean the protocol default.
pub fn negotiated_size(announced: Option<u16>) -> u16 {
    match announced {
        None | Some(0) => DEFAULT_MAX_SERVICE_INFO_SIZE,
        Some(size) => size,
    }
}

/// Encoded size of a service info list
pub fn encoded_len(service_info: &[ServiceInfoKv]) -> FdoResult<usize> {
    Ok(codec::to_vec(&service_info)?.len())
}

/// Take the longest prefix of `pending` whose encoding fits in `max_size` bytes
///
/// Returns the chunk and the number of entries consumed. An entry that cannot
/// fit on its own is an error rather than an empty chunk, so callers never loop
/// forever.
pub fn next_chunk(pending: &[ServiceInfoKv], max_size: usize) -> FdoResult<(ServiceInfo, usize)> {
    let mut chunk = Vec::new();
    for entry in pending {
        chunk.push(entry.clone());
        if encoded_len(&chunk)? > max_size {
            chunk.pop();
            break;
        }
    }

    if chunk.is_empty() && !pending.is_empty() {
        return Err(FdoError::internal(format!(
            "service info entry {:?} does not fit in {max_size} bytes",
            pending[0].key
        )));
    }
    let consumed = chunk.len();
    Ok((chunk, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(key: &str, len: usize) -> ServiceInfoKv {
        ServiceInfoKv::new(key, vec![0xee; len])
    }

    #[test]
    fn test_chunk_respects_limit() {
        let pending = vec![entry("a:1", 100), entry("a:2", 100), entry("a:3", 100)];
        let (chunk, consumed) = next_chunk(&pending, 250).unwrap();
        assert_eq!(consumed, 2);
        assert!(encoded_len(&chunk).unwrap() <= 250);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let pending = vec![entry("big:1", 2000)];
        assert!(next_chunk(&pending, 1300).is_err());
    }

    #[test]
    fn test_negotiated_size() {
        assert_eq!(negotiated_size(None), 1300);
        assert_eq!(negotiated_size(Some(0)), 1300);
        assert_eq!(negotiated_size(Some(4096)), 4096);
    }

    #[test]
    fn test_empty_pending() {
        let (chunk, consumed) = next_chunk(&[], 1300).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(consumed, 0);
    }

    proptest! {
        #[test]
        fn chunks_cover_everything_in_order(sizes in prop::collection::vec(0usize..200, 0..20)) {
            let pending: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, len)| entry(&format!("m:{i}"), *len))
                .collect();

            let mut offset = 0;
            let mut seen = Vec::new();
            while offset < pending.len() {
                let (chunk, consumed) = next_chunk(&pending[offset..], 300).unwrap();
                prop_assert!(consumed > 0);
                prop_assert!(encoded_len(&chunk).unwrap() <= 300);
                seen.extend(chunk);
                offset += consumed;
            }
            prop_assert_eq!(seen, pending);
        }
    }
}
