//! Storage key layout shared by the collections.
//!
//! Every collection maps its records onto primitive keys under its own
//! prefix, so several collections can share one store:
//!
//! | Record | Key |
//! | ------ | --- |
//! | queue state | `queue:{id}:state` |
//! | queue element | `queue:{id}:{position}` |
//! | stream state | `stream:{id}:state` |
//! | stream event | `stream:{id}:{event_number}` |
//! | series payload | `series:{len}:{series}:{entry}` |
//! | series index | `series:{len}:{series}` |
//!
//! `{len}` is the byte length of the series id. Both series and entry ids are
//! free-form, so the length keeps `("a", "b:c")` and `("a:b", "c")` apart.
//!
//! Timestamps used as ordering keys are encoded by [`encode_timestamp`] so
//! that byte order equals time order.

use chrono::{DateTime, TimeZone, Utc};

const SIGN_BIT: u64 = 1 << 63;

pub(crate) fn queue_state_key(queue_id: &str) -> String {
    format!("queue:{queue_id}:state")
}

pub(crate) fn queue_item_key(queue_id: &str, position: i64) -> String {
    format!("queue:{queue_id}:{position}")
}

pub(crate) fn stream_state_key(stream_id: &str) -> String {
    format!("stream:{stream_id}:state")
}

pub(crate) fn event_key(stream_id: &str, event_number: i64) -> String {
    format!("stream:{stream_id}:{event_number}")
}

pub(crate) fn series_entry_key(series_id: &str, entry_id: &str) -> String {
    format!("series:{}:{series_id}:{entry_id}", series_id.len())
}

pub(crate) fn series_index(series_id: &str) -> String {
    format!("series:{}:{series_id}", series_id.len())
}

/// Encodes `timestamp` (millisecond precision) as 8 big-endian bytes whose
/// lexicographic order matches chronological order, including before 1970.
#[must_use]
pub fn encode_timestamp(timestamp: DateTime<Utc>) -> [u8; 8] {
    encode_millis(timestamp.timestamp_millis())
}

/// Inverse of [`encode_timestamp`]. Returns `None` for inputs that are not
/// eight bytes or fall outside chrono's range.
#[must_use]
pub fn decode_timestamp(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    let millis = (u64::from_be_bytes(raw) ^ SIGN_BIT).cast_signed();
    Utc.timestamp_millis_opt(millis).single()
}

pub(crate) fn encode_millis(millis: i64) -> [u8; 8] {
    (millis.cast_unsigned() ^ SIGN_BIT).to_be_bytes()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn record_keys_are_namespaced() {
        assert_eq!(queue_state_key("q"), "queue:q:state");
        assert_eq!(queue_item_key("q", -3), "queue:q:-3");
        assert_eq!(stream_state_key("s"), "stream:s:state");
        assert_eq!(event_key("s", 7), "stream:s:7");
        assert_eq!(series_entry_key("t", "e"), "series:1:t:e");
        assert_eq!(series_index("t"), "series:1:t");
    }

    #[test]
    fn series_keys_separate_colon_ids() {
        assert_ne!(series_entry_key("a", "b:c"), series_entry_key("a:b", "c"));
        assert_ne!(series_index("a:1"), series_index("a"));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(decode_timestamp(&[0; 7]).is_none());
        assert!(decode_timestamp(&[0; 9]).is_none());
    }

    const SPAN: i64 = 8_000_000_000_000;

    proptest! {
        /// Byte order of encoded timestamps must equal numeric order.
        #[test]
        fn encoding_preserves_ordering(a in -SPAN..SPAN, b in -SPAN..SPAN) {
            prop_assert_eq!(a.cmp(&b), encode_millis(a).cmp(&encode_millis(b)));
        }

        /// Decoding an encoded timestamp yields the same instant.
        #[test]
        fn decode_inverts_encode(millis in -SPAN..SPAN) {
            let timestamp = Utc.timestamp_millis_opt(millis).single().expect("in range");
            prop_assert_eq!(decode_timestamp(&encode_timestamp(timestamp)), Some(timestamp));
        }
    }
}
