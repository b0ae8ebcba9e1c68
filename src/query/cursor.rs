//! Opaque pagination cursor.
//!
//! Encodes the next bucket offset together with a fingerprint of the query
//! shape, so a cursor replayed against a different query is rejected instead
//! of silently returning unrelated buckets.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::TimeDelta;

use super::QueryRequest;
use crate::error::{CoreError, CoreResult};

// ---

const VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Offset of the next bucket in result order.
    pub offset: u64,
    pub fingerprint: u64,
}

impl Cursor {
    // ---
    pub fn encode(&self) -> String {
        let raw = format!("{VERSION}.{}.{:016x}", self.offset, self.fingerprint);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a cursor and check it belongs to the query with `fingerprint`.
    pub fn decode(raw: &str, fingerprint: u64) -> CoreResult<Self> {
        // ---
        let invalid = || CoreError::invalid_query("malformed cursor");

        let bytes = URL_SAFE_NO_PAD.decode(raw.trim()).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;

        let mut parts = text.split('.');
        let (Some(VERSION), Some(offset), Some(fp), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let cursor = Cursor {
            offset: offset.parse().map_err(|_| invalid())?,
            fingerprint: u64::from_str_radix(fp, 16).map_err(|_| invalid())?,
        };
        if cursor.fingerprint != fingerprint {
            return Err(CoreError::invalid_query(
                "cursor does not belong to this query",
            ));
        }
        Ok(cursor)
    }

    /// Stable FNV-1a hash of everything that determines the bucket sequence.
    pub(crate) fn fingerprint(
        stations: &[String],
        fields: &[String],
        request: &QueryRequest,
        interval: TimeDelta,
    ) -> u64 {
        // ---
        let mut h = Fnv::new();
        for s in stations {
            h.write(s.as_bytes());
            h.write(&[0]);
        }
        h.write(&[1]);
        for f in fields {
            h.write(f.as_bytes());
            h.write(&[0]);
        }
        h.write(&request.range.start.timestamp_micros().to_le_bytes());
        h.write(&request.range.end.timestamp_micros().to_le_bytes());
        h.write(&interval.num_seconds().to_le_bytes());
        h.write(&interval.subsec_nanos().to_le_bytes());
        h.write(request.aggregation.as_str().as_bytes());
        h.write(&[request.sort as u8]);
        h.finish()
    }
}

struct Fnv(u64);

impl Fnv {
    fn new() -> Self {
        Fnv(0xcbf2_9ce4_8422_2325)
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}
