//! On-wire payload handling: optional deflate compression and the integrity
//! digest storages and clients verify on every read.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use sha1::{Digest, Sha1};

use neo_errors::{NeoError, NeoResult};

/// Wire flag: payload is raw.
pub const COMPRESSION_NONE: u8 = 0;
/// Wire flag: payload is deflate at the default level.
pub const COMPRESSION_DEFLATE: u8 = 1;

/// Compress `data` when enabled and worthwhile. Compression is skipped when
/// it does not shrink the payload.
pub fn pack(data: &[u8], compress: bool) -> (u8, Bytes) {
    if compress && !data.is_empty() {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::default());
        let compressed = encoder
            .write_all(data)
            .and_then(|()| encoder.finish())
            .ok();
        if let Some(compressed) = compressed {
            if compressed.len() < data.len() {
                return (COMPRESSION_DEFLATE, Bytes::from(compressed));
            }
        }
    }
    (COMPRESSION_NONE, Bytes::copy_from_slice(data))
}

/// Undo [`pack`] according to the wire flag.
pub fn unpack(compression: u8, data: Bytes) -> NeoResult<Bytes> {
    match compression {
        COMPRESSION_NONE => Ok(data),
        COMPRESSION_DEFLATE => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder
                .write_all(&data)
                .and_then(|()| decoder.finish())
                .map(Bytes::from)
                .map_err(|e| NeoError::Protocol(format!("bad deflate payload: {e}")))
        }
        other => Err(NeoError::Protocol(format!("unknown compression flag {other}"))),
    }
}

/// Integrity digest over the payload bytes as they travel.
pub fn digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_data_round_trips_compressed() {
        let data = vec![42u8; 4096];
        let (flag, packed) = pack(&data, true);
        assert_eq!(flag, COMPRESSION_DEFLATE);
        assert!(packed.len() < data.len());
        assert_eq!(unpack(flag, packed).unwrap(), Bytes::from(data));
    }

    #[test]
    fn incompressible_data_stays_raw() {
        let data: Vec<u8> = (0..64).map(|_| rand::random()).collect();
        let (flag, packed) = pack(&data, true);
        assert_eq!(flag, COMPRESSION_NONE);
        assert_eq!(&packed[..], &data[..]);
    }

    #[test]
    fn compression_disabled_stays_raw() {
        let (flag, packed) = pack(b"aaaaaaaaaaaaaaaaaaaaaaaa", false);
        assert_eq!(flag, COMPRESSION_NONE);
        assert_eq!(&packed[..], b"aaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn digest_changes_with_content() {
        assert_ne!(digest(b"a"), digest(b"b"));
        assert_eq!(digest(b"a"), digest(b"a"));
    }

    #[test]
    fn unknown_flag_is_a_protocol_error() {
        assert!(unpack(9, Bytes::new()).is_err());
    }
}
