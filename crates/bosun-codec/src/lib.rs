//! Base64 helpers shared by the durable queue and the files manager.
//!
//! Plan payloads and signatures travel base64-encoded inside the on-disk
//! queue records; inline file bodies may be base64-encoded in the plan
//! itself. Both sides of the codec accept text or raw bytes and use the
//! standard RFC 4648 alphabet with padding.

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Base64-encode text or bytes to a string.
pub fn b64encode(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(data.as_ref())
}

/// Base64-decode text or bytes to raw bytes.
pub fn b64decode_bytes(data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.as_ref())
        .context("invalid base64 payload")
}

/// Base64-decode text or bytes to UTF-8 text.
pub fn b64decode(data: impl AsRef<[u8]>) -> Result<String> {
    let bytes = b64decode_bytes(data)?;
    String::from_utf8(bytes).context("decoded payload is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_text() {
        assert_eq!(b64encode("hello"), "aGVsbG8=");
    }

    #[test]
    fn encode_bytes() {
        assert_eq!(b64encode(b"hello".as_slice()), "aGVsbG8=");
    }

    #[test]
    fn decode_to_text() {
        assert_eq!(b64decode("aGVsbG8=").expect("decode"), "hello");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(b64decode("not base64!!!").is_err());
    }

    #[test]
    fn decode_rejects_non_utf8() {
        let encoded = b64encode([0xff_u8, 0xfe, 0xfd]);
        assert!(b64decode(&encoded).is_err());
        assert_eq!(
            b64decode_bytes(&encoded).expect("decode"),
            vec![0xff, 0xfe, 0xfd]
        );
    }

    proptest! {
        #[test]
        fn roundtrip_strings(s in ".*") {
            prop_assert_eq!(b64decode(b64encode(&s)).unwrap(), s);
        }

        #[test]
        fn roundtrip_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(b64decode_bytes(b64encode(&bytes)).unwrap(), bytes);
        }
    }
}
