//! # Wire Codec
//!
//! Protocol bodies are streams of sequentially encoded values (tags,
//! counters, key-id vectors). `Writer` and `Reader` wrap bincode so call
//! sites read exactly like the exchanges they implement:
//!
//! ```
//! use shared_types::wire::{Reader, Writer};
//!
//! let mut w = Writer::new();
//! w.write(&"LOAD-REQ".to_string()).unwrap();
//! w.write(&4096u64).unwrap();
//!
//! let bytes = w.into_bytes();
//! let mut r = Reader::new(&bytes);
//! r.expect_tag("LOAD-REQ").unwrap();
//! assert_eq!(r.read::<u64>().unwrap(), 4096);
//! ```

use crate::errors::WireError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

/// Sequential value writer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value.
    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), WireError> {
        bincode::serialize_into(&mut self.buf, value)
            .map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential value reader over a borrowed byte slice.
pub struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    /// Read the next value.
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        bincode::deserialize_from(&mut self.cursor).map_err(|e| WireError::Decode(e.to_string()))
    }

    /// Read a string and require it to equal `expected`.
    pub fn expect_tag(&mut self, expected: &str) -> Result<(), WireError> {
        let found: String = self.read()?;
        if found != expected {
            return Err(WireError::Tag {
                expected: expected.to_string(),
                found,
            });
        }
        Ok(())
    }

    /// Octets not yet consumed.
    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyVec;

    #[test]
    fn test_roundtrip_mixed_values() {
        let mut w = Writer::new();
        w.write(&true).unwrap();
        w.write(&"OUTGOING".to_string()).unwrap();
        w.write(&vec![7u64, 8, 9]).unwrap();
        w.write(&42u32).unwrap();

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(r.read::<bool>().unwrap());
        r.expect_tag("OUTGOING").unwrap();
        assert_eq!(r.read::<KeyVec>().unwrap(), vec![7, 8, 9]);
        assert_eq!(r.read::<u32>().unwrap(), 42);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_tag_mismatch() {
        let mut w = Writer::new();
        w.write(&"LOAD".to_string()).unwrap();
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert!(matches!(
            r.expect_tag("STORE"),
            Err(WireError::Tag { .. })
        ));
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut w = Writer::new();
        w.write(&1234u64).unwrap();
        let mut bytes = w.into_bytes();
        bytes.truncate(3);

        let mut r = Reader::new(&bytes);
        assert!(r.read::<u64>().is_err());
    }
}
