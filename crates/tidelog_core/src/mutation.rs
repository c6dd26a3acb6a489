//! The logged unit of work and its serialized form.
//!
//! The commit log treats a mutation as opaque bytes tagged with the table it
//! targets. The serialized form carries a version byte so readers can reject
//! payloads written by an incompatible format.
//!
//! ```text
//! | version (1) | table_id (4) | key_len (4) | key (K) | value_len (4) | value (V) |
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::TableId;

/// Current mutation serialization version.
pub const MUTATION_VERSION: u8 = 1;

/// Fixed bytes around key and value: version, table id, two lengths.
const FIXED_SIZE: usize = 1 + 4 + 4 + 4;

/// A single mutation to be made durable before it is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mutation {
    table_id: TableId,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Mutation {
    /// Creates a mutation for `table_id`.
    pub fn new(table_id: TableId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            table_id,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns the table this mutation targets.
    #[must_use]
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Returns the key.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Returns the value.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Returns the size of the serialized mutation in bytes.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        FIXED_SIZE + self.key.len() + self.value.len()
    }

    /// Serializes the mutation, appending to `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value is longer than `u32::MAX` bytes.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        let key_len = u32::try_from(self.key.len())
            .map_err(|_| CoreError::write("mutation key longer than u32::MAX bytes"))?;
        let value_len = u32::try_from(self.value.len())
            .map_err(|_| CoreError::write("mutation value longer than u32::MAX bytes"))?;

        buf.reserve(self.serialized_size());
        buf.push(MUTATION_VERSION);
        buf.extend_from_slice(&self.table_id.as_u32().to_le_bytes());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&value_len.to_le_bytes());
        buf.extend_from_slice(&self.value);
        Ok(())
    }

    /// Serializes the mutation into a new buffer.
    ///
    /// # Errors
    ///
    /// See [`encode_into`](Self::encode_into).
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Deserializes a mutation, rejecting unknown versions and trailing bytes.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        let mut cursor = 0usize;

        let read_u32 = |cursor: &mut usize| -> CoreResult<u32> {
            let bytes: [u8; 4] = payload
                .get(*cursor..*cursor + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| CoreError::invalid_format("unexpected end of mutation"))?;
            *cursor += 4;
            Ok(u32::from_le_bytes(bytes))
        };

        let read_bytes = |cursor: &mut usize, len: usize| -> CoreResult<Vec<u8>> {
            let end = cursor
                .checked_add(len)
                .filter(|end| *end <= payload.len())
                .ok_or_else(|| CoreError::invalid_format("mutation field overruns payload"))?;
            let bytes = payload[*cursor..end].to_vec();
            *cursor = end;
            Ok(bytes)
        };

        let version = *payload
            .first()
            .ok_or_else(|| CoreError::invalid_format("empty mutation payload"))?;
        if version != MUTATION_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported mutation version {version}"
            )));
        }
        cursor += 1;

        let table_id = TableId::new(read_u32(&mut cursor)?);
        let key_len = read_u32(&mut cursor)? as usize;
        let key = read_bytes(&mut cursor, key_len)?;
        let value_len = read_u32(&mut cursor)? as usize;
        let value = read_bytes(&mut cursor, value_len)?;

        if cursor != payload.len() {
            return Err(CoreError::invalid_format(format!(
                "trailing bytes in mutation: expected {cursor} bytes, got {}",
                payload.len()
            )));
        }

        Ok(Self {
            table_id,
            key,
            value,
        })
    }
}
