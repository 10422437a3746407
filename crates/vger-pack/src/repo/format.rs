use crate::crypto::CryptoEngine;
use crate::error::{PackError, Result};

/// Object type tags for the repo envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    ChunkIndex = 4,
    PackHeader = 5,
}

impl ObjectType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            4 => Ok(Self::ChunkIndex),
            5 => Ok(Self::PackHeader),
            _ => Err(PackError::UnknownObjectType(v)),
        }
    }
}

/// Serialize a typed payload into an encrypted repo object.
///
/// Wire format: `[1-byte type_tag][encrypted payload]`. The type tag is
/// passed as AAD so it cannot be swapped without failing authentication.
pub fn pack_object(
    obj_type: ObjectType,
    plaintext: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let tag = obj_type as u8;
    let encrypted = crypto.encrypt(plaintext, &[tag])?;

    let mut out = Vec::with_capacity(1 + encrypted.len());
    out.push(tag);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Decrypt a repo object, requiring it to carry `expected` as its type tag.
pub fn unpack_object_expect(
    data: &[u8],
    expected: ObjectType,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let (&tag, payload) = data
        .split_first()
        .ok_or_else(|| PackError::InvalidFormat("empty object".into()))?;
    let obj_type = ObjectType::from_u8(tag)?;
    if obj_type != expected {
        return Err(PackError::InvalidFormat(format!(
            "expected {expected:?} object, found {obj_type:?}"
        )));
    }
    crypto.decrypt(payload, &[tag])
}
