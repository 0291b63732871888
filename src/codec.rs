use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use thiserror::Error;

/// Error type for versioned codec operations
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Data is too short to contain a version header
    #[error("data too short to contain version header")]
    TooShort,
    /// Version byte doesn't match expected version
    #[error("unsupported version for {type_name}: expected {expected}, found {found}")]
    UnsupportedVersion {
        type_name: &'static str,
        expected: u8,
        found: u8,
    },
    /// Underlying rkyv serialization/validation error
    #[error("rkyv error: {0}")]
    Rkyv(String),
}

/// A record stored durably as a versioned rkyv archive.
///
/// When evolving a schema, bump `VERSION` and add migration logic in the decode path.
pub trait Versioned: Archive {
    const VERSION: u8;
}

/// Size of the version header - just a single byte.
/// Alignment is handled at decode time by copying into an AlignedVec.
const VERSION_HEADER_SIZE: usize = 1;

#[inline]
fn prepend_version(version: u8, data: AlignedVec) -> Vec<u8> {
    let mut result = Vec::with_capacity(VERSION_HEADER_SIZE + data.len());
    result.push(version);
    result.extend_from_slice(&data);
    result
}

#[inline]
fn strip_version<T>(expected: u8, data: &[u8]) -> Result<AlignedVec, CodecError> {
    let Some((&found, rest)) = data.split_first() else {
        return Err(CodecError::TooShort);
    };
    if found != expected {
        return Err(CodecError::UnsupportedVersion {
            type_name: std::any::type_name::<T>(),
            expected,
            found,
        });
    }
    let mut aligned = AlignedVec::with_capacity(rest.len());
    aligned.extend_from_slice(rest);
    Ok(aligned)
}

pub fn encode<T>(value: &T) -> Result<Vec<u8>, CodecError>
where
    T: Versioned + RkyvSerialize<AllocSerializer<256>>,
{
    let data = rkyv::to_bytes::<T, 256>(value).map_err(|e| CodecError::Rkyv(e.to_string()))?;
    Ok(prepend_version(T::VERSION, data))
}

pub fn decode<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: Versioned,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + RkyvDeserialize<T, rkyv::Infallible>,
{
    let data = strip_version::<T>(T::VERSION, bytes)?;
    let archived = rkyv::check_archived_root::<T>(&data).map_err(|_| {
        CodecError::Rkyv(format!("invalid archive for {}", std::any::type_name::<T>()))
    })?;
    let mut des = rkyv::Infallible;
    Ok(RkyvDeserialize::deserialize(archived, &mut des)
        .unwrap_or_else(|_| unreachable!("infallible deserialization")))
}

/// Anything that can round-trip through `encode`/`decode`. Blanket-implemented so
/// generic store code does not have to restate the rkyv bounds.
pub trait Stored: Versioned + Sized {
    fn to_stored(&self) -> Result<Vec<u8>, CodecError>;
    fn from_stored(bytes: &[u8]) -> Result<Self, CodecError>;
}

impl<T> Stored for T
where
    T: Versioned + RkyvSerialize<AllocSerializer<256>>,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + RkyvDeserialize<T, rkyv::Infallible>,
{
    fn to_stored(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    fn from_stored(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
    #[archive(check_bytes)]
    struct Sample {
        id: String,
        n: i64,
        tags: Vec<String>,
    }

    impl Versioned for Sample {
        const VERSION: u8 = 3;
    }

    fn sample() -> Sample {
        Sample {
            id: "abc".to_string(),
            n: -42,
            tags: vec!["x".to_string()],
        }
    }

    #[test]
    fn encoded_value_carries_version_byte() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(bytes[0], 3);
        assert_eq!(decode::<Sample>(&bytes).unwrap(), sample());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = 9;
        match decode::<Sample>(&bytes) {
            Err(CodecError::UnsupportedVersion {
                expected, found, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(found, 9);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(matches!(decode::<Sample>(&[]), Err(CodecError::TooShort)));
        assert!(matches!(
            decode::<Sample>(&[3, 1, 2]),
            Err(CodecError::Rkyv(_))
        ));
    }
}
