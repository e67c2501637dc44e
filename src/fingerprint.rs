//! Content fingerprints for weight tensors.
//!
//! A [`Fingerprint`] names one shared segment host-wide. It is derived either
//! from a [`TensorDescriptor`] (model id, variable name, shape, dtype, byte
//! size and a source checksum or offset) or, when hashing the payload is
//! affordable, from the raw tensor bytes.
//!
//! Descriptor fingerprints hash a canonical, length-prefixed encoding of every
//! field under a versioned domain tag, so two processes computing the
//! fingerprint of the same weight from the same model artifact always agree and
//! two different weights never share a name unless SHA-256 collides.
//!
//! # Example
//!
//! ```rust,ignore
//! use tensorshm::fingerprint::{DType, SourceRef, TensorDescriptor};
//!
//! let desc = TensorDescriptor::builder("resnet50", "conv1/kernel")
//!     .shape([7, 7, 3, 64])
//!     .dtype(DType::F32)
//!     .source(SourceRef::Offset(4096))
//!     .build()?;
//!
//! println!("{}", desc.fingerprint());
//! ```

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Domain tag mixed into every descriptor hash.
const DESCRIPTOR_DOMAIN: &[u8] = b"tensorshm/descriptor/v1\0";

/// Domain tag mixed into every content hash.
const CONTENT_DOMAIN: &[u8] = b"tensorshm/content/v1\0";

/// Width of a fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// Fixed-width identifier of a tensor's content.
///
/// Rendered as 64 lowercase hex characters; that rendering is also the file
/// name of the segment and its lock file.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug, PartialEq, Eq, Hash))]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Wrap raw fingerprint bytes.
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Fingerprint the raw bytes of a tensor.
    ///
    /// Use this when the whole payload is already in memory; otherwise prefer
    /// [`TensorDescriptor::fingerprint`].
    pub fn of_content(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(CONTENT_DOMAIN);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Hex rendering used for file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != FINGERPRINT_LEN * 2 {
            return None;
        }
        let mut out = [0u8; FINGERPRINT_LEN];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }

    /// Split into four native-endian words (for storage in atomics).
    pub(crate) fn to_words(self) -> [u64; 4] {
        let mut words = [0u64; 4];
        for (i, chunk) in self.0.chunks_exact(8).enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            words[i] = u64::from_ne_bytes(buf);
        }
        words
    }

    /// Inverse of [`to_words`](Self::to_words).
    pub(crate) fn from_words(words: [u64; 4]) -> Self {
        let mut out = [0u8; FINGERPRINT_LEN];
        for (i, word) in words.iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&word.to_ne_bytes());
        }
        Self(out)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
            .ok_or_else(|| Error::InvalidDescriptor(format!("not a fingerprint: {s:?}")))
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint {s:?}")))
    }
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// IEEE half precision.
    F16,
    /// bfloat16.
    BF16,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// Boolean stored as one byte.
    Bool,
    /// Complex with two f32 components.
    Complex64,
    /// Complex with two f64 components.
    Complex128,
    /// Variable-width strings; byte size must be given explicitly.
    String,
}

impl DType {
    /// Size of one element, or `None` for variable-width types.
    pub const fn size_in_bytes(&self) -> Option<u64> {
        match self {
            DType::I8 | DType::U8 | DType::Bool => Some(1),
            DType::F16 | DType::BF16 | DType::I16 | DType::U16 => Some(2),
            DType::F32 | DType::I32 | DType::U32 => Some(4),
            DType::F64 | DType::I64 | DType::U64 | DType::Complex64 => Some(8),
            DType::Complex128 => Some(16),
            DType::String => None,
        }
    }

    /// Stable name hashed into fingerprints. Never change an existing name.
    pub const fn name(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::Bool => "bool",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
            DType::String => "string",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a tensor's bytes come from inside its model artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceRef {
    /// Byte offset of the tensor inside the model file.
    Offset(u64),
    /// Checksum of the tensor bytes (or of the containing shard).
    Checksum([u8; 32]),
}

impl SourceRef {
    /// Build a checksum reference from the source bytes.
    pub fn checksum_of(bytes: &[u8]) -> Self {
        SourceRef::Checksum(Sha256::digest(bytes).into())
    }
}

/// Validated description of one weight tensor.
///
/// Construct with [`TensorDescriptor::builder`]; construction rejects
/// non-positive sizes, empty or NUL-containing names, and byte sizes that
/// disagree with `shape` × `dtype`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDescriptor {
    model_id: String,
    variable_name: String,
    shape: Vec<u64>,
    dtype: DType,
    byte_size: u64,
    source: SourceRef,
}

impl TensorDescriptor {
    /// Start building a descriptor.
    pub fn builder(model_id: impl Into<String>, variable_name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            model_id: model_id.into(),
            variable_name: variable_name.into(),
            shape: Vec::new(),
            dtype: DType::F32,
            byte_size: None,
            source: SourceRef::Offset(0),
        }
    }

    /// Model (or function) identifier.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Variable name within the model.
    pub fn variable_name(&self) -> &str {
        &self.variable_name
    }

    /// Tensor shape; empty for scalars.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Payload size in bytes (always > 0).
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Source reference.
    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    /// Re-check construction invariants.
    pub fn validate(&self) -> Result<()> {
        validate_name("model id", &self.model_id)?;
        validate_name("variable name", &self.variable_name)?;
        if self.byte_size == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "{}/{}: byte size must be positive",
                self.model_id, self.variable_name
            )));
        }
        if let Some(expected) = expected_size(&self.shape, self.dtype)? {
            if expected != self.byte_size {
                return Err(Error::InvalidDescriptor(format!(
                    "{}/{}: byte size {} does not match shape {:?} of {} ({} bytes)",
                    self.model_id, self.variable_name, self.byte_size, self.shape, self.dtype, expected
                )));
            }
        }
        Ok(())
    }

    /// Fingerprint of this descriptor.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(DESCRIPTOR_DOMAIN);
        put_str(&mut hasher, &self.model_id);
        put_str(&mut hasher, &self.variable_name);
        hasher.update((self.shape.len() as u64).to_le_bytes());
        for dim in &self.shape {
            hasher.update(dim.to_le_bytes());
        }
        put_str(&mut hasher, self.dtype.name());
        hasher.update(self.byte_size.to_le_bytes());
        match &self.source {
            SourceRef::Offset(offset) => {
                hasher.update([0u8]);
                hasher.update(offset.to_le_bytes());
            }
            SourceRef::Checksum(sum) => {
                hasher.update([1u8]);
                hasher.update(sum);
            }
        }
        Fingerprint(hasher.finalize().into())
    }
}

/// Compute the fingerprint of a descriptor, re-validating it first.
///
/// Never substitutes a default fingerprint: a malformed descriptor is an
/// [`Error::InvalidDescriptor`].
pub fn fingerprint(desc: &TensorDescriptor) -> Result<Fingerprint> {
    desc.validate()?;
    Ok(desc.fingerprint())
}

/// Builder for [`TensorDescriptor`].
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    model_id: String,
    variable_name: String,
    shape: Vec<u64>,
    dtype: DType,
    byte_size: Option<u64>,
    source: SourceRef,
}

impl DescriptorBuilder {
    /// Set the shape.
    pub fn shape(mut self, shape: impl IntoIterator<Item = u64>) -> Self {
        self.shape = shape.into_iter().collect();
        self
    }

    /// Set the element type (default `F32`).
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Set the byte size explicitly.
    ///
    /// Required for variable-width dtypes; for fixed-width dtypes it must
    /// match the size implied by the shape.
    pub fn byte_size(mut self, byte_size: u64) -> Self {
        self.byte_size = Some(byte_size);
        self
    }

    /// Set the source reference (default offset 0).
    pub fn source(mut self, source: SourceRef) -> Self {
        self.source = source;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<TensorDescriptor> {
        let implied = expected_size(&self.shape, self.dtype)?;
        let byte_size = match (self.byte_size, implied) {
            (Some(given), _) => given,
            (None, Some(implied)) => implied,
            (None, None) => {
                return Err(Error::InvalidDescriptor(format!(
                    "{}/{}: dtype {} needs an explicit byte size",
                    self.model_id, self.variable_name, self.dtype
                )));
            }
        };

        let desc = TensorDescriptor {
            model_id: self.model_id,
            variable_name: self.variable_name,
            shape: self.shape,
            dtype: self.dtype,
            byte_size,
            source: self.source,
        };
        desc.validate()?;
        Ok(desc)
    }
}

fn validate_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidDescriptor(format!("{what} must not be empty")));
    }
    if value.contains('\0') {
        return Err(Error::InvalidDescriptor(format!("{what} contains NUL: {value:?}")));
    }
    Ok(())
}

/// Size implied by shape and dtype; `None` for variable-width dtypes.
fn expected_size(shape: &[u64], dtype: DType) -> Result<Option<u64>> {
    let Some(elem) = dtype.size_in_bytes() else {
        return Ok(None);
    };
    let mut total = elem;
    for dim in shape {
        total = total
            .checked_mul(*dim)
            .ok_or_else(|| Error::InvalidDescriptor(format!("shape {shape:?} overflows u64")))?;
    }
    Ok(Some(total))
}

fn put_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv1() -> TensorDescriptor {
        TensorDescriptor::builder("resnet50", "conv1/kernel")
            .shape([7, 7, 3, 64])
            .dtype(DType::F32)
            .source(SourceRef::Offset(4096))
            .build()
            .unwrap()
    }

    #[test]
    fn test_same_descriptor_same_fingerprint() {
        assert_eq!(conv1().fingerprint(), conv1().fingerprint());
        assert_eq!(fingerprint(&conv1()).unwrap(), conv1().fingerprint());
    }

    #[test]
    fn test_every_field_changes_fingerprint() {
        let base = conv1().fingerprint();

        let other_model = TensorDescriptor::builder("resnet101", "conv1/kernel")
            .shape([7, 7, 3, 64])
            .source(SourceRef::Offset(4096))
            .build()
            .unwrap();
        let other_var = TensorDescriptor::builder("resnet50", "conv2/kernel")
            .shape([7, 7, 3, 64])
            .source(SourceRef::Offset(4096))
            .build()
            .unwrap();
        let other_shape = TensorDescriptor::builder("resnet50", "conv1/kernel")
            .shape([7, 7, 64, 3])
            .source(SourceRef::Offset(4096))
            .build()
            .unwrap();
        let other_dtype = TensorDescriptor::builder("resnet50", "conv1/kernel")
            .shape([7, 7, 3, 128])
            .dtype(DType::F16)
            .source(SourceRef::Offset(4096))
            .build()
            .unwrap();
        let other_offset = TensorDescriptor::builder("resnet50", "conv1/kernel")
            .shape([7, 7, 3, 64])
            .source(SourceRef::Offset(8192))
            .build()
            .unwrap();

        for desc in [other_model, other_var, other_shape, other_dtype, other_offset] {
            assert_ne!(desc.fingerprint(), base, "{desc:?}");
        }
    }

    #[test]
    fn test_name_boundaries_are_unambiguous() {
        let a = TensorDescriptor::builder("ab", "c").shape([4]).build().unwrap();
        let b = TensorDescriptor::builder("a", "bc").shape([4]).build().unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_byte_size_derived_from_shape() {
        let desc = conv1();
        assert_eq!(desc.byte_size(), 7 * 7 * 3 * 64 * 4);
    }

    #[test]
    fn test_scalar_shape() {
        let desc = TensorDescriptor::builder("m", "global_step")
            .dtype(DType::I64)
            .build()
            .unwrap();
        assert_eq!(desc.byte_size(), 8);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let err = TensorDescriptor::builder("m", "v").shape([0, 3]).build().unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let err = TensorDescriptor::builder("m", "v")
            .shape([4])
            .dtype(DType::F32)
            .byte_size(15)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_string_dtype_needs_explicit_size() {
        let err = TensorDescriptor::builder("m", "vocab")
            .shape([100])
            .dtype(DType::String)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));

        let desc = TensorDescriptor::builder("m", "vocab")
            .shape([100])
            .dtype(DType::String)
            .byte_size(4321)
            .build()
            .unwrap();
        assert_eq!(desc.byte_size(), 4321);
    }

    #[test]
    fn test_empty_and_nul_names_rejected() {
        assert!(TensorDescriptor::builder("", "v").shape([1]).build().is_err());
        assert!(TensorDescriptor::builder("m", "").shape([1]).build().is_err());
        assert!(TensorDescriptor::builder("m", "v\0x").shape([1]).build().is_err());
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        let err = TensorDescriptor::builder("m", "v")
            .shape([u64::MAX, 2])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_hex_roundtrip_and_words() {
        let fp = conv1().fingerprint();
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
        assert_eq!(hex.parse::<Fingerprint>().unwrap(), fp);
        assert_eq!(Fingerprint::from_words(fp.to_words()), fp);
        assert!(Fingerprint::from_hex("zz").is_none());
        assert!(Fingerprint::from_hex(&"g".repeat(64)).is_none());
    }

    #[test]
    fn test_content_fingerprint() {
        let a = Fingerprint::of_content(b"weights");
        assert_eq!(a, Fingerprint::of_content(b"weights"));
        assert_ne!(a, Fingerprint::of_content(b"weightz"));
    }

    #[test]
    fn test_checksum_source() {
        let a = SourceRef::checksum_of(b"shard-0");
        let b = SourceRef::checksum_of(b"shard-1");
        assert_ne!(a, b);
        let d1 = TensorDescriptor::builder("m", "v").shape([2]).source(a).build().unwrap();
        let d2 = TensorDescriptor::builder("m", "v").shape([2]).source(b).build().unwrap();
        assert_ne!(d1.fingerprint(), d2.fingerprint());
    }

    #[test]
    fn test_serde_as_hex() {
        let fp = conv1().fingerprint();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
