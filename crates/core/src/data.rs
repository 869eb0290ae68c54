//! `RuntimeData` (C1): the typed data unit exchanged between nodes, and its
//! bit-exact on-channel wire format (C3).
//!
//! Every variant carries a `session_id` and a monotonic-nanoseconds
//! `timestamp`. The wire layout is little-endian throughout:
//!
//! ```text
//! u8 tag | u16 len + utf8 session_id | i64 ns timestamp | u32 plen | payload
//! ```

use bitflags::bitflags;

use crate::error::Error;

bitflags! {
    /// On-wire contiguity flags for a [`NumpyPayload`], packed into the one
    /// byte following the strides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ContiguityFlags: u8 {
        const C_CONTIGUOUS = 0b01;
        const F_CONTIGUOUS = 0b10;
    }
}

/// Numpy element dtype, encoded on the wire as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F64,
    I16,
    I32,
    U8,
}

impl DType {
    fn code(self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::I16 => 2,
            DType::I32 => 3,
            DType::U8 => 4,
        }
    }

    fn from_code(code: u8) -> crate::Result<Self> {
        Ok(match code {
            0 => DType::F32,
            1 => DType::F64,
            2 => DType::I16,
            3 => DType::I32,
            4 => DType::U8,
            other => return Err(Error::type_mismatch(format!("unknown numpy dtype code {other}"))),
        })
    }
}

/// Audio sample layout, encoded on the wire as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    F32Interleaved,
    I16Interleaved,
}

impl AudioFormat {
    fn code(self) -> u8 {
        match self {
            AudioFormat::F32Interleaved => 0,
            AudioFormat::I16Interleaved => 1,
        }
    }

    fn from_code(code: u8) -> crate::Result<Self> {
        Ok(match code {
            0 => AudioFormat::F32Interleaved,
            1 => AudioFormat::I16Interleaved,
            other => return Err(Error::type_mismatch(format!("unknown audio format code {other}"))),
        })
    }
}

/// A numpy-like tensor payload, preserving shape/strides/contiguity across
/// the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct NumpyPayload {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub strides: Vec<i64>,
    pub c_contiguous: bool,
    pub f_contiguous: bool,
    pub data: Vec<u8>,
}

/// A PCM audio payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: AudioFormat,
    pub num_samples: u64,
    pub samples: Vec<u8>,
}

/// The tagged union exchanged between nodes. `Video` is reserved per spec
/// §3 and is not required to round-trip by the core test suite, but it
/// still occupies wire tag 2 so future payloads don't collide.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeDataKind {
    Audio(AudioPayload),
    Video(Vec<u8>),
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
    Numpy(NumpyPayload),
}

/// `RuntimeData`: a `RuntimeDataKind` plus the envelope every variant
/// carries (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeData {
    pub session_id: String,
    pub timestamp: i64,
    pub kind: RuntimeDataKind,
}

macro_rules! accessor {
    ($is_name:ident, $as_name:ident, $variant:ident, $ty:ty) => {
        /// Returns true if this value holds the
        #[doc = concat!("`", stringify!($variant), "`")]
        /// variant.
        pub fn $is_name(&self) -> bool {
            matches!(self.kind, RuntimeDataKind::$variant(_))
        }

        /// Borrow the payload, failing with `ErrorKind::TypeMismatch` if the
        /// variant doesn't match.
        pub fn $as_name(&self) -> crate::Result<&$ty> {
            match &self.kind {
                RuntimeDataKind::$variant(v) => Ok(v),
                other => Err(Error::type_mismatch(format!(
                    "expected {}, found {:?}",
                    stringify!($variant),
                    std::mem::discriminant(other)
                ))),
            }
        }
    };
}

impl RuntimeData {
    /// Construct a `Text` value.
    pub fn text(session_id: impl Into<String>, timestamp: i64, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            kind: RuntimeDataKind::Text(text.into()),
        }
    }

    /// Construct a `Binary` value.
    pub fn binary(session_id: impl Into<String>, timestamp: i64, data: Vec<u8>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            kind: RuntimeDataKind::Binary(data),
        }
    }

    /// Construct a `Json` value.
    pub fn json(session_id: impl Into<String>, timestamp: i64, value: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            kind: RuntimeDataKind::Json(value),
        }
    }

    /// Construct a `Numpy` value.
    pub fn numpy(session_id: impl Into<String>, timestamp: i64, payload: NumpyPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            kind: RuntimeDataKind::Numpy(payload),
        }
    }

    /// Construct an `Audio` value.
    pub fn audio(session_id: impl Into<String>, timestamp: i64, payload: AudioPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            kind: RuntimeDataKind::Audio(payload),
        }
    }

    accessor!(is_text, as_text, Text, String);
    accessor!(is_binary, as_binary, Binary, Vec<u8>);
    accessor!(is_json, as_json, Json, serde_json::Value);
    accessor!(is_numpy, as_numpy, Numpy, NumpyPayload);
    accessor!(is_audio, as_audio, Audio, AudioPayload);

    fn tag(&self) -> u8 {
        match &self.kind {
            RuntimeDataKind::Audio(_) => 1,
            RuntimeDataKind::Video(_) => 2,
            RuntimeDataKind::Text(_) => 3,
            RuntimeDataKind::Binary(_) => 4,
            RuntimeDataKind::Json(_) => 5,
            RuntimeDataKind::Numpy(_) => 6,
        }
    }

    /// Serialize to the bit-exact on-channel frame (spec §4.1).
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        let session_bytes = self.session_id.as_bytes();
        if session_bytes.len() > u16::MAX as usize {
            return Err(Error::validation("session_id exceeds u16 length"));
        }
        if payload.len() > u32::MAX as usize {
            return Err(Error::validation("payload exceeds u32 length"));
        }

        let mut out = Vec::with_capacity(1 + 2 + session_bytes.len() + 8 + 4 + payload.len());
        out.push(self.tag());
        out.extend_from_slice(&(session_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(session_bytes);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse a frame produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor.u8()?;
        let session_len = cursor.u16()? as usize;
        let session_id = String::from_utf8(cursor.bytes(session_len)?.to_vec())
            .map_err(|e| Error::validation(format!("invalid utf8 session_id: {e}")))?;
        let timestamp = cursor.i64()?;
        let plen = cursor.u32()? as usize;
        let payload = cursor.bytes(plen)?;

        let kind = match tag {
            1 => RuntimeDataKind::Audio(decode_audio(payload)?),
            2 => RuntimeDataKind::Video(payload.to_vec()),
            3 => RuntimeDataKind::Text(
                String::from_utf8(payload.to_vec())
                    .map_err(|e| Error::validation(format!("invalid utf8 text payload: {e}")))?,
            ),
            4 => RuntimeDataKind::Binary(payload.to_vec()),
            5 => RuntimeDataKind::Json(
                serde_json::from_slice(payload)
                    .map_err(|e| Error::validation(format!("invalid json payload: {e}")))?,
            ),
            6 => RuntimeDataKind::Numpy(decode_numpy(payload)?),
            other => return Err(Error::validation(format!("unknown wire tag {other}"))),
        };

        Ok(Self {
            session_id,
            timestamp,
            kind,
        })
    }

    fn encode_payload(&self) -> crate::Result<Vec<u8>> {
        Ok(match &self.kind {
            RuntimeDataKind::Text(s) => s.as_bytes().to_vec(),
            RuntimeDataKind::Binary(b) => b.clone(),
            RuntimeDataKind::Video(b) => b.clone(),
            RuntimeDataKind::Json(v) => serde_json::to_vec(v)
                .map_err(|e| Error::validation(format!("failed to encode json: {e}")))?,
            RuntimeDataKind::Numpy(n) => encode_numpy(n)?,
            RuntimeDataKind::Audio(a) => encode_audio(a),
        })
    }
}

fn encode_numpy(n: &NumpyPayload) -> crate::Result<Vec<u8>> {
    if n.shape.len() != n.strides.len() {
        return Err(Error::validation("numpy shape/strides length mismatch"));
    }
    if n.shape.len() > u8::MAX as usize {
        return Err(Error::validation("numpy ndim exceeds u8"));
    }
    let mut out = Vec::new();
    out.push(n.dtype.code());
    out.push(n.shape.len() as u8);
    for d in &n.shape {
        out.extend_from_slice(&d.to_le_bytes());
    }
    for s in &n.strides {
        out.extend_from_slice(&s.to_le_bytes());
    }
    let mut flags = ContiguityFlags::empty();
    flags.set(ContiguityFlags::C_CONTIGUOUS, n.c_contiguous);
    flags.set(ContiguityFlags::F_CONTIGUOUS, n.f_contiguous);
    out.push(flags.bits());
    out.extend_from_slice(&(n.data.len() as u32).to_le_bytes());
    out.extend_from_slice(&n.data);
    Ok(out)
}

fn decode_numpy(bytes: &[u8]) -> crate::Result<NumpyPayload> {
    let mut cursor = Cursor::new(bytes);
    let dtype = DType::from_code(cursor.u8()?)?;
    let ndim = cursor.u8()? as usize;
    let mut shape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        shape.push(cursor.u64()?);
    }
    let mut strides = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        strides.push(cursor.i64()?);
    }
    let flags = ContiguityFlags::from_bits_truncate(cursor.u8()?);
    let data_len = cursor.u32()? as usize;
    let data = cursor.bytes(data_len)?.to_vec();
    Ok(NumpyPayload {
        dtype,
        shape,
        strides,
        c_contiguous: flags.contains(ContiguityFlags::C_CONTIGUOUS),
        f_contiguous: flags.contains(ContiguityFlags::F_CONTIGUOUS),
        data,
    })
}

fn encode_audio(a: &AudioPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 + 1 + 8 + 4 + a.samples.len());
    out.extend_from_slice(&a.sample_rate.to_le_bytes());
    out.extend_from_slice(&a.channels.to_le_bytes());
    out.push(a.format.code());
    out.extend_from_slice(&a.num_samples.to_le_bytes());
    out.extend_from_slice(&(a.samples.len() as u32).to_le_bytes());
    out.extend_from_slice(&a.samples);
    out
}

fn decode_audio(bytes: &[u8]) -> crate::Result<AudioPayload> {
    let mut cursor = Cursor::new(bytes);
    let sample_rate = cursor.u32()?;
    let channels = cursor.u16()?;
    let format = AudioFormat::from_code(cursor.u8()?)?;
    let num_samples = cursor.u64()?;
    let data_len = cursor.u32()? as usize;
    let samples = cursor.bytes(data_len)?.to_vec();
    Ok(AudioPayload {
        sample_rate,
        channels,
        format,
        num_samples,
        samples,
    })
}

/// Minimal little-endian byte-slice cursor used by the frame codec. Kept
/// deliberately tiny rather than pulling in a binary-parsing crate: the
/// frame layout is small and fixed.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> crate::Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::validation("truncated frame"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> crate::Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> crate::Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> crate::Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> crate::Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> crate::Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        let v = RuntimeData::text("sess-1", 42, "hello");
        let bytes = v.to_bytes().unwrap();
        let back = RuntimeData::from_bytes(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn binary_roundtrip() {
        let v = RuntimeData::binary("s", 1, vec![1, 2, 3, 255]);
        let back = RuntimeData::from_bytes(&v.to_bytes().unwrap()).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn json_roundtrip() {
        let v = RuntimeData::json("s", 1, serde_json::json!({"a": 1, "b": [1,2,3]}));
        let back = RuntimeData::from_bytes(&v.to_bytes().unwrap()).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn numpy_roundtrip_preserves_shape_dtype_strides_contiguity() {
        let payload = NumpyPayload {
            dtype: DType::F32,
            shape: vec![2, 3],
            strides: vec![12, 4],
            c_contiguous: true,
            f_contiguous: false,
            data: vec![0u8; 24],
        };
        let v = RuntimeData::numpy("s", 7, payload.clone());
        let back = RuntimeData::from_bytes(&v.to_bytes().unwrap()).unwrap();
        assert_eq!(back.as_numpy().unwrap(), &payload);
    }

    #[test]
    fn numpy_fortran_order_roundtrip() {
        let payload = NumpyPayload {
            dtype: DType::I32,
            shape: vec![4],
            strides: vec![4],
            c_contiguous: true,
            f_contiguous: true,
            data: vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0],
        };
        let v = RuntimeData::numpy("s", 0, payload.clone());
        let back = RuntimeData::from_bytes(&v.to_bytes().unwrap()).unwrap();
        assert_eq!(back.as_numpy().unwrap(), &payload);
    }

    #[test]
    fn audio_roundtrip_preserves_metadata() {
        let payload = AudioPayload {
            sample_rate: 16000,
            channels: 1,
            format: AudioFormat::F32Interleaved,
            num_samples: 3,
            samples: vec![0, 0, 128, 63, 0, 0, 0, 64, 0, 0, 64, 64],
        };
        let v = RuntimeData::audio("sess", 99, payload.clone());
        let back = RuntimeData::from_bytes(&v.to_bytes().unwrap()).unwrap();
        assert_eq!(back.as_audio().unwrap(), &payload);
    }

    #[test]
    fn wrong_variant_access_is_type_mismatch() {
        let v = RuntimeData::text("s", 0, "x");
        let err = v.as_audio().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::TypeMismatch);
    }

    #[test]
    fn tag_values_match_spec() {
        assert_eq!(RuntimeData::text("s", 0, "x").tag(), 3);
        assert_eq!(RuntimeData::binary("s", 0, vec![]).tag(), 4);
        assert_eq!(RuntimeData::json("s", 0, serde_json::json!(null)).tag(), 5);
        assert_eq!(
            RuntimeData::numpy(
                "s",
                0,
                NumpyPayload {
                    dtype: DType::U8,
                    shape: vec![],
                    strides: vec![],
                    c_contiguous: true,
                    f_contiguous: true,
                    data: vec![],
                }
            )
            .tag(),
            6
        );
    }

    /// Builds a real WAV file on disk with `hound`, reads the PCM samples
    /// back out, and checks they survive an `AudioPayload` round trip
    /// unchanged -- catches any bug that only shows up with samples that
    /// didn't originate from `AudioPayload` construction in the first place.
    #[test]
    fn audio_roundtrip_matches_wav_decoded_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        {
            let mut writer = hound::WavWriter::create(&path, spec).unwrap();
            for sample in [0i16, 1000, -1000, i16::MAX, i16::MIN] {
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }

        let mut reader = hound::WavReader::open(&path).unwrap();
        let wav_spec = reader.spec();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();

        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in &samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        let payload = AudioPayload {
            sample_rate: wav_spec.sample_rate,
            channels: wav_spec.channels as u16,
            format: AudioFormat::I16Interleaved,
            num_samples: samples.len() as u64,
            samples: bytes,
        };
        let v = RuntimeData::audio("wav-fixture", 0, payload.clone());
        let back = RuntimeData::from_bytes(&v.to_bytes().unwrap()).unwrap();
        assert_eq!(back.as_audio().unwrap(), &payload);
    }
}
