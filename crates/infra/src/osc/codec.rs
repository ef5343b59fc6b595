//! OSC 1.0 packet encoding and decoding
//!
//! Only the argument types the bridge uses are supported:
//! - `i` int32 and `f` float32, big-endian
//! - `s` strings, NUL-terminated and padded to 4 bytes
//! - `T` / `F` booleans and `N` nil, which carry no payload
//!
//! Bundles are flattened on decode; time tags are ignored.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OscError>;

const BUNDLE_TAG: &[u8] = b"#bundle\0";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OscError {
    #[error("Packet truncated at byte {0}")]
    Truncated(usize),

    #[error("Invalid string at byte {0}")]
    InvalidString(usize),

    #[error("Address must start with '/': {0:?}")]
    InvalidAddress(String),

    #[error("Missing type tag string")]
    MissingTypeTags,

    #[error("Unsupported type tag {0:?}")]
    UnsupportedTag(char),

    #[error("Invalid bundle element size {0}")]
    InvalidElementSize(i32),

    #[error("Unknown path {0:?}")]
    UnknownPath(String),

    #[error("Unexpected arguments for {path}: {tags:?}")]
    Arguments { path: String, tags: String },

    #[error("Invalid value for {path}: {reason}")]
    Value { path: String, reason: String },
}

/// One OSC argument
#[derive(Debug, Clone, PartialEq)]
pub enum OscType {
    Int(i32),
    Float(f32),
    String(String),
    Bool(bool),
    Nil,
}

impl OscType {
    pub fn tag(&self) -> char {
        match self {
            OscType::Int(_) => 'i',
            OscType::Float(_) => 'f',
            OscType::String(_) => 's',
            OscType::Bool(true) => 'T',
            OscType::Bool(false) => 'F',
            OscType::Nil => 'N',
        }
    }
}

impl From<i32> for OscType {
    fn from(value: i32) -> Self {
        OscType::Int(value)
    }
}

impl From<f32> for OscType {
    fn from(value: f32) -> Self {
        OscType::Float(value)
    }
}

impl From<bool> for OscType {
    fn from(value: bool) -> Self {
        OscType::Bool(value)
    }
}

impl From<&str> for OscType {
    fn from(value: &str) -> Self {
        OscType::String(value.to_string())
    }
}

impl From<String> for OscType {
    fn from(value: String) -> Self {
        OscType::String(value)
    }
}

/// An address pattern with its arguments
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub path: String,
    pub args: Vec<OscType>,
}

impl OscMessage {
    pub fn new(path: impl Into<String>, args: Vec<OscType>) -> Self {
        Self {
            path: path.into(),
            args,
        }
    }

    /// Type tags without the leading comma, e.g. `"iff"`
    pub fn tags(&self) -> String {
        self.args.iter().map(OscType::tag).collect()
    }

    /// Error describing an argument list that does not fit the path
    pub fn unexpected(&self) -> OscError {
        OscError::Arguments {
            path: self.path.clone(),
            tags: self.tags(),
        }
    }

    pub fn int(&self, index: usize) -> Result<i32> {
        match self.args.get(index) {
            Some(OscType::Int(value)) => Ok(*value),
            _ => Err(self.unexpected()),
        }
    }

    pub fn float(&self, index: usize) -> Result<f32> {
        match self.args.get(index) {
            Some(OscType::Float(value)) => Ok(*value),
            _ => Err(self.unexpected()),
        }
    }

    pub fn string(&self, index: usize) -> Result<&str> {
        match self.args.get(index) {
            Some(OscType::String(value)) => Ok(value),
            _ => Err(self.unexpected()),
        }
    }

    pub fn bool(&self, index: usize) -> Result<bool> {
        match self.args.get(index) {
            Some(OscType::Bool(value)) => Ok(*value),
            _ => Err(self.unexpected()),
        }
    }

    /// Encode as a standalone packet
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        write_string(&mut buf, &self.path);

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        tags.extend(self.args.iter().map(OscType::tag));
        write_string(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscType::Int(value) => buf.extend_from_slice(&value.to_be_bytes()),
                OscType::Float(value) => buf.extend_from_slice(&value.to_be_bytes()),
                OscType::String(value) => write_string(&mut buf, value),
                OscType::Bool(_) | OscType::Nil => {}
            }
        }
        buf
    }
}

/// Encode several messages as one bundle with an immediate time tag
pub fn encode_bundle(messages: &[OscMessage]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 * messages.len() + 16);
    buf.extend_from_slice(BUNDLE_TAG);
    buf.extend_from_slice(&1u64.to_be_bytes());
    for message in messages {
        let element = message.encode();
        buf.extend_from_slice(&(element.len() as i32).to_be_bytes());
        buf.extend_from_slice(&element);
    }
    buf
}

/// Decode a packet into its messages, flattening nested bundles
pub fn decode(packet: &[u8]) -> Result<Vec<OscMessage>> {
    let mut messages = Vec::new();
    decode_into(packet, 0, &mut messages)?;
    Ok(messages)
}

fn decode_into(packet: &[u8], base: usize, out: &mut Vec<OscMessage>) -> Result<()> {
    if packet.starts_with(BUNDLE_TAG) {
        let mut reader = Reader::new(packet, base);
        reader.take(BUNDLE_TAG.len())?;
        reader.take(8)?;
        while !reader.is_empty() {
            let size = reader.int()?;
            if size < 0 || size % 4 != 0 {
                return Err(OscError::InvalidElementSize(size));
            }
            let offset = reader.offset();
            let element = reader.take(size as usize)?;
            decode_into(element, offset, out)?;
        }
        Ok(())
    } else {
        out.push(decode_message(packet, base)?);
        Ok(())
    }
}

fn decode_message(packet: &[u8], base: usize) -> Result<OscMessage> {
    let mut reader = Reader::new(packet, base);
    let path = reader.string()?;
    if !path.starts_with('/') {
        return Err(OscError::InvalidAddress(path));
    }

    // a message without type tags is treated as having no arguments
    if reader.is_empty() {
        return Ok(OscMessage::new(path, Vec::new()));
    }
    let tags = reader.string()?;
    let Some(tags) = tags.strip_prefix(',') else {
        return Err(OscError::MissingTypeTags);
    };

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'i' => OscType::Int(reader.int()?),
            'f' => OscType::Float(f32::from_bits(reader.int()? as u32)),
            's' => OscType::String(reader.string()?),
            'T' => OscType::Bool(true),
            'F' => OscType::Bool(false),
            'N' => OscType::Nil,
            other => return Err(OscError::UnsupportedTag(other)),
        };
        args.push(arg);
    }
    Ok(OscMessage::new(path, args))
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    let padding = 4 - s.len() % 4;
    buf.extend(std::iter::repeat(0u8).take(padding));
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(OscError::Truncated(self.offset()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn int(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let start = self.offset();
        let rest = &self.data[self.pos.min(self.data.len())..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(OscError::InvalidString(start))?;
        let padded = (len / 4 + 1) * 4;
        let bytes = self.take(padded)?;
        String::from_utf8(bytes[..len].to_vec()).map_err(|_| OscError::InvalidString(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let message = OscMessage::new("/source/position", vec![3i32.into(), 1.5f32.into(), (-2.0f32).into()]);
        let bytes = message.encode();

        // "/source/position" is 16 bytes, padded to 20; ",iff" padded to 8
        assert_eq!(bytes.len(), 20 + 8 + 12);
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(&bytes[20..24], b",iff");
        assert_eq!(&bytes[28..32], &3i32.to_be_bytes());
    }

    #[test]
    fn test_decode_message() {
        let message = OscMessage::new(
            "/source/new",
            vec![
                OscType::String("tom".to_string()),
                true.into(),
                false.into(),
                OscType::Nil,
                7i32.into(),
            ],
        );
        let decoded = decode(&message.encode()).unwrap();

        assert_eq!(decoded, vec![message]);
        assert_eq!(decoded[0].tags(), "sTFNi");
    }

    #[test]
    fn test_bundle_is_flattened() {
        let first = OscMessage::new("/poll", vec![]);
        let second = OscMessage::new("/scene/volume", vec![(-6.0f32).into()]);
        let inner = encode_bundle(&[second.clone()]);

        // hand-built outer bundle containing a message and a nested bundle
        let mut packet = Vec::new();
        packet.extend_from_slice(BUNDLE_TAG);
        packet.extend_from_slice(&1u64.to_be_bytes());
        for element in [first.encode(), inner] {
            packet.extend_from_slice(&(element.len() as i32).to_be_bytes());
            packet.extend_from_slice(&element);
        }

        assert_eq!(decode(&packet).unwrap(), vec![first, second]);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode(b"/abc"), Err(OscError::InvalidString(_))));
        assert!(matches!(decode(b"abc\0"), Err(OscError::InvalidAddress(_))));

        let mut bytes = OscMessage::new("/x", vec![1i32.into()]).encode();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(decode(&bytes), Err(OscError::Truncated(_))));

        let mut bytes = Vec::new();
        write_string(&mut bytes, "/x");
        write_string(&mut bytes, ",d");
        assert_eq!(decode(&bytes), Err(OscError::UnsupportedTag('d')));
    }

    #[test]
    fn test_typed_accessors() {
        let message = OscMessage::new("/source/mute", vec![4i32.into(), true.into()]);
        assert_eq!(message.int(0).unwrap(), 4);
        assert!(message.bool(1).unwrap());
        assert!(message.float(1).is_err());
        assert!(message.string(2).is_err());
    }
}
