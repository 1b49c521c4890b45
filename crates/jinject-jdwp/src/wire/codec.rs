use super::types::{JdwpError, JdwpIdSizes, JdwpValue, Location, ObjectId, ReferenceTypeId, Result};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const HEADER_LEN: usize = crate::JDWP_HEADER_LEN;
pub const FLAG_REPLY: u8 = 0x80;

/// Command set / command of the VM-originated composite event packet.
pub const EVENT_COMMAND_SET: u8 = 64;
pub const EVENT_COMMAND: u8 = 100;

/// First byte of a JNI type signature doubles as the JDWP value tag for
/// primitives and `L` for references.
pub fn signature_to_tag(signature: &str) -> u8 {
    signature.as_bytes().first().copied().unwrap_or(b'V')
}

/// Convert a Java binary class name (`android.os.Build`) into a JDWP reference
/// type signature (`Landroid/os/Build;`). Signatures pass through unchanged.
pub fn class_name_to_signature(class: &str) -> String {
    if class.starts_with('L') && class.ends_with(';') {
        return class.to_string();
    }
    let internal = class.replace('.', "/");
    format!("L{internal};")
}

/// Decoded packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketHeader {
    Command {
        length: usize,
        id: u32,
        command_set: u8,
        command: u8,
    },
    Reply {
        length: usize,
        id: u32,
        error_code: u16,
    },
}

impl PacketHeader {
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let length = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if length < HEADER_LEN {
            return Err(JdwpError::Protocol(format!(
                "packet length {length} is shorter than the header"
            )));
        }
        if length > crate::MAX_JDWP_PACKET_BYTES {
            return Err(JdwpError::Protocol(format!(
                "packet too large ({length} bytes, max {})",
                crate::MAX_JDWP_PACKET_BYTES
            )));
        }
        let id = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if raw[8] & FLAG_REPLY != 0 {
            Ok(Self::Reply {
                length,
                id,
                error_code: u16::from_be_bytes([raw[9], raw[10]]),
            })
        } else {
            Ok(Self::Command {
                length,
                id,
                command_set: raw[9],
                command: raw[10],
            })
        }
    }

    pub fn payload_len(&self) -> usize {
        match *self {
            PacketHeader::Command { length, .. } | PacketHeader::Reply { length, .. } => {
                length - HEADER_LEN
            }
        }
    }
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    encode_packet(id, 0, [command_set, command], payload)
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    encode_packet(id, FLAG_REPLY, error_code.to_be_bytes(), payload)
}

fn encode_packet(id: u32, flags: u8, tail: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(&tail);
    out.extend_from_slice(payload);
    out
}

#[derive(Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        // Length prefix is the UTF-8 byte count, not the char count.
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_id(&mut self, id: u64, size: usize) {
        let be = id.to_be_bytes();
        self.buf.extend_from_slice(&be[8 - size.min(8)..]);
    }

    pub fn write_object_id(&mut self, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.object_id);
    }

    pub fn write_tagged_object_id(&mut self, tag: u8, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_u8(tag);
        self.write_object_id(id, sizes);
    }

    pub fn write_reference_type_id(&mut self, id: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.reference_type_id);
    }

    pub fn write_location(&mut self, loc: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(loc.type_tag);
        self.write_reference_type_id(loc.class_id, sizes);
        self.write_id(loc.method_id, sizes.method_id);
        self.write_u64(loc.index);
    }

    pub fn write_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        match *v {
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_u16(v as u16),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_u64(v as u64),
            JdwpValue::Float(v) => self.write_u32(v.to_bits()),
            JdwpValue::Double(v) => self.write_u64(v.to_bits()),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
            JdwpValue::Void => {}
        }
    }

    pub fn write_tagged_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        self.write_u8(v.tag());
        self.write_value(v, sizes);
    }
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(JdwpError::Protocol(format!(
                "buffer underflow: need {n} bytes at {}, have {}",
                self.pos,
                self.buf.len()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_be_bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| JdwpError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        if size == 0 || size > 8 {
            return Err(JdwpError::Protocol(format!("invalid id size: {size}")));
        }
        let mut be = [0u8; 8];
        be[8 - size..].copy_from_slice(self.take(size)?);
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_tagged_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<(u8, ObjectId)> {
        let tag = self.read_u8()?;
        Ok((tag, self.read_object_id(sizes)?))
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        Ok(match tag {
            b'Z' => JdwpValue::Boolean(self.read_bool()?),
            b'B' => JdwpValue::Byte(self.read_u8()? as i8),
            b'C' => JdwpValue::Char(self.read_u16()?),
            b'S' => JdwpValue::Short(self.read_u16()? as i16),
            b'I' => JdwpValue::Int(self.read_i32()?),
            b'J' => JdwpValue::Long(self.read_u64()? as i64),
            b'F' => JdwpValue::Float(f32::from_bits(self.read_u32()?)),
            b'D' => JdwpValue::Double(f64::from_bits(self.read_u64()?)),
            b'V' => JdwpValue::Void,
            _ => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
        })
    }

    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_name_to_signature_converts_dots() {
        assert_eq!(
            class_name_to_signature("android.os.Build"),
            "Landroid/os/Build;"
        );
        assert_eq!(
            class_name_to_signature("Ljava/lang/Runtime;"),
            "Ljava/lang/Runtime;"
        );
    }

    #[test]
    fn reply_header_decodes_error_code() {
        let packet = encode_reply(7, 101, &[1, 2, 3]);
        let raw: [u8; HEADER_LEN] = packet[..HEADER_LEN].try_into().unwrap();
        let header = PacketHeader::decode(&raw).unwrap();
        assert_eq!(
            header,
            PacketHeader::Reply {
                length: HEADER_LEN + 3,
                id: 7,
                error_code: 101
            }
        );
        assert_eq!(header.payload_len(), 3);
    }

    #[test]
    fn truncated_length_is_rejected() {
        let mut raw = [0u8; HEADER_LEN];
        raw[3] = 4;
        assert!(matches!(
            PacketHeader::decode(&raw),
            Err(JdwpError::Protocol(_))
        ));
    }

    #[test]
    fn short_ids_are_zero_extended() {
        let sizes = JdwpIdSizes {
            object_id: 4,
            ..JdwpIdSizes::default()
        };
        let mut w = JdwpWriter::new();
        w.write_tagged_value(&JdwpValue::Object { tag: b's', id: 0xdead_beef }, &sizes);
        let bytes = w.into_vec();
        assert_eq!(bytes, vec![b's', 0xde, 0xad, 0xbe, 0xef]);

        let mut r = JdwpReader::new(&bytes);
        assert_eq!(
            r.read_tagged_value(&sizes).unwrap(),
            JdwpValue::Object { tag: b's', id: 0xdead_beef }
        );
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn string_length_overrun_is_an_error() {
        let mut w = JdwpWriter::new();
        w.write_u32(10);
        w.write_u8(b'a');
        let bytes = w.into_vec();
        let mut r = JdwpReader::new(&bytes);
        assert!(r.read_string().is_err());
    }
}
