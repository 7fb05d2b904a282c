//! Reference update requests.
//!
//! A request is what `git push` sends to `receive-pack`: a pkt-line list of
//! `<old> <new> <ref>` commands, a flush packet, then a version 2 packfile
//! holding the objects the commands need. Objects are stored whole (no
//! deltas) and zlib compressed; the pack ends in the SHA-1 of everything
//! before it.

use std::io::Read;
use std::io::Write;

use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::Digest;
use sha1::Sha1;

use crate::git;
use crate::git::GitParseError;
use crate::git::ObjectKind;
use crate::hash::ObjectHash;

const FLUSH: &[u8] = b"0000";
const CAPABILITIES: &str = "report-status";
const PACK_SIGNATURE: &[u8] = b"PACK";
const PACK_VERSION: u32 = 2;
const MAX_PKT_LEN: usize = 65520;
/// Upper bound on the buffer reserved from an entry's declared size.
const MAX_ENTRY_PREALLOC: usize = 1 << 16;

#[derive(Debug)]
pub enum PackError {
    Io(std::io::Error),
    Malformed(String),
    ChecksumMismatch,
    Object(GitParseError),
}

impl std::fmt::Display for PackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackError::Io(err) => write!(f, "IO error: {err}"),
            PackError::Malformed(reason) => write!(f, "malformed request: {reason}"),
            PackError::ChecksumMismatch => write!(f, "pack checksum mismatch"),
            PackError::Object(err) => write!(f, "bad object in pack: {err}"),
        }
    }
}

impl std::error::Error for PackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PackError::Io(err) => Some(err),
            PackError::Object(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PackError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<GitParseError> for PackError {
    fn from(err: GitParseError) -> Self {
        Self::Object(err)
    }
}

fn malformed(reason: impl Into<String>) -> PackError {
    PackError::Malformed(reason.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCommand {
    pub old: ObjectHash,
    pub new: ObjectHash,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferenceUpdateRequest {
    pub commands: Vec<RefCommand>,
    /// Raw loose objects (`<type> <size>\0<content>`).
    pub objects: Vec<Vec<u8>>,
}

impl ReferenceUpdateRequest {
    pub fn encode(&self) -> Result<Vec<u8>, PackError> {
        if self.commands.is_empty() {
            return Err(malformed("no reference commands"));
        }
        let mut out = Vec::new();
        for (i, command) in self.commands.iter().enumerate() {
            let mut line = format!("{} {} {}", command.old, command.new, command.name);
            if i == 0 {
                line.push('\0');
                line.push_str(CAPABILITIES);
            }
            line.push('\n');
            write_pkt_line(&mut out, line.as_bytes())?;
        }
        out.extend_from_slice(FLUSH);
        self.write_pack(&mut out)?;
        Ok(out)
    }

    fn write_pack(&self, out: &mut Vec<u8>) -> Result<(), PackError> {
        let start = out.len();
        out.extend_from_slice(PACK_SIGNATURE);
        out.extend_from_slice(&PACK_VERSION.to_be_bytes());
        out.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());
        for raw in &self.objects {
            let (kind, content) = git::split_raw(raw)?;
            write_entry_header(out, kind, content.len());
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(content)?;
            out.extend_from_slice(&encoder.finish()?);
        }
        let checksum = Sha1::digest(&out[start..]);
        out.extend_from_slice(&checksum);
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PackError> {
        let mut rest = bytes;
        let mut commands = Vec::new();
        loop {
            if rest.len() < 4 {
                return Err(malformed("truncated pkt-line"));
            }
            let len = std::str::from_utf8(&rest[..4])
                .ok()
                .and_then(|s| usize::from_str_radix(s, 16).ok())
                .ok_or_else(|| malformed("bad pkt-line length"))?;
            if len == 0 {
                rest = &rest[4..];
                break;
            }
            if len < 4 || len > rest.len() {
                return Err(malformed("pkt-line length out of range"));
            }
            let line = std::str::from_utf8(&rest[4..len])
                .map_err(|_| malformed("command is not utf-8"))?;
            commands.push(parse_command(line)?);
            rest = &rest[len..];
        }
        let objects = read_pack(rest)?;
        Ok(ReferenceUpdateRequest { commands, objects })
    }
}

fn write_pkt_line(out: &mut Vec<u8>, payload: &[u8]) -> Result<(), PackError> {
    if payload.len() + 4 > MAX_PKT_LEN {
        return Err(malformed("pkt-line too long"));
    }
    out.extend_from_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

fn parse_command(line: &str) -> Result<RefCommand, PackError> {
    let line = line.trim_end_matches('\n');
    let line = line.split('\0').next().unwrap_or(line);
    let mut parts = line.splitn(3, ' ');
    let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed(format!("bad command {line:?}")));
    };
    let hash = |s: &str| ObjectHash::from_hex(s).map_err(|_| malformed(format!("bad hash {s:?}")));
    Ok(RefCommand {
        old: hash(old)?,
        new: hash(new)?,
        name: name.to_owned(),
    })
}

fn write_entry_header(out: &mut Vec<u8>, kind: ObjectKind, size: usize) {
    let mut size = size;
    let mut byte = (kind.pack_code() << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        out.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(byte);
}

fn read_entry_header(rest: &mut &[u8]) -> Result<(ObjectKind, usize), PackError> {
    let (&first, tail) = rest.split_first().ok_or_else(|| malformed("truncated entry"))?;
    *rest = tail;
    let kind = ObjectKind::from_pack_code((first >> 4) & 0x07)
        .ok_or_else(|| malformed("unsupported pack entry type"))?;
    let mut size = (first & 0x0f) as usize;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        let (&next, tail) = rest.split_first().ok_or_else(|| malformed("truncated entry"))?;
        *rest = tail;
        if shift > 56 {
            return Err(malformed("entry size overflow"));
        }
        size |= ((next & 0x7f) as usize) << shift;
        shift += 7;
        byte = next;
    }
    Ok((kind, size))
}

fn read_pack(pack: &[u8]) -> Result<Vec<Vec<u8>>, PackError> {
    if pack.len() < 12 + 20 || &pack[..4] != PACK_SIGNATURE {
        return Err(malformed("missing pack header"));
    }
    let (body, checksum) = pack.split_at(pack.len() - 20);
    if Sha1::digest(body).as_slice() != checksum {
        return Err(PackError::ChecksumMismatch);
    }
    let version = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    if version != PACK_VERSION {
        return Err(malformed(format!("unsupported pack version {version}")));
    }
    let count = u32::from_be_bytes([body[8], body[9], body[10], body[11]]) as usize;
    let mut rest = &body[12..];
    let mut objects = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (kind, size) = read_entry_header(&mut rest)?;
        let mut decoder = ZlibDecoder::new(rest);
        let mut content = Vec::with_capacity(size.min(MAX_ENTRY_PREALLOC));
        // One byte past the declared size is enough to detect an oversized
        // entry.
        (&mut decoder)
            .take((size as u64).saturating_add(1))
            .read_to_end(&mut content)?;
        if content.len() != size {
            return Err(malformed("entry size does not match content"));
        }
        rest = decoder.into_inner();
        objects.push(git::encode_raw(kind, &content));
    }
    if !rest.is_empty() {
        return Err(malformed("trailing bytes after last entry"));
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ReferenceUpdateRequest {
        ReferenceUpdateRequest {
            commands: vec![RefCommand {
                old: ObjectHash::ZERO,
                new: ObjectHash([3; 20]),
                name: "refs/heads/master".into(),
            }],
            objects: vec![
                git::encode_raw(ObjectKind::Blob, b"hello\n"),
                git::encode_raw(ObjectKind::Blob, &[7u8; 300]),
            ],
        }
    }

    #[test]
    fn encoded_request_decodes() {
        let req = request();
        let bytes = req.encode().unwrap();
        assert!(bytes.starts_with(b"0076"));
        assert_eq!(ReferenceUpdateRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn corrupted_pack_fails_checksum() {
        let mut bytes = request().encode().unwrap();
        let last = bytes.len() - 25;
        bytes[last] ^= 0xff;
        assert!(matches!(
            ReferenceUpdateRequest::decode(&bytes),
            Err(PackError::ChecksumMismatch)
        ));
    }

    fn pack_with_entry(header: &[u8], content: &[u8]) -> Vec<u8> {
        let mut pack = PACK_SIGNATURE.to_vec();
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&1u32.to_be_bytes());
        pack.extend_from_slice(header);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        pack.extend_from_slice(&encoder.finish().unwrap());
        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);
        pack
    }

    #[test]
    fn huge_declared_entry_size_is_malformed() {
        // Blob entry declaring roughly 2^59 bytes.
        let header = [0xbf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x3f];
        let pack = pack_with_entry(&header, b"hello\n");
        assert!(matches!(read_pack(&pack), Err(PackError::Malformed(_))));
    }

    #[test]
    fn entry_longer_than_declared_is_malformed() {
        let mut header = Vec::new();
        write_entry_header(&mut header, ObjectKind::Blob, 3);
        let pack = pack_with_entry(&header, b"hello\n");
        assert!(matches!(read_pack(&pack), Err(PackError::Malformed(_))));

        let mut header = Vec::new();
        write_entry_header(&mut header, ObjectKind::Blob, 6);
        let pack = pack_with_entry(&header, b"hello\n");
        assert_eq!(
            read_pack(&pack).unwrap(),
            vec![git::encode_raw(ObjectKind::Blob, b"hello\n")]
        );
    }

    #[test]
    fn empty_request_is_rejected() {
        assert!(ReferenceUpdateRequest::default().encode().is_err());
    }
}
