//! Raw git object handling.
//!
//! Objects travel and are stored in git's loose format,
//! `<type> <size>\0<content>`, and are identified by the SHA-1 of those bytes.
//! Only commits and tags are parsed; trees and blobs are opaque here.

use sha1::Digest;
use sha1::Sha1;

use crate::hash::ObjectHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(ObjectKind::Commit),
            "tree" => Some(ObjectKind::Tree),
            "blob" => Some(ObjectKind::Blob),
            "tag" => Some(ObjectKind::Tag),
            _ => None,
        }
    }

    /// Type code used in packfile entry headers.
    pub fn pack_code(&self) -> u8 {
        match self {
            ObjectKind::Commit => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
            ObjectKind::Tag => 4,
        }
    }

    pub fn from_pack_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            4 => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitParseError {
    MissingHeader,
    UnknownKind(String),
    SizeMismatch { declared: usize, actual: usize },
    BadUtf8,
    MissingField(&'static str),
    BadHash(&'static str),
}

impl std::fmt::Display for GitParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitParseError::MissingHeader => write!(f, "malformed git object header"),
            GitParseError::UnknownKind(kind) => write!(f, "unknown git object type {kind:?}"),
            GitParseError::SizeMismatch { declared, actual } => {
                write!(f, "object declares {declared} bytes but has {actual}")
            }
            GitParseError::BadUtf8 => write!(f, "object is not valid utf-8"),
            GitParseError::MissingField(field) => write!(f, "missing {field} field"),
            GitParseError::BadHash(field) => write!(f, "bad object hash in {field} field"),
        }
    }
}

impl std::error::Error for GitParseError {}

/// SHA-1 object id of raw object bytes.
pub fn object_hash(raw: &[u8]) -> ObjectHash {
    ObjectHash(Sha1::digest(raw).into())
}

/// Wraps `content` in a loose object header.
pub fn encode_raw(kind: ObjectKind, content: &[u8]) -> Vec<u8> {
    let mut raw = format!("{} {}\0", kind.as_str(), content.len()).into_bytes();
    raw.extend_from_slice(content);
    raw
}

/// Splits a raw object into its kind and content.
pub fn split_raw(raw: &[u8]) -> Result<(ObjectKind, &[u8]), GitParseError> {
    let nul = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(GitParseError::MissingHeader)?;
    let header = std::str::from_utf8(&raw[..nul]).map_err(|_| GitParseError::MissingHeader)?;
    let (kind, size) = header.split_once(' ').ok_or(GitParseError::MissingHeader)?;
    let kind = ObjectKind::parse(kind).ok_or_else(|| GitParseError::UnknownKind(kind.into()))?;
    let declared: usize = size.parse().map_err(|_| GitParseError::MissingHeader)?;
    let content = &raw[nul + 1..];
    if declared != content.len() {
        return Err(GitParseError::SizeMismatch {
            declared,
            actual: content.len(),
        });
    }
    Ok((kind, content))
}

/// Iterates over header lines and returns the message after the blank line.
/// Continuation lines (starting with a space) belong to the previous header.
fn headers(text: &str) -> (Vec<(&str, &str)>, &str) {
    let (head, message) = text.split_once("\n\n").unwrap_or((text, ""));
    let headers = head
        .lines()
        .filter(|line| !line.starts_with(' '))
        .filter_map(|line| line.split_once(' '))
        .collect();
    (headers, message)
}

fn hash_field(value: &str, field: &'static str) -> Result<ObjectHash, GitParseError> {
    ObjectHash::from_hex(value).map_err(|_| GitParseError::BadHash(field))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectHash,
    pub parents: Vec<ObjectHash>,
    pub author: String,
    pub committer: String,
    pub message: String,
}

impl Commit {
    pub fn parse(content: &[u8]) -> Result<Self, GitParseError> {
        let text = std::str::from_utf8(content).map_err(|_| GitParseError::BadUtf8)?;
        let (headers, message) = headers(text);
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for (key, value) in headers {
            match key {
                "tree" => tree = Some(hash_field(value, "tree")?),
                "parent" => parents.push(hash_field(value, "parent")?),
                "author" => author = Some(value.to_owned()),
                "committer" => committer = Some(value.to_owned()),
                _ => {}
            }
        }
        Ok(Commit {
            tree: tree.ok_or(GitParseError::MissingField("tree"))?,
            parents,
            author: author.ok_or(GitParseError::MissingField("author"))?,
            committer: committer.ok_or(GitParseError::MissingField("committer"))?,
            message: message.to_owned(),
        })
    }

    pub fn parse_raw(raw: &[u8]) -> Result<Self, GitParseError> {
        match split_raw(raw)? {
            (ObjectKind::Commit, content) => Self::parse(content),
            (kind, _) => Err(GitParseError::UnknownKind(kind.as_str().into())),
        }
    }

    /// Serializes the commit content (without loose header).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("tree {}\n", self.tree);
        for parent in &self.parents {
            out.push_str(&format!("parent {parent}\n"));
        }
        out.push_str(&format!("author {}\n", self.author));
        out.push_str(&format!("committer {}\n\n", self.committer));
        out.push_str(&self.message);
        out.into_bytes()
    }

    pub fn to_raw(&self) -> Vec<u8> {
        encode_raw(ObjectKind::Commit, &self.encode())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub object: ObjectHash,
    pub kind: ObjectKind,
    pub name: String,
    pub tagger: String,
    pub message: String,
}

impl Tag {
    pub fn parse(content: &[u8]) -> Result<Self, GitParseError> {
        let text = std::str::from_utf8(content).map_err(|_| GitParseError::BadUtf8)?;
        let (headers, message) = headers(text);
        let mut object = None;
        let mut kind = None;
        let mut name = None;
        let mut tagger = String::new();
        for (key, value) in headers {
            match key {
                "object" => object = Some(hash_field(value, "object")?),
                "type" => {
                    kind = Some(
                        ObjectKind::parse(value)
                            .ok_or_else(|| GitParseError::UnknownKind(value.into()))?,
                    )
                }
                "tag" => name = Some(value.to_owned()),
                "tagger" => tagger = value.to_owned(),
                _ => {}
            }
        }
        Ok(Tag {
            object: object.ok_or(GitParseError::MissingField("object"))?,
            kind: kind.ok_or(GitParseError::MissingField("type"))?,
            name: name.ok_or(GitParseError::MissingField("tag"))?,
            tagger,
            message: message.to_owned(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "object {}\ntype {}\ntag {}\ntagger {}\n\n{}",
            self.object,
            self.kind.as_str(),
            self.name,
            self.tagger,
            self.message
        )
        .into_bytes()
    }

    pub fn to_raw(&self) -> Vec<u8> {
        encode_raw(ObjectKind::Tag, &self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_hash_matches_git() {
        // `git hash-object` of "hello\n"
        let raw = encode_raw(ObjectKind::Blob, b"hello\n");
        assert_eq!(
            object_hash(&raw).to_hex(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
    }

    #[test]
    fn commit_parse_skips_unknown_headers() {
        let content = format!(
            "tree {}\nparent {}\nauthor A <a@x> 1 +0000\ncommitter C <c@x> 2 +0000\ngpgsig -----BEGIN\n line\n -----END\n\nmessage\n",
            "1".repeat(40),
            "2".repeat(40)
        );
        let commit = Commit::parse(content.as_bytes()).unwrap();
        assert_eq!(commit.parents.len(), 1);
        assert_eq!(commit.author, "A <a@x> 1 +0000");
        assert_eq!(commit.message, "message\n");
    }

    #[test]
    fn commit_encode_parses_back() {
        let commit = Commit {
            tree: ObjectHash([1; 20]),
            parents: vec![ObjectHash([2; 20])],
            author: "A <a@x> 1 +0000".into(),
            committer: "A <a@x> 1 +0000".into(),
            message: "hi\n".into(),
        };
        assert_eq!(Commit::parse_raw(&commit.to_raw()).unwrap(), commit);
    }

    #[test]
    fn split_raw_checks_size() {
        let mut raw = encode_raw(ObjectKind::Blob, b"abc");
        raw.push(b'd');
        assert_eq!(
            split_raw(&raw),
            Err(GitParseError::SizeMismatch {
                declared: 3,
                actual: 4
            })
        );
    }
}
