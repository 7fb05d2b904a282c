//! The `tx:` trailer of signed git objects.
//!
//! Commits, tags and notes pushed to the network name the push key that
//! authorised them in a trailer line of their message:
//!
//! ```text
//! tx: fee=10, nonce=4, pkID=<40 hex chars>, sig=<128 hex chars>
//! ```
//!
//! The signature covers the object content with the `, sig=...` suffix
//! removed from the trailer, so the signed bytes are exactly the content the
//! author had before signing.

use ed25519::signature::Signer;
use ed25519::Signature;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;

use crate::hash::KeyId;

const PREFIX: &str = "tx: ";
const SIG_FIELD: &str = ", sig=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxLineError {
    /// The object carries no tx trailer.
    Missing,
    Malformed(String),
    BadSignature,
    NotUtf8,
}

impl std::fmt::Display for TxLineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxLineError::Missing => write!(f, "txline was not set"),
            TxLineError::Malformed(reason) => write!(f, "malformed txline: {reason}"),
            TxLineError::BadSignature => write!(f, "txline signature is not valid"),
            TxLineError::NotUtf8 => write!(f, "object content is not valid utf-8"),
        }
    }
}

impl std::error::Error for TxLineError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxLine {
    pub fee: String,
    pub nonce: u64,
    pub key_id: KeyId,
    pub signature: Vec<u8>,
}

impl TxLine {
    pub fn new(fee: impl Into<String>, nonce: u64, key_id: KeyId) -> Self {
        TxLine {
            fee: fee.into(),
            nonce,
            key_id,
            signature: Vec::new(),
        }
    }

    /// Renders the trailer without signature.
    pub fn render_unsigned(&self) -> String {
        format!(
            "{PREFIX}fee={}, nonce={}, pkID={}",
            self.fee, self.nonce, self.key_id
        )
    }

    pub fn render(&self) -> String {
        let mut line = self.render_unsigned();
        if !self.signature.is_empty() {
            line.push_str(SIG_FIELD);
            line.push_str(&hex::encode(&self.signature));
        }
        line
    }

    pub fn parse(line: &str) -> Result<Self, TxLineError> {
        let body = line.trim_end().strip_prefix(PREFIX).ok_or(TxLineError::Missing)?;
        let mut fee = None;
        let mut nonce = None;
        let mut key_id = None;
        let mut signature = Vec::new();
        for field in body.split(", ") {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| TxLineError::Malformed(format!("field {field:?} has no value")))?;
            match key {
                "fee" => {
                    if value.parse::<u64>().is_err() {
                        return Err(TxLineError::Malformed("fee must be numeric".into()));
                    }
                    fee = Some(value.to_owned());
                }
                "nonce" => {
                    nonce = Some(
                        value
                            .parse()
                            .map_err(|_| TxLineError::Malformed("nonce must be numeric".into()))?,
                    )
                }
                "pkID" => {
                    key_id = Some(
                        KeyId::from_hex(value)
                            .map_err(|_| TxLineError::Malformed("pkID is not a key id".into()))?,
                    )
                }
                "sig" => {
                    signature = hex::decode(value)
                        .map_err(|_| TxLineError::Malformed("sig is not hex".into()))?
                }
                other => return Err(TxLineError::Malformed(format!("unknown field {other:?}"))),
            }
        }
        Ok(TxLine {
            fee: fee.ok_or_else(|| TxLineError::Malformed("fee is required".into()))?,
            nonce: nonce.ok_or_else(|| TxLineError::Malformed("nonce is required".into()))?,
            key_id: key_id.ok_or_else(|| TxLineError::Malformed("pkID is required".into()))?,
            signature,
        })
    }
}

/// Locates the last tx trailer in `text`, returning its byte range.
fn locate(text: &str) -> Option<(usize, usize)> {
    let mut found = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n');
        if trimmed.starts_with(PREFIX) {
            found = Some((offset, offset + trimmed.len()));
        }
        offset += line.len();
    }
    found
}

/// Extracts the trailer of `content` and the bytes its signature covers.
pub fn signed_message(content: &[u8]) -> Result<(TxLine, Vec<u8>), TxLineError> {
    let text = std::str::from_utf8(content).map_err(|_| TxLineError::NotUtf8)?;
    let (start, end) = locate(text).ok_or(TxLineError::Missing)?;
    let line = TxLine::parse(&text[start..end])?;
    let unsigned = match text[start..end].find(SIG_FIELD) {
        Some(at) => &text[start..start + at],
        None => &text[start..end],
    };
    let message = [&text[..start], unsigned, &text[end..]].concat();
    Ok((line, message.into_bytes()))
}

/// Verifies the trailer signature of `content` against `public_key`.
pub fn verify(content: &[u8], public_key: &[u8; 32]) -> Result<TxLine, TxLineError> {
    let (line, message) = signed_message(content)?;
    if line.signature.is_empty() {
        return Err(TxLineError::BadSignature);
    }
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| TxLineError::BadSignature)?;
    let signature =
        Signature::from_slice(&line.signature).map_err(|_| TxLineError::BadSignature)?;
    key.verify(&message, &signature)
        .map_err(|_| TxLineError::BadSignature)?;
    Ok(line)
}

/// Signs `content`, whose message must end in an unsigned tx trailer, and
/// returns the content with the signature appended to that trailer.
pub fn sign(content: &str, key: &SigningKey) -> Result<String, TxLineError> {
    let (start, end) = locate(content).ok_or(TxLineError::Missing)?;
    if content[start..end].contains(SIG_FIELD) {
        return Err(TxLineError::Malformed("already signed".into()));
    }
    TxLine::parse(&content[start..end])?;
    let signature = hex::encode(key.sign(content.as_bytes()).to_bytes());
    Ok([&content[..end], SIG_FIELD, signature.as_str(), &content[end..]].concat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn content(line: &TxLine) -> String {
        format!(
            "tree {}\nauthor a\ncommitter a\n\nfix bug\n\n{}\n",
            "1".repeat(40),
            line.render_unsigned()
        )
    }

    #[test]
    fn sign_then_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let line = TxLine::new("1", 3, KeyId([9; 20]));
        let signed = sign(&content(&line), &key).unwrap();
        let parsed = verify(signed.as_bytes(), &key.verifying_key().to_bytes()).unwrap();
        assert_eq!(parsed.nonce, 3);
        assert_eq!(parsed.key_id, KeyId([9; 20]));
    }

    #[test]
    fn tampered_content_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let line = TxLine::new("1", 3, KeyId([9; 20]));
        let signed = sign(&content(&line), &key).unwrap().replace("fix bug", "fix bugs");
        assert_eq!(
            verify(signed.as_bytes(), &key.verifying_key().to_bytes()),
            Err(TxLineError::BadSignature)
        );
    }

    #[test]
    fn unsigned_content_is_missing_txline() {
        assert_eq!(
            signed_message(b"tree x\n\nno trailer\n").unwrap_err(),
            TxLineError::Missing
        );
    }

    #[test]
    fn parse_rejects_unknown_field() {
        assert!(matches!(
            TxLine::parse("tx: fee=1, nonce=1, pkID=00, extra=1"),
            Err(TxLineError::Malformed(_))
        ));
    }
}
