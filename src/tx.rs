//! Signed transactions.
//!
//! A [`Transaction`] is the generic signed unit admitted by the pool and
//! included in blocks. The type specific part is the closed [`TxPayload`] sum
//! type; on the wire it is preceded by its [`TxType`] tag and
//! [`Transaction::decode`] dispatches on that tag.

use ed25519::signature::Signer;
use ed25519::Signature;
use ed25519_dalek::SignatureError;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use num_rational::Ratio;

use crate::codec::DecodeError;
use crate::codec::Decoder;
use crate::codec::Encoder;
use crate::hash::Address;
use crate::hash::TxHash;
use crate::push::PushEndorsement;
use crate::push::PushNote;

/// Fee per byte of economic size.
pub type FeeRate = Ratio<u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxType {
    Transfer = 1,
    Push = 2,
    RegisterPushKey = 3,
}

impl TryFrom<u8> for TxType {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(TxType::Transfer),
            2 => Ok(TxType::Push),
            3 => Ok(TxType::RegisterPushKey),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPayload {
    Transfer {
        to: Address,
        value: u64,
    },
    /// A confirmed push: the note and the endorsements that admitted it.
    Push {
        note: PushNote,
        endorsements: Vec<PushEndorsement>,
    },
    RegisterPushKey {
        public_key: [u8; 32],
    },
}

impl TxPayload {
    pub fn tx_type(&self) -> TxType {
        match self {
            TxPayload::Transfer { .. } => TxType::Transfer,
            TxPayload::Push { .. } => TxType::Push,
            TxPayload::RegisterPushKey { .. } => TxType::RegisterPushKey,
        }
    }

    fn encode_into(&self, enc: &mut Encoder) {
        enc.u8(self.tx_type() as u8);
        match self {
            TxPayload::Transfer { to, value } => {
                enc.fixed(to.as_bytes()).u64(*value);
            }
            TxPayload::Push { note, endorsements } => {
                enc.bytes(&note.encode()).count(endorsements.len());
                for endorsement in endorsements {
                    endorsement.encode_into(enc);
                }
            }
            TxPayload::RegisterPushKey { public_key } => {
                enc.fixed(public_key);
            }
        }
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        match TxType::try_from(dec.u8()?)? {
            TxType::Transfer => Ok(TxPayload::Transfer {
                to: Address(dec.fixed()?),
                value: dec.u64()?,
            }),
            TxType::Push => {
                let note = PushNote::decode(&dec.bytes()?)?;
                let count = dec.count()?;
                let endorsements = (0..count)
                    .map(|_| PushEndorsement::decode_from(dec))
                    .collect::<Result<_, _>>()?;
                Ok(TxPayload::Push { note, endorsements })
            }
            TxType::RegisterPushKey => Ok(TxPayload::RegisterPushKey {
                public_key: dec.fixed()?,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender: [u8; 32],
    pub nonce: u64,
    pub fee: u64,
    /// Creation time in unix seconds.
    pub timestamp: i64,
    pub payload: TxPayload,
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Creates and signs a transaction.
    pub fn new(
        key: &SigningKey,
        nonce: u64,
        fee: u64,
        timestamp: i64,
        payload: TxPayload,
    ) -> Self {
        let mut tx = Transaction {
            sender: key.verifying_key().to_bytes(),
            nonce,
            fee,
            timestamp,
            payload,
            signature: Vec::new(),
        };
        tx.signature = key.sign(&tx.bytes_for_signing()).to_bytes().to_vec();
        tx
    }

    fn encode_parts(&self, with_fee: bool, sig: &[u8]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.fixed(&self.sender).u64(self.nonce);
        if with_fee {
            enc.u64(self.fee);
        }
        enc.i64(self.timestamp);
        self.payload.encode_into(&mut enc);
        enc.bytes(sig);
        enc.finish()
    }

    pub fn bytes_for_signing(&self) -> Vec<u8> {
        self.encode_parts(true, &[])
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_parts(true, &self.signature)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let sender = dec.fixed()?;
        let nonce = dec.u64()?;
        let fee = dec.u64()?;
        let timestamp = dec.i64()?;
        let payload = TxPayload::decode_from(&mut dec)?;
        let signature = dec.bytes()?;
        dec.finish()?;
        Ok(Transaction {
            sender,
            nonce,
            fee,
            timestamp,
            payload,
            signature,
        })
    }

    /// Identity of the transaction, signature included.
    pub fn hash(&self) -> TxHash {
        TxHash(*blake3::hash(&self.encode()).as_bytes())
    }

    pub fn tx_type(&self) -> TxType {
        self.payload.tx_type()
    }

    pub fn sender_address(&self) -> Address {
        match VerifyingKey::from_bytes(&self.sender) {
            Ok(key) => Address::from_public_key(&key),
            // An invalid key still needs a stable bucket in the pool; the
            // signature check rejects such transactions before they matter.
            Err(_) => {
                let mut out = [0; 20];
                out.copy_from_slice(&blake3::hash(&self.sender).as_bytes()[..20]);
                Address(out)
            }
        }
    }

    /// Size used for fee pricing. The fee and signature are excluded so the
    /// fee does not influence its own rate.
    pub fn economic_size(&self) -> u64 {
        self.encode_parts(false, &[]).len() as u64
    }

    pub fn fee_rate(&self) -> FeeRate {
        Ratio::new(self.fee, self.economic_size().max(1))
    }

    pub fn verify_signature(&self) -> Result<(), SignatureError> {
        let key = VerifyingKey::from_bytes(&self.sender)?;
        let signature = Signature::from_slice(&self.signature)?;
        key.verify(&self.bytes_for_signing(), &signature)
    }

    pub fn as_push(&self) -> Option<(&PushNote, &[PushEndorsement])> {
        match &self.payload {
            TxPayload::Push { note, endorsements } => Some((note, endorsements)),
            _ => None,
        }
    }
}
