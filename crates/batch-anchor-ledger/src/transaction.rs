//! Solana wire format: keys, signing, and memo transactions.
//!
//! Only what anchoring needs is implemented: building and signing a legacy
//! transaction with a self-transfer and a memo instruction, and decoding a
//! legacy or v0 transaction far enough to read its memo back.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{LedgerError, Result};

/// Memo program address.
pub const MEMO_PROGRAM_ID: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";

/// System program address (all zero bytes).
pub const SYSTEM_PROGRAM_ID: Pubkey = Pubkey([0u8; 32]);

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// System program instruction index for `Transfer`.
const SYSTEM_TRANSFER: u32 = 2;

/// A 32-byte account address, displayed in base58.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pubkey(pub [u8; 32]);

impl Pubkey {
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn memo_program() -> Result<Self> {
        MEMO_PROGRAM_ID.parse()
    }
}

impl FromStr for Pubkey {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| LedgerError::Decode(format!("pubkey {s}: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LedgerError::Decode(format!("pubkey {s}: expected 32 bytes")))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self.to_base58())
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

/// Wallet keypair.
///
/// Wraps ed25519-dalek's SigningKey. The text form is the base58 encoding
/// of the 64-byte secret (32-byte seed followed by the public key).
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a base58 64-byte secret key.
    pub fn from_base58(secret: &str) -> Result<Self> {
        let bytes = bs58::decode(secret.trim())
            .into_vec()
            .map_err(|e| LedgerError::Keypair(e.to_string()))?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|v: Vec<u8>| {
            LedgerError::Keypair(format!("expected 64 bytes, got {}", v.len()))
        })?;
        let signing_key = SigningKey::from_keypair_bytes(&bytes)
            .map_err(|e| LedgerError::Keypair(e.to_string()))?;
        Ok(Self { signing_key })
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.signing_key.to_keypair_bytes()).into_string()
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.pubkey())
    }
}

/// One instruction of a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    pub data: Vec<u8>,
}

/// A signed transaction in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub signatures: Vec<[u8; 64]>,
    pub account_keys: Vec<Pubkey>,
    pub recent_blockhash: [u8; 32],
    pub instructions: Vec<Instruction>,
    /// Serialized message, the bytes the signatures cover.
    pub message: Vec<u8>,
}

impl Transaction {
    /// Build and sign a memo transaction.
    ///
    /// The payer sends `lamports` to itself and a memo instruction carries
    /// `memo` verbatim.
    pub fn memo(
        payer: &Keypair,
        recent_blockhash: [u8; 32],
        memo: &[u8],
        lamports: u64,
    ) -> Result<Self> {
        let account_keys = vec![payer.pubkey(), SYSTEM_PROGRAM_ID, Pubkey::memo_program()?];

        let mut transfer = Vec::with_capacity(12);
        transfer.put_u32_le(SYSTEM_TRANSFER);
        transfer.put_u64_le(lamports);

        let instructions = vec![
            Instruction {
                program_id_index: 1,
                accounts: vec![0, 0],
                data: transfer,
            },
            Instruction {
                program_id_index: 2,
                accounts: vec![],
                data: memo.to_vec(),
            },
        ];

        // header: 1 signer, 0 readonly signed, 2 readonly unsigned (the programs)
        let message = encode_message([1, 0, 2], &account_keys, &recent_blockhash, &instructions)?;
        let signature = payer.sign(&message);

        Ok(Self {
            signatures: vec![signature],
            account_keys,
            recent_blockhash,
            instructions,
            message,
        })
    }

    /// First signature in base58; this is the transaction id.
    pub fn id(&self) -> Option<String> {
        self.signatures
            .first()
            .map(|s| bs58::encode(s).into_string())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(1 + 64 * self.signatures.len() + self.message.len());
        put_compact_u16(&mut buf, self.signatures.len())?;
        for sig in &self.signatures {
            buf.put_slice(sig);
        }
        buf.put_slice(&self.message);
        Ok(buf.to_vec())
    }

    /// Decode a legacy or v0 transaction.
    ///
    /// Address table lookups of v0 messages are skipped; instructions whose
    /// program lives in a lookup table cannot be resolved.
    pub fn deserialize(wire: &[u8]) -> Result<Self> {
        let mut buf = wire;

        let sig_count = get_compact_u16(&mut buf)?;
        let mut signatures = Vec::with_capacity(sig_count);
        for _ in 0..sig_count {
            signatures.push(take_array::<64>(&mut buf)?);
        }

        let message = buf.to_vec();
        let mut m = buf;

        let first = take_u8(&mut m)?;
        let _num_required_signatures = if first & 0x80 != 0 {
            if first & 0x7f != 0 {
                return Err(LedgerError::Decode(format!(
                    "unsupported message version {}",
                    first & 0x7f
                )));
            }
            take_u8(&mut m)?
        } else {
            first
        };
        let _readonly_signed = take_u8(&mut m)?;
        let _readonly_unsigned = take_u8(&mut m)?;

        let key_count = get_compact_u16(&mut m)?;
        let mut account_keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            account_keys.push(Pubkey(take_array::<32>(&mut m)?));
        }
        let recent_blockhash = take_array::<32>(&mut m)?;

        let ix_count = get_compact_u16(&mut m)?;
        let mut instructions = Vec::with_capacity(ix_count);
        for _ in 0..ix_count {
            let program_id_index = take_u8(&mut m)?;
            let n = get_compact_u16(&mut m)?;
            let accounts = take_vec(&mut m, n)?;
            let n = get_compact_u16(&mut m)?;
            let data = take_vec(&mut m, n)?;
            instructions.push(Instruction {
                program_id_index,
                accounts,
                data,
            });
        }

        Ok(Self {
            signatures,
            account_keys,
            recent_blockhash,
            instructions,
            message,
        })
    }

    /// Data of the first memo instruction, if any.
    pub fn memo_data(&self) -> Option<&[u8]> {
        let memo = Pubkey::memo_program().ok()?;
        self.instructions
            .iter()
            .find(|ix| self.account_keys.get(ix.program_id_index as usize) == Some(&memo))
            .map(|ix| ix.data.as_slice())
    }

    /// Check the fee payer's signature over the message.
    pub fn verify(&self) -> Result<()> {
        let (sig, payer) = match (self.signatures.first(), self.account_keys.first()) {
            (Some(sig), Some(payer)) => (sig, payer),
            _ => return Err(LedgerError::Decode("unsigned transaction".into())),
        };
        let key = VerifyingKey::from_bytes(&payer.0)
            .map_err(|e| LedgerError::Decode(format!("payer key: {e}")))?;
        key.verify(&self.message, &Signature::from_bytes(sig))
            .map_err(|_| LedgerError::Rpc {
                code: -32003,
                message: "Transaction signature verification failure".into(),
            })
    }
}

fn encode_message(
    header: [u8; 3],
    account_keys: &[Pubkey],
    recent_blockhash: &[u8; 32],
    instructions: &[Instruction],
) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    buf.put_slice(&header);
    put_compact_u16(&mut buf, account_keys.len())?;
    for key in account_keys {
        buf.put_slice(&key.0);
    }
    buf.put_slice(recent_blockhash);
    put_compact_u16(&mut buf, instructions.len())?;
    for ix in instructions {
        buf.put_u8(ix.program_id_index);
        put_compact_u16(&mut buf, ix.accounts.len())?;
        buf.put_slice(&ix.accounts);
        put_compact_u16(&mut buf, ix.data.len())?;
        buf.put_slice(&ix.data);
    }
    Ok(buf.to_vec())
}

/// Shortvec length prefix: 7 bits per byte, high bit continues.
fn put_compact_u16(buf: &mut BytesMut, len: usize) -> Result<()> {
    let mut rem = u16::try_from(len)
        .map_err(|_| LedgerError::Decode(format!("length {len} exceeds u16")))?;
    loop {
        let mut byte = (rem & 0x7f) as u8;
        rem >>= 7;
        if rem == 0 {
            buf.put_u8(byte);
            return Ok(());
        }
        byte |= 0x80;
        buf.put_u8(byte);
    }
}

fn get_compact_u16(buf: &mut &[u8]) -> Result<usize> {
    let mut value: usize = 0;
    for i in 0..3 {
        let byte = take_u8(buf)?;
        value |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(LedgerError::Decode("compact-u16 too long".into()))
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(LedgerError::Decode(format!(
            "truncated transaction: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    need(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn take_vec(buf: &mut &[u8], n: usize) -> Result<Vec<u8>> {
    need(buf, n)?;
    let mut out = vec![0u8; n];
    buf.copy_to_slice(&mut out);
    Ok(out)
}
