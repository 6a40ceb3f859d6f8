//! Local private-key signer.

use secp256k1::{All, Keypair, Message, Secp256k1};

use crate::error::{Error, Result};
use crate::event::{event_hash, Event};

/// Signs synchronously with a raw private scalar held in memory.
///
/// Signing is deterministic (no auxiliary randomness) so identical inputs
/// produce identical signatures.
pub struct LocalKeySigner {
    secp: Secp256k1<All>,
    keypair: Keypair,
    pubkey: String,
}

impl LocalKeySigner {
    /// Build from a 64-hex-char private key.
    pub fn from_hex(secret_key: &str) -> Result<Self> {
        let secp = Secp256k1::new();
        let bytes =
            hex::decode(secret_key).map_err(|e| Error::Validation(format!("private key: {e}")))?;
        let keypair = Keypair::from_seckey_slice(&secp, &bytes)
            .map_err(|e| Error::Validation(format!("private key: {e}")))?;
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(LocalKeySigner {
            secp,
            keypair,
            pubkey,
        })
    }

    pub fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    /// Assign pubkey, finalize the id, and produce a Schnorr signature.
    pub fn sign(&self, ev: &mut Event) -> Result<()> {
        ev.pubkey = self.pubkey.clone();
        let hash = event_hash(ev)?;
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| Error::Validation(format!("digest: {e}")))?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        ev.sig = hex::encode(sig.as_ref());
        Ok(())
    }
}
