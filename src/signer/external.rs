//! External/offline signing handoff.

use secp256k1::XOnlyPublicKey;

use crate::error::{Error, Result};
use crate::event::Event;

/// Never produces a signature: assigns the pubkey and computes the id so the
/// unsigned event can be handed to an external signing ceremony, and leaves
/// `sig` empty.
pub struct ExternalKeySigner {
    pubkey: String,
}

impl ExternalKeySigner {
    pub fn from_hex(public_key: &str) -> Result<Self> {
        let bytes =
            hex::decode(public_key).map_err(|e| Error::Validation(format!("public key: {e}")))?;
        XOnlyPublicKey::from_slice(&bytes)
            .map_err(|e| Error::Validation(format!("public key: {e}")))?;
        Ok(ExternalKeySigner {
            pubkey: public_key.to_string(),
        })
    }

    pub fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    pub fn sign(&self, ev: &mut Event) -> Result<()> {
        ev.pubkey = self.pubkey.clone();
        ev.finalize_id()?;
        ev.sig = String::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_hash, KIND_RELEASE};
    use secp256k1::{Keypair, Secp256k1};

    fn some_pubkey() -> String {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[3u8; 32]).unwrap();
        hex::encode(kp.x_only_public_key().0.serialize())
    }

    #[test]
    fn sets_id_but_leaves_sig_empty() {
        let signer = ExternalKeySigner::from_hex(&some_pubkey()).unwrap();
        let mut ev = Event::unsigned(KIND_RELEASE, 1, vec![], String::new());
        signer.sign(&mut ev).unwrap();
        assert_eq!(ev.pubkey, signer.public_key());
        assert_eq!(ev.id, hex::encode(event_hash(&ev).unwrap()));
        assert!(ev.sig.is_empty());
    }

    #[test]
    fn rejects_invalid_pubkey() {
        assert!(ExternalKeySigner::from_hex("nope").is_err());
        assert!(ExternalKeySigner::from_hex(&"00".repeat(31)).is_err());
    }
}
