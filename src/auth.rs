//! CURVE key handling
//!
//! Keys travel as 40-character Z85 strings; sockets are configured with the
//! decoded 32-byte form.

use crate::error::{Result, SwitchyardError};

/// Length of a Z85-encoded CURVE key
pub const Z85_KEY_LEN: usize = 40;

/// Length of a raw CURVE key
pub const CURVE_KEY_LEN: usize = 32;

const Z85_ALPHABET: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-:+=^!/*?&<>()[]{}@%$#";

/// Decode a Z85 CURVE key, checking length and alphabet first
pub fn decode_key(key: &str) -> Result<[u8; CURVE_KEY_LEN]> {
    if key.len() != Z85_KEY_LEN {
        return Err(SwitchyardError::InvalidKey(format!(
            "expected {} characters, got {}",
            Z85_KEY_LEN,
            key.len()
        )));
    }
    if let Some(bad) = key.bytes().find(|b| !Z85_ALPHABET.contains(b)) {
        return Err(SwitchyardError::InvalidKey(format!(
            "character {:?} is not in the Z85 alphabet",
            bad as char
        )));
    }

    let raw = zmq::z85_decode(key)
        .map_err(|e| SwitchyardError::InvalidKey(format!("Z85 decode failed: {:?}", e)))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        SwitchyardError::InvalidKey(format!("decoded to {} bytes", raw.len()))
    })
}

/// A CURVE key pair in Z85 form
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        let pair = zmq::CurveKeyPair::new()?;
        Ok(Self {
            public_key: encode_key(&pair.public_key)?,
            secret_key: encode_key(&pair.secret_key)?,
        })
    }

    /// Use an existing pair, validating both halves
    pub fn from_z85(public_key: &str, secret_key: &str) -> Result<Self> {
        decode_key(public_key)?;
        decode_key(secret_key)?;
        Ok(Self {
            public_key: public_key.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    /// Configure `socket` as a CURVE server with this pair
    pub fn apply_server(&self, socket: &zmq::Socket) -> Result<()> {
        socket.set_curve_server(true)?;
        socket.set_curve_secretkey(&decode_key(&self.secret_key)?)?;
        Ok(())
    }

    /// Configure `socket` as a CURVE client of the server holding `server_key`
    pub fn apply_client(&self, socket: &zmq::Socket, server_key: &str) -> Result<()> {
        socket.set_curve_serverkey(&decode_key(server_key)?)?;
        socket.set_curve_publickey(&decode_key(&self.public_key)?)?;
        socket.set_curve_secretkey(&decode_key(&self.secret_key)?)?;
        Ok(())
    }
}

fn encode_key(raw: &[u8]) -> Result<String> {
    zmq::z85_encode(raw)
        .map_err(|e| SwitchyardError::InvalidKey(format!("Z85 encode failed: {:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_decode() {
        let pair = KeyPair::generate().unwrap();
        assert_eq!(pair.public_key.len(), Z85_KEY_LEN);
        assert_eq!(pair.secret_key.len(), Z85_KEY_LEN);
        assert_eq!(decode_key(&pair.public_key).unwrap().len(), CURVE_KEY_LEN);
        assert!(KeyPair::from_z85(&pair.public_key, &pair.secret_key).is_ok());
    }

    #[test]
    fn test_malformed_keys_are_rejected() {
        assert!(matches!(decode_key(""), Err(SwitchyardError::InvalidKey(_))));
        assert!(matches!(
            decode_key(&"a".repeat(39)),
            Err(SwitchyardError::InvalidKey(_))
        ));
        // Right length, space is outside the alphabet
        let spaced = format!("{} ", "a".repeat(39));
        assert!(matches!(decode_key(&spaced), Err(SwitchyardError::InvalidKey(_))));
    }

    #[test]
    fn test_debug_hides_secret() {
        let pair = KeyPair::generate().unwrap();
        let shown = format!("{:?}", pair);
        assert!(!shown.contains(&pair.secret_key));
    }
}
