//! Optional in-transit layer: age X25519 (armored)
//!
//! A secondary end-to-end layer on top of the field envelopes, used when a
//! deployment wants payloads opaque even to the transport. Degrades to
//! passthrough when no key material is configured; both sides must agree on
//! whether the layer is active.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

/// age-based transfer cipher. Clients hold a recipient (encrypt side),
/// the server holds an identity (decrypt side); either may be absent.
#[derive(Default)]
pub struct TransferCipher {
    recipient: Option<age::x25519::Recipient>,
    /// Raw identity file contents; parsed per call (age identities are not
    /// Sync, holding the text keeps the cipher shareable across tasks)
    identity_data: Option<String>,
}

impl TransferCipher {
    /// Passthrough cipher: both directions are the identity function.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Load key material from optional file paths. A missing path means the
    /// corresponding direction stays passthrough.
    pub fn from_files(recipient: Option<&Path>, identity: Option<&Path>) -> Result<Self> {
        let recipient = match recipient {
            Some(path) => Some(load_recipient(path)?),
            None => None,
        };
        let identity_data = match identity {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading age identity {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self {
            recipient,
            identity_data,
        })
    }

    pub fn can_encrypt(&self) -> bool {
        self.recipient.is_some()
    }

    pub fn can_decrypt(&self) -> bool {
        self.identity_data.is_some()
    }

    /// Encrypt to the configured recipient; passthrough without one.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        use age::armor::{ArmoredWriter, Format};

        let Some(recipient) = &self.recipient else {
            return Ok(plaintext.to_vec());
        };

        let encryptor =
            age::Encryptor::with_recipients(std::iter::once(recipient as &dyn age::Recipient))
                .context("creating age encryptor")?;

        let mut armored = Vec::new();
        let mut writer = encryptor
            .wrap_output(
                ArmoredWriter::wrap_output(&mut armored, Format::AsciiArmor)
                    .context("creating armored writer")?,
            )
            .context("starting age encryption")?;
        writer.write_all(plaintext)?;
        writer
            .finish()
            .and_then(|armor| armor.finish())
            .context("finishing age encryption")?;

        Ok(armored)
    }

    /// Decrypt with the configured identity; passthrough without one.
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        use age::armor::ArmoredReader;

        let Some(identity_data) = &self.identity_data else {
            return Ok(encrypted.to_vec());
        };

        let identities =
            age::IdentityFile::from_buffer(std::io::BufReader::new(identity_data.as_bytes()))
                .context("parsing age identity file")?
                .into_identities()
                .context("extracting age identities")?;

        let armored = ArmoredReader::new(encrypted);
        let decryptor = age::Decryptor::new(armored).context("creating age decryptor")?;

        if decryptor.is_scrypt() {
            anyhow::bail!("passphrase-protected age payloads are not supported");
        }

        let mut reader = decryptor
            .decrypt(identities.iter().map(|i| i.as_ref() as &dyn age::Identity))
            .context("decrypting with age identity")?;

        let mut plaintext = Vec::new();
        reader
            .read_to_end(&mut plaintext)
            .context("reading decrypted data")?;

        Ok(plaintext)
    }
}

fn load_recipient(path: &Path) -> Result<age::x25519::Recipient> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading age recipient {}", path.display()))?;

    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(age::x25519::Recipient::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!("parsing age recipient: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("no recipient found in {}", path.display()))
}
