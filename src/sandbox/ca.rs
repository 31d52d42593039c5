//! Per-run certificate authority.
//!
//! The proxy terminates TLS for the updater, so each run mints a fresh
//! self-signed CA. The proxy gets the key; the updater and collector only
//! trust the certificate. Nothing is persisted.

use chrono::{Datelike, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256, SerialNumber,
};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use serde::Serialize;

use super::error::{Result, SandboxError};

const KEY_BITS: usize = 2048;
const VALIDITY_YEARS: i32 = 2;

/// A PEM certificate and its PKCS#1 private key.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct CertificateAuthority {
    pub cert: String,
    pub key: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert", &self.cert)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn failed(e: impl std::fmt::Display) -> SandboxError {
    SandboxError::Certificate {
        reason: e.to_string(),
    }
}

impl CertificateAuthority {
    /// Mint a new CA. RSA key generation is CPU-bound; call from a blocking task.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(failed)?;

        let pkcs8 = private_key.to_pkcs8_pem(LineEnding::LF).map_err(failed)?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256).map_err(failed)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::Any,
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let mut serial = [0u8; 16];
        rng.fill_bytes(&mut serial);
        serial[0] &= 0x7f;
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let today = Utc::now().date_naive();
        let (month, day) = (today.month() as u8, today.day() as u8);
        params.not_before = rcgen::date_time_ymd(today.year(), month, day);
        // Feb 29 does not exist in most target years.
        let end_day = if month == 2 && day == 29 { 28 } else { day };
        params.not_after = rcgen::date_time_ymd(today.year() + VALIDITY_YEARS, month, end_day);

        let cert = params.self_signed(&key_pair).map_err(failed)?;
        let key = private_key.to_pkcs1_pem(LineEnding::LF).map_err(failed)?;

        Ok(Self {
            cert: cert.pem(),
            key: key.as_str().to_owned(),
        })
    }
}

fn distinguished_name() -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Dependabot Internal CA");
    dn.push(DnType::OrganizationalUnitName, "Dependabot");
    dn.push(DnType::OrganizationName, "GitHub Inc.");
    dn.push(DnType::LocalityName, "San Francisco");
    dn.push(DnType::StateOrProvinceName, "California");
    dn.push(DnType::CountryName, "US");
    dn
}
