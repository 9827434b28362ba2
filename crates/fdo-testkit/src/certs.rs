//! X.509 chain fixtures
//!
//! Chains are returned leaf first, DER encoded, the way vouchers carry them.

use fdo_crypto::{SigType, SigningKey};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509};

const ROOT_CN: &str = "FDO Test Root";

/// A generated chain and the CA keys behind it
pub struct CertChain {
    /// Root CA key
    pub root_key: SigningKey,
    /// Intermediate CA keys, closest to the root last
    pub intermediate_keys: Vec<SigningKey>,
    /// DER certificates, leaf first
    pub certs: Vec<Vec<u8>>,
}

impl CertChain {
    /// Certify `leaf` through `intermediates` CAs under a fresh root
    pub fn issue(leaf: &SigningKey, intermediates: usize) -> Self {
        let root_key = SigningKey::generate(SigType::StSecp256r1).expect("root key");
        let root = certificate(ROOT_CN, root_key.pkey(), ROOT_CN, root_key.pkey(), true, 1);

        let mut certs = vec![root.to_der().expect("root DER")];
        let mut intermediate_keys = Vec::new();
        let mut issuer_cn = ROOT_CN.to_string();
        let mut issuer_key = root_key.clone();
        for level in 0..intermediates {
            let key = SigningKey::generate(SigType::StSecp256r1).expect("intermediate key");
            let cn = format!("FDO Test Intermediate {level}");
            let cert = certificate(&cn, key.pkey(), &issuer_cn, issuer_key.pkey(), true, 2 + level as u32);
            certs.push(cert.to_der().expect("intermediate DER"));
            issuer_cn = cn;
            issuer_key = key.clone();
            intermediate_keys.push(key);
        }

        let leaf_cert = certificate("FDO Test Device", leaf.pkey(), &issuer_cn, issuer_key.pkey(), false, 100);
        certs.push(leaf_cert.to_der().expect("leaf DER"));
        certs.reverse();
        intermediate_keys.reverse();

        Self {
            root_key,
            intermediate_keys,
            certs,
        }
    }

    /// The chain with its root replaced by an unrelated root of the same name
    pub fn with_foreign_root(&self) -> Vec<Vec<u8>> {
        let foreign_key = SigningKey::generate(SigType::StSecp256r1).expect("foreign root key");
        let foreign = certificate(ROOT_CN, foreign_key.pkey(), ROOT_CN, foreign_key.pkey(), true, 1);
        let mut certs = self.certs.clone();
        if let Some(root) = certs.last_mut() {
            *root = foreign.to_der().expect("foreign root DER");
        }
        certs
    }
}

fn name(common_name: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().expect("name builder");
    builder
        .append_entry_by_text("CN", common_name)
        .expect("common name");
    builder.build()
}

fn certificate<T: HasPublic>(
    subject: &str,
    subject_key: &PKeyRef<T>,
    issuer: &str,
    issuer_key: &PKeyRef<Private>,
    is_ca: bool,
    serial: u32,
) -> X509 {
    let mut builder = X509Builder::new().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(serial)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("set serial");
    builder.set_subject_name(&name(subject)).expect("subject");
    builder.set_issuer_name(&name(issuer)).expect("issuer");
    builder.set_pubkey(subject_key).expect("public key");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("set not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(365).expect("not after"))
        .expect("set not after");

    let (constraints, usage) = if is_ca {
        (
            BasicConstraints::new().critical().ca().build(),
            KeyUsage::new().critical().key_cert_sign().crl_sign().build(),
        )
    } else {
        (
            BasicConstraints::new().critical().build(),
            KeyUsage::new().critical().digital_signature().build(),
        )
    };
    builder
        .append_extension(constraints.expect("basic constraints"))
        .expect("append basic constraints");
    builder
        .append_extension(usage.expect("key usage"))
        .expect("append key usage");

    builder
        .sign(issuer_key, MessageDigest::sha256())
        .expect("sign certificate");
    builder.build()
}
