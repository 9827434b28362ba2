//! Certificate path validation for X5Chain public keys
//!
//! The chain is leaf-first. The last certificate is the only trust anchor and
//! everything between the leaf and the anchor is offered as an untrusted
//! intermediate. Signatures and validity periods are checked by OpenSSL.

use openssl::pkey::{PKey, Public};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509Ref, X509StoreContext, X509};
use tracing::debug;

use fdo_core::{FdoError, FdoResult};

use crate::backend;

/// Path produced by a successful validation, leaf first
#[derive(Debug, Clone)]
pub struct ValidatedChain {
    path: Vec<X509>,
}

impl ValidatedChain {
    /// Leaf certificate
    pub fn leaf(&self) -> &X509Ref {
        &self.path[0]
    }

    /// Full path from leaf to anchor
    pub fn path(&self) -> &[X509] {
        &self.path
    }

    /// Public key of the leaf certificate
    pub fn leaf_public_key(&self) -> FdoResult<PKey<Public>> {
        self.leaf()
            .public_key()
            .map_err(|e| FdoError::malformed(format!("leaf certificate key unreadable: {e}")))
    }
}

/// Validate a leaf-first DER chain of at least two certificates
pub fn validate_chain<C: AsRef<[u8]>>(chain: &[C]) -> FdoResult<ValidatedChain> {
    if chain.len() < 2 {
        return Err(FdoError::malformed(format!(
            "certificate chain must hold at least two certificates, got {}",
            chain.len()
        )));
    }

    let parse = |index: usize, role: &str| -> FdoResult<X509> {
        X509::from_der(chain[index].as_ref()).map_err(|e| {
            FdoError::malformed(format!(
                "error decoding {role} certificate at index {index}: {e}"
            ))
        })
    };

    let root_index = chain.len() - 1;
    let leaf = parse(0, "leaf")?;
    let root = parse(root_index, "root")?;

    let mut intermediates = Stack::new().map_err(backend("certificate stack"))?;
    for index in 1..root_index {
        intermediates
            .push(parse(index, "intermediate")?)
            .map_err(backend("certificate stack"))?;
    }

    let mut store_builder = X509StoreBuilder::new().map_err(backend("certificate store"))?;
    store_builder
        .add_cert(root)
        .map_err(backend("add trust anchor"))?;
    store_builder
        .set_flags(X509VerifyFlags::PARTIAL_CHAIN)
        .map_err(backend("store flags"))?;
    let store = store_builder.build();

    let mut store_ctx = X509StoreContext::new().map_err(backend("store context"))?;
    let outcome = store_ctx
        .init(&store, &leaf, &intermediates, |ctx| {
            if !ctx.verify_cert()? {
                return Ok(Err(ctx.error()));
            }
            let path: Vec<X509> = ctx
                .chain()
                .map(|stack| stack.iter().map(|cert| cert.to_owned()).collect())
                .unwrap_or_default();
            Ok(Ok(path))
        })
        .map_err(backend("certificate path validation"))?;

    match outcome {
        Ok(path) if !path.is_empty() => {
            debug!(depth = path.len(), "certificate chain validated");
            Ok(ValidatedChain { path })
        }
        Ok(_) => Err(FdoError::internal("validation produced an empty path")),
        Err(result) => Err(FdoError::verification(format!(
            "error verifying certificate chain: {}",
            result.error_string()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_certificate_rejected() {
        let err = validate_chain(&[vec![0u8; 4]]).unwrap_err();
        assert!(matches!(err, FdoError::MalformedInput { .. }));
        assert!(err.to_string().contains("at least two"));
    }

    #[test]
    fn test_garbage_names_index() {
        let err = validate_chain(&[vec![0x30, 0x00], vec![0x30, 0x00]]).unwrap_err();
        assert!(matches!(err, FdoError::MalformedInput { .. }));
        assert!(err.to_string().contains("index 0"));
    }
}
