//! In-process crypto engine on the `openssl` crate
//!
//! # Certificate Properties
//! - **Key**: RSA, PKCS#8 PEM; root keys encrypted with AES-256-CBC
//! - **Signature Algorithm**: SHA-256 with RSA
//! - **Version**: X.509v3
//! - **Serial Number**: random 128-bit number
//! - **Extensions**: taken from the rendered template; leaf certificates copy
//!   the extensions embedded in their CSR

use std::fs;
use std::path::Path;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Extension, X509Name, X509NameBuilder, X509Req, X509v3Context, X509};
use tracing::debug;

use crate::crypto_engine::{
    write_private, CertHandle, ConfigRef, CryptoEngine, CsrHandle, EngineError, EngineResult,
    EngineStage, ExtensionsRef, KeyHandle,
};
use crate::identity_template::{AltName, ExtensionPolicy, KeyUsageFlag, SubjectFields};
use crate::passphrase::Passphrase;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const X509_REQ_VERSION_1: i32 = 0;

#[derive(Debug, Default, Clone, Copy)]
pub struct OpensslEngine;

impl OpensslEngine {
    pub fn new() -> Self {
        Self
    }
}

fn load_key(handle: &KeyHandle, stage: EngineStage) -> EngineResult<PKey<Private>> {
    let pem = fs::read(&handle.path).map_err(|e| {
        EngineError::new(stage, format!("Failed to read key {}: {}", handle.path.display(), e))
    })?;
    match &handle.passphrase {
        Some(pass) => PKey::private_key_from_pem_passphrase(&pem, pass.expose().as_bytes())
            .map_err(|e| EngineError::new(stage, format!("Failed to decrypt private key: {}", e))),
        None => PKey::private_key_from_pem(&pem)
            .map_err(|e| EngineError::new(stage, format!("Failed to parse private key: {}", e))),
    }
}

fn random_serial(stage: EngineStage) -> EngineResult<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new().map_err(EngineError::at(stage))?;
    serial
        .rand(128, MsbOption::MAYBE_ZERO, false)
        .map_err(EngineError::at(stage))?;
    serial.to_asn1_integer().map_err(EngineError::at(stage))
}

fn build_name(subject: &SubjectFields, stage: EngineStage) -> EngineResult<X509Name> {
    let mut name_builder = X509NameBuilder::new()
        .map_err(|e| EngineError::new(stage, format!("Failed to create name builder: {}", e)))?;
    let entries = [
        (Nid::COMMONNAME, &subject.common_name, "CN"),
        (Nid::STATEORPROVINCENAME, &subject.state, "state/province"),
        (Nid::COUNTRYNAME, &subject.country, "country"),
        (Nid::PKCS9_EMAILADDRESS, &subject.email, "email"),
        (Nid::ORGANIZATIONNAME, &subject.organization, "organization"),
        (
            Nid::ORGANIZATIONALUNITNAME,
            &subject.organizational_unit,
            "organizational unit",
        ),
    ];
    for (nid, value, label) in entries {
        name_builder
            .append_entry_by_nid(nid, value)
            .map_err(|e| EngineError::new(stage, format!("Failed to set {}: {}", label, e)))?;
    }
    Ok(name_builder.build())
}

/// Build the extensions of `policy` in the given X509v3 context
fn build_extensions(
    policy: &ExtensionPolicy,
    ctx: &X509v3Context<'_>,
    stage: EngineStage,
) -> EngineResult<Vec<X509Extension>> {
    let mut extensions = Vec::new();

    let mut bc = BasicConstraints::new();
    if policy.critical {
        bc.critical();
    }
    if policy.ca {
        bc.ca();
    }
    extensions.push(
        bc.build()
            .map_err(|e| EngineError::new(stage, format!("Failed to build BasicConstraints: {}", e)))?,
    );

    if !policy.key_usage.is_empty() {
        let mut ku = KeyUsage::new();
        for flag in &policy.key_usage {
            match flag {
                KeyUsageFlag::NonRepudiation => ku.non_repudiation(),
                KeyUsageFlag::DigitalSignature => ku.digital_signature(),
                KeyUsageFlag::KeyEncipherment => ku.key_encipherment(),
            };
        }
        extensions.push(
            ku.build()
                .map_err(|e| EngineError::new(stage, format!("Failed to build KeyUsage: {}", e)))?,
        );
    }

    if !policy.alt_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for name in &policy.alt_names {
            match name {
                AltName::Dns(dns) => san.dns(dns),
                AltName::Ip(ip) => san.ip(&ip.to_string()),
            };
        }
        extensions.push(san.build(ctx).map_err(|e| {
            EngineError::new(stage, format!("Failed to build SubjectAlternativeName: {}", e))
        })?);
    }

    Ok(extensions)
}

fn validity(days: u32, stage: EngineStage) -> EngineResult<(Asn1Time, Asn1Time)> {
    let not_before = Asn1Time::days_from_now(0)
        .map_err(|e| EngineError::new(stage, format!("Failed to create not_before: {}", e)))?;
    let not_after = Asn1Time::days_from_now(days)
        .map_err(|e| EngineError::new(stage, format!("Failed to create not_after: {}", e)))?;
    Ok((not_before, not_after))
}

fn write_pem(path: &Path, pem: &[u8], stage: EngineStage) -> EngineResult<()> {
    fs::write(path, pem)
        .map_err(|e| EngineError::new(stage, format!("Failed to write {}: {}", path.display(), e)))
}

impl CryptoEngine for OpensslEngine {
    fn generate_key(
        &self,
        bits: u32,
        passphrase: Option<&Passphrase>,
        out: &Path,
    ) -> EngineResult<KeyHandle> {
        let stage = EngineStage::GenerateKey;
        debug!(bits, encrypted = passphrase.is_some(), path = %out.display(), "generating RSA key");

        let rsa = Rsa::generate(bits)
            .map_err(|e| EngineError::new(stage, format!("Failed to generate RSA keypair: {}", e)))?;
        let private_key = PKey::from_rsa(rsa)
            .map_err(|e| EngineError::new(stage, format!("Failed to create private key: {}", e)))?;

        let pem = match passphrase {
            Some(pass) => private_key
                .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), pass.expose().as_bytes())
                .map_err(|e| {
                    EngineError::new(stage, format!("Failed to encrypt private key: {}", e))
                })?,
            None => private_key
                .private_key_to_pem_pkcs8()
                .map_err(|e| EngineError::new(stage, format!("Failed to encode private key: {}", e)))?,
        };
        write_private(out, &pem).map_err(|e| {
            EngineError::new(stage, format!("Failed to write {}: {}", out.display(), e))
        })?;

        Ok(KeyHandle::new(out, passphrase.cloned()))
    }

    fn generate_self_signed_cert(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle> {
        let stage = EngineStage::SelfSign;
        let private_key = load_key(key, stage)?;
        let rendered = config.rendered;

        let mut builder = X509::builder()
            .map_err(|e| EngineError::new(stage, format!("Failed to create X509 builder: {}", e)))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| EngineError::new(stage, format!("Failed to set version: {}", e)))?;
        let serial = random_serial(stage)?;
        builder
            .set_serial_number(&serial)
            .map_err(EngineError::at(stage))?;

        let name = build_name(rendered.subject(), stage)?;
        builder
            .set_subject_name(&name)
            .map_err(|e| EngineError::new(stage, format!("Failed to set subject: {}", e)))?;
        builder
            .set_issuer_name(&name)
            .map_err(|e| EngineError::new(stage, format!("Failed to set issuer: {}", e)))?;

        let (not_before, not_after) = validity(validity_days, stage)?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| EngineError::new(stage, format!("Failed to set not_before: {}", e)))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| EngineError::new(stage, format!("Failed to set not_after: {}", e)))?;
        builder
            .set_pubkey(&private_key)
            .map_err(|e| EngineError::new(stage, format!("Failed to set public key: {}", e)))?;

        let extensions = {
            let ctx = builder.x509v3_context(None, None);
            build_extensions(rendered.extensions(), &ctx, stage)?
        };
        for extension in extensions {
            builder
                .append_extension(extension)
                .map_err(|e| EngineError::new(stage, format!("Failed to add extension: {}", e)))?;
        }

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| EngineError::new(stage, format!("Failed to sign certificate: {}", e)))?;
        let pem = builder.build().to_pem().map_err(EngineError::at(stage))?;
        write_pem(out, &pem, stage)?;

        Ok(CertHandle {
            path: out.to_path_buf(),
        })
    }

    fn generate_csr(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        out: &Path,
    ) -> EngineResult<CsrHandle> {
        let stage = EngineStage::GenerateCsr;
        let private_key = load_key(key, stage)?;
        let rendered = config.rendered;

        let mut builder = X509Req::builder()
            .map_err(|e| EngineError::new(stage, format!("Failed to create CSR builder: {}", e)))?;
        builder
            .set_version(X509_REQ_VERSION_1)
            .map_err(|e| EngineError::new(stage, format!("Failed to set version: {}", e)))?;
        let name = build_name(rendered.subject(), stage)?;
        builder
            .set_subject_name(&name)
            .map_err(|e| EngineError::new(stage, format!("Failed to set subject: {}", e)))?;
        builder
            .set_pubkey(&private_key)
            .map_err(|e| EngineError::new(stage, format!("Failed to set public key: {}", e)))?;

        let mut stack = Stack::new().map_err(EngineError::at(stage))?;
        {
            let ctx = builder.x509v3_context(None);
            for extension in build_extensions(rendered.extensions(), &ctx, stage)? {
                stack.push(extension).map_err(EngineError::at(stage))?;
            }
        }
        builder
            .add_extensions(&stack)
            .map_err(|e| EngineError::new(stage, format!("Failed to add extensions: {}", e)))?;

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| EngineError::new(stage, format!("Failed to sign CSR: {}", e)))?;
        let pem = builder.build().to_pem().map_err(EngineError::at(stage))?;
        write_pem(out, &pem, stage)?;

        Ok(CsrHandle {
            path: out.to_path_buf(),
        })
    }

    fn sign_csr(
        &self,
        csr: &CsrHandle,
        issuer_cert: &CertHandle,
        issuer_key: &KeyHandle,
        extensions: ExtensionsRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle> {
        let stage = EngineStage::SignCsr;
        if extensions.config.rendered.section(extensions.section).is_none() {
            return Err(EngineError::new(
                stage,
                format!("extensions section {} not found in config", extensions.section),
            ));
        }

        let request = fs::read(&csr.path)
            .map_err(EngineError::at(stage))
            .and_then(|pem| X509Req::from_pem(&pem).map_err(EngineError::at(stage)))?;
        let request_key = request.public_key().map_err(EngineError::at(stage))?;
        if !request.verify(&request_key).map_err(EngineError::at(stage))? {
            return Err(EngineError::new(stage, "CSR signature does not verify"));
        }

        let ca_cert = fs::read(&issuer_cert.path)
            .map_err(EngineError::at(stage))
            .and_then(|pem| X509::from_pem(&pem).map_err(EngineError::at(stage)))?;
        let ca_key = load_key(issuer_key, stage)?;

        let mut builder = X509::builder()
            .map_err(|e| EngineError::new(stage, format!("Failed to create X509 builder: {}", e)))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| EngineError::new(stage, format!("Failed to set version: {}", e)))?;
        let serial = random_serial(stage)?;
        builder
            .set_serial_number(&serial)
            .map_err(EngineError::at(stage))?;
        builder
            .set_subject_name(request.subject_name())
            .map_err(|e| EngineError::new(stage, format!("Failed to set subject: {}", e)))?;
        builder
            .set_issuer_name(ca_cert.subject_name())
            .map_err(|e| EngineError::new(stage, format!("Failed to set issuer: {}", e)))?;

        let (not_before, not_after) = validity(validity_days, stage)?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| EngineError::new(stage, format!("Failed to set not_before: {}", e)))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| EngineError::new(stage, format!("Failed to set not_after: {}", e)))?;
        builder
            .set_pubkey(&request_key)
            .map_err(|e| EngineError::new(stage, format!("Failed to set public key: {}", e)))?;

        // copy_extensions = copy
        let requested = request
            .extensions()
            .map_err(|e| EngineError::new(stage, format!("Failed to read CSR extensions: {}", e)))?;
        for extension in requested {
            builder
                .append_extension(extension)
                .map_err(|e| EngineError::new(stage, format!("Failed to copy extension: {}", e)))?;
        }

        builder
            .sign(&ca_key, MessageDigest::sha256())
            .map_err(|e| EngineError::new(stage, format!("Failed to sign certificate: {}", e)))?;
        let pem = builder.build().to_pem().map_err(EngineError::at(stage))?;
        write_pem(out, &pem, stage)?;

        Ok(CertHandle {
            path: out.to_path_buf(),
        })
    }
}
