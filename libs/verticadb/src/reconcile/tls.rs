use crate::crd::{TLSConfig, TLSMode, VerticaDB, VerticaDBStatus};

use super::status::set_condition;
use crate::crd::{
    CONDITION_HTTPS_CERT_ROTATION_FINISHED, CONDITION_TLS_CERT_ROLLBACK_NEEDED,
    CONDITION_TLS_CERT_ROTATION_IN_PROGRESS,
};
use crate::dispatcher::{AnyDispatcher, Dispatch, Operation};

use vertdb_k8s_util::rotation::TLS_SECRET_NAME_IN_USE_ANNOTATION;
use vertdb_operator::controller::{Context, KubeOperations};
use vertdb_operator::error::{Error, Result};

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::api::{Api, ObjectMeta};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509, X509Name, X509NameBuilder};

const KEY_BITS: u32 = 2048;
const CERT_VALID_DAYS: u32 = 365;

/// Ensures every TLS-enabled config (`httpsNMATLS`, `clientServerTLS`) has a backing secret,
/// generating a self-signed CA + leaf when the spec names a secret that does not exist yet.
/// Secrets whose name looks like a cloud secret-manager reference (no Kubernetes Secret of that
/// name can be created cheaply) are left alone — those must pre-exist.
pub async fn ensure_tls_secrets(vdb: &VerticaDB, ctx: &Context<VerticaDB>) -> Result<()> {
    for tls in [&vdb.spec.https_nma_tls, &vdb.spec.client_server_tls] {
        if tls.mode == TLSMode::Disable {
            continue;
        }
        let Some(secret_name) = &tls.secret else {
            continue;
        };
        if secret_exists(vdb, ctx, secret_name).await? {
            continue;
        }
        let secret = generate_self_signed_secret(vdb, secret_name)?;
        vdb.patch(ctx, secret).await?;
    }
    Ok(())
}

async fn secret_exists(vdb: &VerticaDB, ctx: &Context<VerticaDB>, name: &str) -> Result<bool> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &vdb.get_namespace());
    match api.get_opt(name).await {
        Ok(found) => Ok(found.is_some()),
        Err(e) => Err(Error::KubeError(format!("failed to check for secret {name}"), e)),
    }
}

fn generate_self_signed_secret(vdb: &VerticaDB, secret_name: &str) -> Result<Secret> {
    let (ca_cert, ca_key) = generate_ca(vdb)?;
    let (leaf_cert, leaf_key) = generate_leaf(vdb, &ca_cert, &ca_key)?;

    let data = BTreeMap::from([
        ("tls.crt".to_string(), ByteString(pem_cert(&leaf_cert)?)),
        ("tls.key".to_string(), ByteString(pem_key(&leaf_key)?)),
        ("ca.crt".to_string(), ByteString(pem_cert(&ca_cert)?)),
    ]);

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: vdb.namespace(),
            owner_references: Some(vec![vdb.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    })
}

fn x509_name(common_name: &str) -> Result<X509Name> {
    let mut builder = X509NameBuilder::new()
        .map_err(|e| Error::CertError(format!("failed to build name: {e}")))?;
    builder
        .append_entry_by_text("O", "Vertica")
        .and_then(|_| builder.append_entry_by_text("CN", common_name))
        .map_err(|e| Error::CertError(format!("failed to append name entry: {e}")))?;
    Ok(builder.build())
}

fn generate_ca(vdb: &VerticaDB) -> Result<(X509, PKey<openssl::pkey::Private>)> {
    let rsa = Rsa::generate(KEY_BITS).map_err(|e| Error::CertError(format!("rsa keygen: {e}")))?;
    let key = PKey::from_rsa(rsa).map_err(|e| Error::CertError(format!("pkey: {e}")))?;

    let mut builder = X509::builder().map_err(|e| Error::CertError(format!("x509 builder: {e}")))?;
    builder.set_version(2).map_err(cert_err)?;
    let name = x509_name(&format!("{}-ca", vdb.name_any()))?;
    builder.set_subject_name(&name).map_err(|e| Error::CertError(e.to_string()))?;
    builder.set_issuer_name(&name).map_err(|e| Error::CertError(e.to_string()))?;
    builder.set_pubkey(&key).map_err(|e| Error::CertError(e.to_string()))?;
    set_validity(&mut builder)?;
    set_serial(&mut builder)?;
    builder
        .append_extension(BasicConstraints::new().ca().critical().build().map_err(cert_err)?)
        .map_err(cert_err)?;
    builder
        .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().map_err(cert_err)?)
        .map_err(cert_err)?;
    builder.sign(&key, MessageDigest::sha256()).map_err(cert_err)?;

    Ok((builder.build(), key))
}

fn generate_leaf(
    vdb: &VerticaDB,
    ca_cert: &X509,
    ca_key: &PKey<openssl::pkey::Private>,
) -> Result<(X509, PKey<openssl::pkey::Private>)> {
    let rsa = Rsa::generate(KEY_BITS).map_err(|e| Error::CertError(format!("rsa keygen: {e}")))?;
    let key = PKey::from_rsa(rsa).map_err(|e| Error::CertError(format!("pkey: {e}")))?;

    let mut builder = X509::builder().map_err(cert_err)?;
    builder.set_version(2).map_err(cert_err)?;
    let name = x509_name(&vdb.name_any())?;
    builder.set_subject_name(&name).map_err(cert_err)?;
    builder.set_issuer_name(ca_cert.subject_name()).map_err(cert_err)?;
    builder.set_pubkey(&key).map_err(cert_err)?;
    set_validity(&mut builder)?;
    set_serial(&mut builder)?;

    let san = SubjectAlternativeName::new()
        .dns(&format!("*.{}", vdb.get_namespace()))
        .dns("localhost")
        .build(&builder.x509v3_context(Some(ca_cert), None))
        .map_err(cert_err)?;
    builder.append_extension(san).map_err(cert_err)?;
    builder
        .append_extension(KeyUsage::new().critical().digital_signature().key_encipherment().build().map_err(cert_err)?)
        .map_err(cert_err)?;
    builder.sign(ca_key, MessageDigest::sha256()).map_err(cert_err)?;

    Ok((builder.build(), key))
}

fn set_validity(builder: &mut openssl::x509::X509Builder) -> Result<()> {
    let not_before = Asn1Time::days_from_now(0).map_err(cert_err)?;
    let not_after = Asn1Time::days_from_now(CERT_VALID_DAYS).map_err(cert_err)?;
    builder.set_not_before(&not_before).map_err(cert_err)?;
    builder.set_not_after(&not_after).map_err(cert_err)?;
    Ok(())
}

fn set_serial(builder: &mut openssl::x509::X509Builder) -> Result<()> {
    let mut serial = BigNum::new().map_err(cert_err)?;
    serial.rand(160, MsbOption::MAYBE_ZERO, false).map_err(cert_err)?;
    let serial = serial.to_asn1_integer().map_err(cert_err)?;
    builder.set_serial_number(&serial).map_err(cert_err)?;
    Ok(())
}

fn pem_cert(cert: &X509) -> Result<Vec<u8>> {
    cert.to_pem().map_err(|e| Error::CertError(format!("cert to pem: {e}")))
}

fn pem_key(key: &PKey<openssl::pkey::Private>) -> Result<Vec<u8>> {
    key.private_key_to_pem_pkcs8()
        .map_err(|e| Error::CertError(format!("key to pem: {e}")))
}

fn cert_err(e: openssl::error::ErrorStack) -> Error {
    Error::CertError(e.to_string())
}

/// Drives the rotation state machine described for the HTTPS/NMA TLS config: compares the
/// annotation tracking the secret currently served against the spec, and if they differ, rotates
/// via the Dispatcher and flips the `TLSCertRotationInProgress` / `HTTPSCertRotationFinished`
/// conditions. A no-op when the spec and annotation already agree.
pub async fn reconcile_rotation(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    dispatcher: &AnyDispatcher,
    status: &mut VerticaDBStatus,
) -> Result<()> {
    let tls = &vdb.spec.https_nma_tls;
    let Some(wanted_secret) = &tls.secret else {
        return Ok(());
    };
    let annotations = vdb.annotations();
    let in_use = annotations.get(TLS_SECRET_NAME_IN_USE_ANNOTATION);
    if in_use == Some(wanted_secret) {
        return Ok(());
    }

    set_condition(
        &mut status.conditions,
        CONDITION_TLS_CERT_ROTATION_IN_PROGRESS,
        true,
        "RotationStarted",
        &format!("rotating HTTPS/NMA TLS to secret {wanted_secret}"),
        vdb.meta().generation,
    );

    let result = dispatcher
        .dispatch(Operation::RotateHttpsCerts {
            key_secret_ref: wanted_secret.clone(),
            cert_secret_ref: wanted_secret.clone(),
            ca_secret_ref: wanted_secret.clone(),
        })
        .await;

    match result {
        Ok(_) => {
            set_condition(
                &mut status.conditions,
                CONDITION_HTTPS_CERT_ROTATION_FINISHED,
                true,
                "RotationFinished",
                &format!("HTTPS/NMA TLS now serving secret {wanted_secret}"),
                vdb.meta().generation,
            );
            set_condition(
                &mut status.conditions,
                CONDITION_TLS_CERT_ROTATION_IN_PROGRESS,
                false,
                "RotationFinished",
                "",
                vdb.meta().generation,
            );
            let mut patch_annotations = BTreeMap::new();
            patch_annotations.insert(TLS_SECRET_NAME_IN_USE_ANNOTATION.to_string(), wanted_secret.clone());
            annotate(vdb, ctx, patch_annotations).await?;
            Ok(())
        }
        Err(e) => {
            set_condition(
                &mut status.conditions,
                CONDITION_TLS_CERT_ROLLBACK_NEEDED,
                true,
                "RotationFailed",
                &e.to_string(),
                vdb.meta().generation,
            );
            Err(e)
        }
    }
}

async fn annotate(
    vdb: &VerticaDB,
    ctx: &Context<VerticaDB>,
    annotations: BTreeMap<String, String>,
) -> Result<()> {
    let api: Api<VerticaDB> = Api::namespaced(ctx.client.clone(), &vdb.get_namespace());
    let patch = VerticaDB {
        metadata: ObjectMeta {
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    };
    let params = kube::api::PatchParams::apply(ctx.controller_id).force();
    api.patch(&vdb.name_any(), &params, &kube::api::Patch::Apply(patch))
        .await
        .map_err(|e| Error::KubeError("failed to patch TLS-in-use annotation".to_string(), e))?;
    Ok(())
}

/// Compares a served leaf certificate (TLS-probed DER bytes) against the two rotation candidates
/// and reports which one is currently live: `0` = new secret, `1` = current secret, `2` = neither.
pub fn classify_served_cert(served_der: &[u8], new_cert_pem: &[u8], current_cert_pem: &[u8]) -> Result<u8> {
    let served = X509::from_der(served_der).map_err(cert_err)?;
    let new_cert = X509::from_pem(new_cert_pem).map_err(cert_err)?;
    let current_cert = X509::from_pem(current_cert_pem).map_err(cert_err)?;

    if served.subject_name().to_der().ok() == new_cert.subject_name().to_der().ok()
        && served.serial_number().to_bn().ok() == new_cert.serial_number().to_bn().ok()
    {
        Ok(0)
    } else if served.serial_number().to_bn().ok() == current_cert.serial_number().to_bn().ok() {
        Ok(1)
    } else {
        Ok(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VerticaDBSpec;

    fn test_vdb() -> VerticaDB {
        let mut vdb = VerticaDB::new(
            "test",
            VerticaDBSpec {
                https_nma_tls: TLSConfig {
                    secret: Some("test-nma-tls".to_string()),
                    mode: TLSMode::Enable,
                },
                ..Default::default()
            },
        );
        vdb.meta_mut().namespace = Some("default".to_string());
        vdb
    }

    #[test]
    fn test_generate_self_signed_secret_has_expected_keys() {
        let vdb = test_vdb();
        let secret = generate_self_signed_secret(&vdb, "test-nma-tls").unwrap();
        let data = secret.data.unwrap();
        assert!(data.contains_key("tls.crt"));
        assert!(data.contains_key("tls.key"));
        assert!(data.contains_key("ca.crt"));
    }

    #[test]
    fn test_classify_served_cert_matches_new() {
        let vdb = test_vdb();
        let (ca_cert, ca_key) = generate_ca(&vdb).unwrap();
        let (leaf, _) = generate_leaf(&vdb, &ca_cert, &ca_key).unwrap();
        let der = leaf.to_der().unwrap();
        let pem = leaf.to_pem().unwrap();
        let other_pem = ca_cert.to_pem().unwrap();
        assert_eq!(classify_served_cert(&der, &pem, &other_pem).unwrap(), 0);
    }
}
