/// Minimum Vertica server version the bundled vclusterops RPC client is known to speak to.
/// Images older than this fall back to the admintools-over-exec Dispatcher backend (§4.11).
pub const MIN_VCLUSTEROPS_SERVER_VERSION: &str = "12.0.0";

pub fn supports_vclusterops(image_tag: &str) -> bool {
    let min = vertdb_k8s_util::parse::parse_semver(MIN_VCLUSTEROPS_SERVER_VERSION);
    let image = parse_semver(image_tag);

    match (min, image) {
        (Some((min_major, min_minor, _)), Some((img_major, img_minor, _))) => {
            (img_major, img_minor) >= (min_major, min_minor)
        }
        _ => false,
    }
}

fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
    let version = version.trim_start_matches('v');
    let parts: Vec<&str> = version.split('.').collect();

    if parts.len() >= 3 {
        let major = parts[0].parse().ok()?;
        let minor = parts[1].parse().ok()?;
        let patch = parts[2].split('-').next()?.parse().ok()?;
        Some((major, minor, patch))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_semver() {
        assert_eq!(parse_semver("12.0.3"), Some((12, 0, 3)));
        assert_eq!(parse_semver("v12.0.3"), Some((12, 0, 3)));
        assert_eq!(parse_semver("12.0.3-dev"), Some((12, 0, 3)));
        assert_eq!(parse_semver("invalid"), None);
    }

    #[test]
    fn test_supports_vclusterops() {
        assert!(supports_vclusterops("12.0.3"));
        assert!(supports_vclusterops("12.1.0"));
        assert!(supports_vclusterops("13.0.0"));
        assert!(!supports_vclusterops("11.9.0"));
        assert!(!supports_vclusterops("garbage"));
    }
}
