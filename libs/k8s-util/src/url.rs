/// Collapse the variable segments of a Kubernetes API path (namespace, resource name) into a
/// fixed template so per-request metrics don't explode into one label series per object.
///
/// `/api/v1/namespaces/foo/pods/bar` -> `/api/v1/namespaces/{namespace}/pods/{name}`
pub fn template_path(path: &str, _dynamic_type: Option<&str>) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let mut templated = Vec::with_capacity(segments.len());
    let mut i = 0;
    while i < segments.len() {
        let seg = segments[i];
        templated.push(match seg {
            "namespaces" if i + 1 < segments.len() => {
                templated.push(seg);
                i += 1;
                "{namespace}"
            }
            _ => seg,
        });
        i += 1;
    }

    // collapse a trailing resource-name segment (the one after the plural kind) when it isn't
    // a known fixed verb/subresource.
    const FIXED: &[&str] = &[
        "api", "apis", "v1", "watch", "status", "scale", "finalize", "{namespace}",
    ];
    if let Some(last) = templated.last().copied() {
        if !FIXED.contains(&last) && templated.len() > 2 {
            let idx = templated.len() - 1;
            templated[idx] = "{name}";
        }
    }

    templated.join("/")
}

#[cfg(test)]
mod test {
    use super::template_path;

    #[test]
    fn test_template_path_namespaced_resource() {
        assert_eq!(
            template_path("/api/v1/namespaces/foo/pods/bar", None),
            "/api/v1/namespaces/{namespace}/pods/{name}"
        );
    }

    #[test]
    fn test_template_path_list() {
        assert_eq!(
            template_path("/apis/vertica.com/v1/namespaces/foo/verticadbs", None),
            "/apis/vertica.com/v1/namespaces/{namespace}/verticadbs"
        );
    }
}
