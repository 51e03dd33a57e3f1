use nosql_session_core::ContextConfig;

/// Host used when a context declares no virtual hosts.
const DEFAULT_HOST: &str = "0.0.0.0";

/// Derive the identifier that namespaces a context's fields in the shared collection.
///
/// The first virtual host is joined with the context path (the root path `/`
/// contributes nothing) and `/`, `.` and `\` are replaced with `_` so the
/// result is a single safe path segment.
pub fn context_id(virtual_hosts: &[String], context_path: &str) -> String {
    let host = virtual_hosts
        .iter()
        .map(|h| h.trim())
        .find(|h| !h.is_empty())
        .unwrap_or(DEFAULT_HOST);
    let path = if context_path == "/" { "" } else { context_path };

    canonicalize(&format!("{}{}", host, path))
}

pub fn context_id_for(config: &ContextConfig) -> String {
    context_id(&config.virtual_hosts, &config.context_path)
}

fn canonicalize(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '.' | '\\' => '_',
            other => other,
        })
        .collect()
}
