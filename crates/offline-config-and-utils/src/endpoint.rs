//! Endpoint-derived naming for per-endpoint stores.

use url::Url;

/// Domain part of an endpoint URL, used to scope store names and blob keys.
///
/// Falls back to the raw endpoint with non-alphanumeric characters replaced
/// when the value is not a URL with a host.
pub fn endpoint_domain(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(url) => match url.host_str() {
            Some(host) => match url.port() {
                Some(port) => format!("{host}_{port}"),
                None => host.to_string(),
            },
            None => sanitize(endpoint),
        },
        Err(_) => sanitize(endpoint),
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
