use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use tracing::trace;

static RESOLVER: OnceLock<Option<TokioAsyncResolver>> = OnceLock::new();

const LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Best-effort reverse lookup used to decorate relay-log lines. Falls back
/// to the literal address on any failure; block relay never waits longer
/// than the lookup timeout for DNS.
pub async fn get_rdns(ip: IpAddr) -> String {
    let resolver = RESOLVER.get_or_init(|| match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => Some(resolver),
        Err(e) => {
            trace!("No system resolver available: {}", e);
            None
        }
    });
    let Some(resolver) = resolver else {
        return ip.to_string();
    };

    match tokio::time::timeout(LOOKUP_TIMEOUT, resolver.reverse_lookup(ip)).await {
        Ok(Ok(names)) => names
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_owned())
            .unwrap_or_else(|| ip.to_string()),
        _ => ip.to_string(),
    }
}
