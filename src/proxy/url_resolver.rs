//! Target URL resolution and path handling for proxy requests

use crate::proxy::headers::paths;
use crate::proxy::types::*;
use url::Url;

/// Strategy for resolving target URLs and handling path composition
pub struct UrlResolver;

impl UrlResolver {
    /// Resolve the final URL for the outgoing request
    ///
    /// - If target URL has a path, use it as-is
    /// - If target URL is just the origin, take the inbound path and append
    ///   the inbound query after any query the target already carries
    pub fn resolve(target_url: &TargetUrl, path_and_query: &str) -> ProxyResult<Url> {
        let mut target = Url::parse(target_url.as_ref())
            .map_err(|e| ProxyError::InvalidTargetUrl(format!("{target_url}: {e}")))?;

        if target.path() != paths::DEFAULT && !target.path().is_empty() {
            return Ok(target);
        }

        let (path, inbound_query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        target.set_path(if path.is_empty() { paths::DEFAULT } else { path });

        let query = [target.query(), inbound_query]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("&");
        target.set_query((!query.is_empty()).then_some(query.as_str()));

        Ok(target)
    }
}
