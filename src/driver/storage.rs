//! Clearing origin storage and the browser cache around a run.

use crate::errors::ProtocolError;
use crate::protocol::ProtocolSession;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// `Storage.clearDataForOrigin` can stall; it gets a short leash and a warning.
const CLEAR_DATA_TIMEOUT: Duration = Duration::from_secs(5);

pub const CLEAR_DATA_TIMED_OUT_WARNING: &str = "Clearing the browser cache timed out. \
     Try auditing this page again and file a bug if the issue persists.";

const STORAGE_TYPES_TO_CLEAR: &str = "file_systems,shader_cache,service_workers,cache_storage";

/// Serialized origin of `url`, or `None` for opaque origins such as `about:blank`.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// Clear service workers and caches for the origin of `url`.
///
/// A timeout is not an error: it is returned as a warning for the run.
pub async fn clear_data_for_origin(
    session: &ProtocolSession,
    url: &str,
) -> Result<Option<String>, ProtocolError> {
    let Some(origin) = origin_of(url) else {
        debug!(target: "storage", url, "No origin to clear");
        return Ok(None);
    };

    debug!(target: "storage", %origin, "Clearing origin data");
    let result = session
        .send_command_with_timeout(
            "Storage.clearDataForOrigin",
            json!({"origin": origin, "storageTypes": STORAGE_TYPES_TO_CLEAR}),
            CLEAR_DATA_TIMEOUT,
        )
        .await;

    match result {
        Ok(_) => Ok(None),
        Err(e) if e.is_timeout() => {
            warn!(target: "storage", %origin, "Clearing origin data timed out");
            Ok(Some(CLEAR_DATA_TIMED_OUT_WARNING.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Drop the HTTP cache so the navigation loads from the network.
pub async fn clear_browser_caches(session: &ProtocolSession) -> Result<(), ProtocolError> {
    debug!(target: "storage", "Clearing browser cache");
    session
        .send_command("Network.clearBrowserCache", json!({}))
        .await?;
    // Toggling the cache also evicts the in-memory cache.
    session
        .send_command("Network.setCacheDisabled", json!({"cacheDisabled": true}))
        .await?;
    session
        .send_command("Network.setCacheDisabled", json!({"cacheDisabled": false}))
        .await?;
    Ok(())
}

/// Warn when the origin holds storage a run does not clear.
pub async fn important_storage_warning(
    session: &ProtocolSession,
    url: &str,
) -> Result<Option<String>, ProtocolError> {
    let Some(origin) = origin_of(url) else {
        return Ok(None);
    };
    let usage = session
        .send_command("Storage.getUsageAndQuota", json!({"origin": origin}))
        .await?;

    let locations: Vec<&str> = usage["usageBreakdown"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|entry| entry["usage"].as_f64().unwrap_or_default() > 0.0)
        .filter_map(|entry| match entry["storageType"].as_str()? {
            "local_storage" => Some("Local Storage"),
            "indexeddb" => Some("IndexedDB"),
            "websql" => Some("Web SQL"),
            _ => None,
        })
        .collect();

    if locations.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!(
        "There may be stored data affecting loading performance in this location: {}. \
         Audit this page in an incognito window to prevent those resources from affecting \
         your scores.",
        locations.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::ScriptedTransport;

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://a.test:8443/path?q=1").as_deref(),
            Some("https://a.test:8443")
        );
        assert_eq!(origin_of("about:blank"), None);
        assert_eq!(origin_of("not a url"), None);
    }

    #[tokio::test]
    async fn test_clear_data_sends_origin() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);

        let warning = clear_data_for_origin(&session, "https://a.test/page")
            .await
            .unwrap();
        assert!(warning.is_none());
        let params = &transport.params_for("Storage.clearDataForOrigin")[0];
        assert_eq!(params["origin"], "https://a.test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_data_timeout_becomes_warning() {
        let transport = ScriptedTransport::new();
        transport.hang("Storage.clearDataForOrigin");
        let session = ProtocolSession::new(transport, None);

        let warning = clear_data_for_origin(&session, "https://a.test/")
            .await
            .unwrap();
        assert_eq!(warning.as_deref(), Some(CLEAR_DATA_TIMED_OUT_WARNING));
    }

    #[tokio::test]
    async fn test_clear_data_other_errors_propagate() {
        let transport = ScriptedTransport::new();
        transport.fail("Storage.clearDataForOrigin", -32000, "Not allowed");
        let session = ProtocolSession::new(transport, None);

        assert!(clear_data_for_origin(&session, "https://a.test/").await.is_err());
    }

    #[tokio::test]
    async fn test_important_storage_warning_lists_locations() {
        let transport = ScriptedTransport::new();
        transport.respond(
            "Storage.getUsageAndQuota",
            json!({"usageBreakdown": [
                {"storageType": "local_storage", "usage": 120},
                {"storageType": "indexeddb", "usage": 0},
                {"storageType": "websql", "usage": 5},
                {"storageType": "cookies", "usage": 40},
            ]}),
        );
        let session = ProtocolSession::new(transport, None);

        let warning = important_storage_warning(&session, "https://a.test/")
            .await
            .unwrap()
            .unwrap();
        assert!(warning.contains("Local Storage, Web SQL"));
        assert!(!warning.contains("IndexedDB"));
    }
}
