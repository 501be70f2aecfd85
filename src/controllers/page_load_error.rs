//! Classifying why a navigation failed to produce a usable page.
//!
//! Precedence is fixed: an interstitial wins over a network error, which wins
//! over a non-HTML document, which wins over a navigation error reported by the
//! load waits. An interstitial usually shows up as a failed request too, so it
//! has to be checked first.

use crate::driver::NetworkRecord;
use crate::driver::network::find_resource_for_url;
use pharos_common::{LoadFailureMode, PageLoadError};

const HTML_MIME_TYPES: &[&str] = &["text/html", "application/xhtml+xml"];

/// Failure of the main document request itself.
pub fn network_error(main_record: Option<&NetworkRecord>) -> Option<PageLoadError> {
    let Some(record) = main_record else {
        return Some(PageLoadError::NoDocumentRequest);
    };

    if record.failed {
        let error_text = record.error_text.clone().unwrap_or_default();
        if error_text.starts_with("net::ERR_CERT") {
            return Some(PageLoadError::InsecureDocumentRequest {
                security_message: error_text,
            });
        }
        return Some(PageLoadError::FailedDocumentRequest { error_text });
    }

    match record.status_code {
        Some(status_code) if status_code >= 400 => {
            Some(PageLoadError::ErroredDocumentRequest { status_code })
        }
        _ => None,
    }
}

/// The browser replaced the page with one of its own error pages.
pub fn interstitial_error(
    main_record: Option<&NetworkRecord>,
    records: &[NetworkRecord],
) -> Option<PageLoadError> {
    let main_record = main_record?;
    records
        .iter()
        .find(|r| r.document_url.starts_with("chrome-error://"))?;

    match &main_record.error_text {
        Some(text) if text.contains("net::ERR_CERT") => Some(PageLoadError::InsecureDocumentRequest {
            security_message: text.clone(),
        }),
        _ => Some(PageLoadError::ChromeInterstitial),
    }
}

/// The main document loaded but is not an HTML page.
pub fn non_html_error(main_record: Option<&NetworkRecord>) -> Option<PageLoadError> {
    let mime_type = main_record?.mime_type.as_deref()?;
    if HTML_MIME_TYPES.contains(&mime_type) {
        return None;
    }
    Some(PageLoadError::NotHtml {
        mime_type: mime_type.to_string(),
    })
}

/// Decide the page-load error for a navigation to `url`.
///
/// `navigation_error` is the failure reported while waiting for the load,
/// if any. Under `LoadFailureMode::Ignore` nothing is ever reported.
pub fn page_load_error(
    navigation_error: Option<PageLoadError>,
    url: &str,
    records: &[NetworkRecord],
    load_failure_mode: LoadFailureMode,
) -> Option<PageLoadError> {
    if load_failure_mode == LoadFailureMode::Ignore {
        return None;
    }

    let main_record = find_resource_for_url(records, url);
    interstitial_error(main_record, records)
        .or_else(|| network_error(main_record))
        .or_else(|| non_html_error(main_record))
        .or(navigation_error)
}
