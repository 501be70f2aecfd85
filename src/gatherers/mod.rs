//! Built-in gatherers and the registry that instantiates them by name.

pub mod console_messages;
pub mod devtools_log;
pub mod main_document_content;
pub mod trace;
pub mod viewport_dimensions;

pub use console_messages::ConsoleMessages;
pub use devtools_log::{DEVTOOLS_LOG, DevtoolsLog};
pub use main_document_content::MainDocumentContent;
pub use trace::{TRACE, Trace};
pub use viewport_dimensions::ViewportDimensions;

use crate::errors::DefinitionError;
use crate::gather::{ArtifactDefinition, Gatherer};
use std::sync::Arc;

/// Names accepted by [`create`].
pub const BUILTIN_GATHERERS: &[&str] = &[
    "DevtoolsLog",
    "Trace",
    "ConsoleMessages",
    "ViewportDimensions",
    "MainDocumentContent",
];

/// A fresh instance of the named built-in gatherer.
pub fn create(name: &str) -> Result<Arc<dyn Gatherer>, DefinitionError> {
    let gatherer: Arc<dyn Gatherer> = match name {
        "DevtoolsLog" => Arc::new(DevtoolsLog::new()),
        "Trace" => Arc::new(Trace::new()),
        "ConsoleMessages" => Arc::new(ConsoleMessages::new()),
        "ViewportDimensions" => Arc::new(ViewportDimensions),
        "MainDocumentContent" => Arc::new(MainDocumentContent),
        _ => return Err(DefinitionError::UnknownGatherer(name.to_string())),
    };
    Ok(gatherer)
}

/// Every built-in gatherer under its own name, with dependencies bound.
pub fn default_definitions() -> Vec<ArtifactDefinition> {
    vec![
        ArtifactDefinition::new("DevtoolsLog", Arc::new(DevtoolsLog::new())),
        ArtifactDefinition::new("Trace", Arc::new(Trace::new())),
        ArtifactDefinition::new("ConsoleMessages", Arc::new(ConsoleMessages::new())),
        ArtifactDefinition::new("ViewportDimensions", Arc::new(ViewportDimensions)),
        ArtifactDefinition::new("MainDocumentContent", Arc::new(MainDocumentContent))
            .with_dependency(DEVTOOLS_LOG.as_str(), "DevtoolsLog"),
    ]
}

#[cfg(test)]
pub(crate) fn test_context(
    transport: Arc<crate::protocol::testing::ScriptedTransport>,
    gather_mode: pharos_common::GatherMode,
) -> crate::gather::GatherContext {
    use crate::driver::Driver;
    use crate::gather::{Dependencies, GatherContext};
    use crate::protocol::ProtocolSession;
    use pharos_common::{BaseArtifacts, Settings};

    let driver = Driver::from_session(ProtocolSession::new(transport, None));
    GatherContext {
        driver: Arc::new(driver),
        url: String::new(),
        gather_mode,
        settings: Arc::new(Settings::default()),
        base_artifacts: Arc::new(BaseArtifacts::new(gather_mode, Settings::default())),
        dependencies: Dependencies::new(),
    }
}
