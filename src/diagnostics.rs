//! Append-only diagnostic records for the operations dashboard.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::ledger::LedgerStore;
use crate::types::{Severity, SystemError};

/// Writes [`SystemError`] rows and mirrors them to the log. A failed write is
/// only logged.
#[derive(Clone)]
pub struct DiagnosticSink {
    ledger: Arc<dyn LedgerStore>,
}

impl DiagnosticSink {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub async fn record(&self, event: SystemError) {
        match event.severity {
            Severity::Info => info!(
                error_type = %event.error_type, source = %event.source, context = %event.context,
                "{}", event.message
            ),
            Severity::Warning => warn!(
                error_type = %event.error_type, source = %event.source, context = %event.context,
                "{}", event.message
            ),
            Severity::Error | Severity::Critical => error!(
                severity = %event.severity, error_type = %event.error_type, source = %event.source,
                context = %event.context, "{}", event.message
            ),
        }

        if let Err(e) = self.ledger.insert_system_error(&event).await {
            error!(error = %e, id = %event.id, "failed to persist diagnostic record");
        }
    }
}
