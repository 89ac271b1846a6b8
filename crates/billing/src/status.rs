//! Provider subscription status mapping

use brandbase_shared::WorkspaceStatus;

/// Whether a status came from a known provider value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMapping {
    Known,
    /// Unrecognized value, or `active` on an ended subscription
    Fallback,
}

/// Map a provider status onto a workspace status.
///
/// Unrecognized values map to `Active` so a new provider status never locks a
/// paying workspace out; callers log the fallback.
pub fn map_provider_status(status: &str, provider_active: bool) -> (WorkspaceStatus, StatusMapping) {
    use StatusMapping::{Fallback, Known};

    match status.trim().to_ascii_lowercase().as_str() {
        "active" if provider_active => (WorkspaceStatus::Active, Known),
        "trialing" => (WorkspaceStatus::Trialing, Known),
        "past_due" => (WorkspaceStatus::PastDue, Known),
        "canceled" | "cancelled" => (WorkspaceStatus::Canceled, Known),
        "unpaid" => (WorkspaceStatus::Unpaid, Known),
        "paused" => (WorkspaceStatus::Paused, Known),
        _ => (WorkspaceStatus::Active, Fallback),
    }
}
