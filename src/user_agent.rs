//! Shared `User-Agent` string for all HTTP traffic the core emits.

const PROJECT_UA_URL: &str = "https://github.com/fierce/modelvault-fetch";

/// Default `User-Agent` applied to every request (§4.2).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("modelvault-fetch/{version} (+{PROJECT_UA_URL})")
}
