//! Shared User-Agent string for source and download HTTP clients.
//!
//! Several bibliographic APIs (Crossref, OpenAlex, Unpaywall) route requests
//! that carry a `mailto:` contact into a faster "polite pool", so the contact
//! e-mail is part of the header whenever one is configured.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/bibp";

/// User-Agent for every outbound request.
#[must_use]
pub(crate) fn default_user_agent(contact_email: Option<&str>) -> String {
    let version = env!("CARGO_PKG_VERSION");
    match contact_email.map(str::trim).filter(|email| !email.is_empty()) {
        Some(email) => format!("bibp/{version} (+{PROJECT_UA_URL}; mailto:{email})"),
        None => format!("bibp/{version} (+{PROJECT_UA_URL})"),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_contains_version_and_project_url() {
        let ua = default_user_agent(None);
        assert!(ua.contains(PROJECT_UA_URL), "UA must contain project URL: {ua}");
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            ua.strip_prefix("bibp/")
                .and_then(|s| s.split(' ').next())
                .expect("UA has version"),
        );
        assert!(!ua.contains("mailto"));
    }

    #[test]
    fn test_user_agent_includes_contact_email() {
        let ua = default_user_agent(Some(" me@lab.org "));
        assert!(ua.ends_with("mailto:me@lab.org)"), "{ua}");
    }

    #[test]
    fn test_blank_contact_email_is_ignored() {
        assert_eq!(default_user_agent(Some("  ")), default_user_agent(None));
    }
}
