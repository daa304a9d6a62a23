//! Gate for tests that need a local wiremock server.
//!
//! Some sandboxes refuse to bind even a loopback socket. There the mock
//! server is not started and the test returns early, unless
//! `BIBP_REQUIRE_SOCKET_TESTS` is set to a truthy value, which turns the
//! skip into a failure.
//!
//! Integration tests include this same file through `tests/support/mod.rs`.

use std::future::Future;
use std::net::{Ipv4Addr, TcpListener};
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "BIBP_REQUIRE_SOCKET_TESTS";

fn skipping_forbidden() -> bool {
    std::env::var(REQUIRE_ENV).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn loopback_bindable() -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).is_ok()
}

fn report_skip(caller: &Location<'_>) {
    let message = format!(
        "mock server unavailable for test at {}:{}: loopback bind refused",
        caller.file(),
        caller.line()
    );
    if skipping_forbidden() {
        panic!("{message} ({REQUIRE_ENV} is set)");
    }
    eprintln!("{message}; skipping. Set {REQUIRE_ENV}=1 to fail instead.");
}

/// Starts a mock server, or yields `None` when the test should be skipped.
///
/// # Panics
///
/// Panics instead of skipping when `BIBP_REQUIRE_SOCKET_TESTS` is set.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl Future<Output = Option<MockServer>> {
    let bindable = loopback_bindable();
    if !bindable {
        report_skip(Location::caller());
    }
    async move {
        if bindable {
            Some(MockServer::start().await)
        } else {
            None
        }
    }
}
