//! Reachability probe and public IP / geolocation lookup.
//!
//! Both checks are strictly best-effort: failures degrade to `false` or
//! `None` and never abort the operation that requested them.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;

use crate::process::CommandRunner;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Public address details reported by the IP information service.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct PublicIpInfo {
    /// Caller's public IP address.
    pub ip: Option<String>,
    /// Two-letter country code of the address.
    pub country: Option<String>,
}

impl PublicIpInfo {
    /// Renders `IP (CC flag)` for display, with `N/A` placeholders.
    #[must_use]
    pub fn display(&self) -> String {
        let ip = self.ip.as_deref().unwrap_or("N/A");
        match self.country.as_deref() {
            Some(country) => {
                format!("{ip} ({country} {})", country_code_to_flag(country))
            }
            None => format!("{ip} (N/A)"),
        }
    }
}

/// Network probes used by the status-sync routine and the summary banner.
pub trait NetProbe: Send + Sync {
    /// Returns `true` when `address` answers a single ping.
    fn ping(&self, address: &str) -> bool;

    /// Fetches the caller's public IP and country, best-effort.
    fn public_ip_info<'a>(
        &'a self,
        service_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<PublicIpInfo>> + Send + 'a>>;
}

/// Probe backed by the system `ping` binary and an HTTP lookup.
#[derive(Clone, Debug)]
pub struct SystemNetProbe<R> {
    runner: R,
    http: reqwest::Client,
}

impl<R: CommandRunner> SystemNetProbe<R> {
    /// Creates a probe using the given command runner.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            http: reqwest::Client::builder()
                .timeout(LOOKUP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl<R: CommandRunner + Send + Sync> NetProbe for SystemNetProbe<R> {
    fn ping(&self, address: &str) -> bool {
        let args = [
            OsString::from("-c"),
            OsString::from("1"),
            OsString::from("-W"),
            OsString::from("2"),
            OsString::from(address),
        ];
        self.runner
            .run("ping", &args)
            .map(|output| output.is_success())
            .unwrap_or(false)
    }

    fn public_ip_info<'a>(
        &'a self,
        service_url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<PublicIpInfo>> + Send + 'a>> {
        Box::pin(async move {
            let response = match self.http.get(service_url).send().await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(error = %err, "public IP lookup failed");
                    return None;
                }
            };
            if !response.status().is_success() {
                tracing::warn!(status = %response.status(), "public IP lookup rejected");
                return None;
            }
            match response.json::<PublicIpInfo>().await {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!(error = %err, "public IP response was not JSON");
                    None
                }
            }
        })
    }
}

/// Converts a two-letter country code to a flag emoji, or an empty string
/// when the code is not two ASCII letters.
#[must_use]
pub fn country_code_to_flag(country_code: &str) -> String {
    if country_code.len() != 2 || !country_code.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return String::new();
    }
    country_code
        .chars()
        .filter_map(|ch| char::from_u32(u32::from(ch.to_ascii_uppercase()) + 127_397))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    #[test]
    fn country_flags_render_from_codes() {
        assert_eq!(country_code_to_flag("DE"), "\u{1F1E9}\u{1F1EA}");
        assert_eq!(country_code_to_flag("us"), "\u{1F1FA}\u{1F1F8}");
        assert_eq!(country_code_to_flag("USA"), "");
        assert_eq!(country_code_to_flag(""), "");
    }

    #[test]
    fn ping_is_true_only_on_exit_zero() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_failure(1);
        let probe = SystemNetProbe::new(runner);

        assert!(probe.ping("8.8.8.8"));
        assert!(!probe.ping("8.8.8.8"));
    }

    #[test]
    fn public_ip_info_display_includes_flag() {
        let info = PublicIpInfo {
            ip: Some(String::from("203.0.113.9")),
            country: Some(String::from("DE")),
        };
        assert_eq!(info.display(), "203.0.113.9 (DE \u{1F1E9}\u{1F1EA})");
    }

    #[tokio::test]
    async fn lookup_parses_the_service_payload() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/json"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"ip": "203.0.113.9", "country": "DE", "city": "Berlin"}),
            ))
            .mount(&server)
            .await;

        let probe = SystemNetProbe::new(ScriptedRunner::new());
        let info = probe
            .public_ip_info(&format!("{}/json", server.uri()))
            .await
            .expect("lookup should succeed");

        assert_eq!(info.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(info.country.as_deref(), Some("DE"));
    }

    #[tokio::test]
    async fn lookup_failures_degrade_to_none() {
        let probe = SystemNetProbe::new(ScriptedRunner::new());
        let info = probe.public_ip_info("http://127.0.0.1:1/json").await;
        assert_eq!(info, None);
    }
}
