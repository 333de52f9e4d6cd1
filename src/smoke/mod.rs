use std::fmt::Write;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;

use crate::settings::{SmokeSettings, ViewerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Base {
    Rest,
    Webserver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub base: Base,
    pub path: String,
    pub required: bool,
}

/// Checks run against a live router, in order.
pub fn default_checks(viewer: &ViewerSettings) -> Vec<Check> {
    vec![
        Check {
            name: "root",
            base: Base::Rest,
            path: "/".into(),
            required: true,
        },
        Check {
            name: "status",
            base: Base::Rest,
            path: "/@/router/local/status".into(),
            required: true,
        },
        Check {
            name: "subscribers",
            base: Base::Rest,
            path: "/@/router/local/subscribers".into(),
            required: true,
        },
        Check {
            name: "rgb",
            base: Base::Webserver,
            path: key_path(&viewer.rgb_key),
            required: false,
        },
        Check {
            name: "depth",
            base: Base::Webserver,
            path: key_path(&viewer.depth_key),
            required: false,
        },
    ]
}

fn key_path(key: &str) -> String {
    format!("/{}", key.trim_start_matches('/'))
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub url: String,
    pub required: bool,
    pub status: Option<u16>,
    pub bytes: usize,
    pub content_type: Option<String>,
    pub latency_ms: u128,
    pub error: Option<String>,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.status == Some(200)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SmokeReport {
    pub timestamp: String,
    pub checks: Vec<CheckResult>,
}

impl SmokeReport {
    /// Fails only when a required check fails.
    pub fn success(&self) -> bool {
        self.checks
            .iter()
            .filter(|check| check.required)
            .all(CheckResult::passed)
    }

    pub fn warnings(&self) -> usize {
        self.checks
            .iter()
            .filter(|check| !check.required && !check.passed())
            .count()
    }
}

pub struct SmokeRunner {
    client: Client,
    rest_url: String,
    webserver_url: String,
}

impl SmokeRunner {
    pub fn new(settings: &SmokeSettings) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .user_agent(concat!("zenohd-setup/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                warn!("smoke: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            rest_url: settings.rest_url.trim_end_matches('/').to_owned(),
            webserver_url: settings.webserver_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn url_for(&self, check: &Check) -> String {
        let base = match check.base {
            Base::Rest => &self.rest_url,
            Base::Webserver => &self.webserver_url,
        };
        format!("{base}{}", check.path)
    }

    pub async fn run(&self, checks: &[Check]) -> SmokeReport {
        info!("smoke: running {} check(s)", checks.len());
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            results.push(self.run_one(check).await);
        }
        SmokeReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            checks: results,
        }
    }

    async fn run_one(&self, check: &Check) -> CheckResult {
        let url = self.url_for(check);
        let started = Instant::now();
        let mut result = CheckResult {
            name: check.name.to_owned(),
            url: url.clone(),
            required: check.required,
            status: None,
            bytes: 0,
            content_type: None,
            latency_ms: 0,
            error: None,
        };

        match self.client.get(&url).send().await {
            Ok(resp) => {
                result.status = Some(resp.status().as_u16());
                result.content_type = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                match resp.bytes().await {
                    Ok(body) => result.bytes = body.len(),
                    Err(err) => result.error = Some(format!("body read failed: {err}")),
                }
            }
            Err(err) => result.error = Some(err.to_string()),
        }
        result.latency_ms = started.elapsed().as_millis();

        if result.passed() {
            debug!("smoke: {} ok ({} bytes)", url, result.bytes);
        } else if check.required {
            warn!("smoke: {} failed (status {:?})", url, result.status);
        } else {
            info!("smoke: optional {} unavailable (status {:?})", url, result.status);
        }
        result
    }
}

pub fn format_report(report: &SmokeReport) -> String {
    let mut output = String::new();
    let verdict = if report.success() { "OK" } else { "FAILED" };

    let _ = writeln!(&mut output, "zenohd smoke test");
    let _ = writeln!(&mut output, "Generated: {}", report.timestamp);
    let _ = writeln!(
        &mut output,
        "Summary: {verdict} | warnings={}",
        report.warnings()
    );
    let _ = writeln!(&mut output);

    for check in &report.checks {
        let mark = match (check.passed(), check.required) {
            (true, _) => "✅",
            (false, true) => "❌",
            (false, false) => "⚠️ ",
        };
        let status = check
            .status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "---".into());
        let _ = write!(
            &mut output,
            "{mark} {:<12} {status} {:>8} B {:>5} ms  {}",
            check.name, check.bytes, check.latency_ms, check.url
        );
        if let Some(content_type) = &check.content_type {
            let _ = write!(&mut output, " [{content_type}]");
        }
        if let Some(err) = &check.error {
            let _ = write!(&mut output, " ({err})");
        }
        let _ = writeln!(&mut output);
    }

    output
}
