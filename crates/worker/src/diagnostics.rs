//! Environment and backend readiness report for `--diagnostics`.

use std::fmt::Write as _;
use std::path::Path;

use outpaint_comfyui::adapter::NodeGraphAdapter;
use outpaint_core::backend::BackendAdapter;
use outpaint_core::config::OutpaintConfig;
use outpaint_core::types::BackendKind;

const LABEL_WIDTH: usize = 18;
const RULE_WIDTH: usize = 70;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRow {
    pub label: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosticsReport {
    sections: Vec<Vec<DiagnosticRow>>,
    /// Result of the checks the selected backend depends on.
    backend_ready: bool,
}

impl DiagnosticsReport {
    pub fn rows(&self) -> impl Iterator<Item = &DiagnosticRow> {
        self.sections.iter().flatten()
    }

    pub fn row(&self, label: &str) -> Option<&DiagnosticRow> {
        self.rows().find(|r| r.label == label)
    }

    pub fn backend_ready(&self) -> bool {
        self.backend_ready
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "SYSTEM DIAGNOSTICS");
        let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));
            }
            for row in section {
                let mark = if row.ok { '✓' } else { '✗' };
                let _ = writeln!(
                    out,
                    "{:<width$}│ {mark} {}",
                    row.label,
                    row.detail,
                    width = LABEL_WIDTH
                );
            }
        }
        out
    }
}

fn row(label: &str, ok: bool, detail: impl Into<String>) -> DiagnosticRow {
    DiagnosticRow {
        label: label.to_string(),
        ok,
        detail: detail.into(),
    }
}

/// Probe the environment described by `config`. Never fails; problems
/// become rows marked with a cross.
pub async fn run_diagnostics(config: &OutpaintConfig) -> DiagnosticsReport {
    let system = vec![
        row("outpaint", true, env!("CARGO_PKG_VERSION")),
        row(
            "OS",
            true,
            format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        ),
    ];

    let config_errors = config.validate();
    let key_present = config.has_fal_credential();
    let settings = vec![
        row("Backend", true, config.backend.display_name()),
        row(
            "fal.ai API key",
            key_present,
            if key_present { "present" } else { "missing" },
        ),
        row(
            "Parameters",
            config_errors.is_empty(),
            if config_errors.is_empty() {
                "valid".to_string()
            } else {
                config_errors.join("; ")
            },
        ),
    ];

    let workflow = Path::new(&config.comfyui_workflow_path);
    let workflow_found = workflow.is_file();
    let availability = NodeGraphAdapter::new(&config.comfyui_url, workflow)
        .check_available()
        .await;
    let comfyui = vec![
        row(
            "ComfyUI Workflow",
            workflow_found,
            if workflow_found {
                workflow.display().to_string()
            } else {
                format!("not found: {}", workflow.display())
            },
        ),
        row("ComfyUI Server", availability.ready, availability.message),
    ];

    let backend_ready = config_errors.is_empty()
        && match config.backend {
            BackendKind::FalAi => key_present,
            BackendKind::ComfyUi => availability.ready,
        };

    tracing::debug!(backend_ready, "Diagnostics collected");
    DiagnosticsReport {
        sections: vec![system, settings, comfyui],
        backend_ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn missing_key_and_dead_server_are_flagged() {
        let config = OutpaintConfig {
            comfyui_url: unreachable_url(),
            comfyui_workflow_path: "/definitely/not/here.json".into(),
            ..Default::default()
        };
        let report = run_diagnostics(&config).await;

        assert!(!report.row("fal.ai API key").unwrap().ok);
        assert!(!report.row("ComfyUI Server").unwrap().ok);
        assert!(!report.row("ComfyUI Workflow").unwrap().ok);
        assert!(report.row("Parameters").unwrap().ok);
        assert!(!report.backend_ready());
    }

    #[tokio::test]
    async fn remote_backend_ready_with_key() {
        let config = OutpaintConfig {
            backend: BackendKind::FalAi,
            falai_api_key: "abc".into(),
            comfyui_url: unreachable_url(),
            ..Default::default()
        };
        let report = run_diagnostics(&config).await;
        assert!(report.backend_ready());
        assert_eq!(report.row("Backend").unwrap().detail, "fal.ai");
    }

    #[test]
    fn render_aligns_labels() {
        let report = DiagnosticsReport {
            sections: vec![
                vec![row("OS", true, "linux x86_64")],
                vec![row("fal.ai API key", false, "missing")],
            ],
            backend_ready: false,
        };
        let text = report.render();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "SYSTEM DIAGNOSTICS");
        assert_eq!(lines[2], format!("{:<18}│ ✓ linux x86_64", "OS"));
        assert!(lines[3].starts_with("---"));
        assert_eq!(lines[4], format!("{:<18}│ ✗ missing", "fal.ai API key"));
    }
}
