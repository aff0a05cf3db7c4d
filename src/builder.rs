//! Image builder: turns a bot script plus an optional dependency manifest
//! into a tagged container image. The build context is a scratch directory
//! holding the script, the merged requirements, the injected health sidecar,
//! and a generated Dockerfile for the declared platform.

use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info};

use crate::bot::{image_tag, Platform};
use crate::error::{Result, SupervisorError};

/// Tag of a built image, e.g. "warden/weather-bot:latest".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dependencies every bot image carries: the bot framework plus what the
/// health sidecar needs.
const INJECTED_REQUIREMENTS: &[&str] = &["python-telegram-bot", "flask", "psutil", "requests"];

/// Health/metrics sidecar baked into every image. Reports the counters the
/// collector prefers over its log heuristic. Trimmed from the platform's
/// stock sidecar; the /activity endpoint is what instrumented bots call.
const HEALTH_SIDECAR: &str = r#"#!/usr/bin/env python3
"""Health and metrics endpoint for supervised bot containers."""

import time

import psutil
from flask import Flask, jsonify, request

app = Flask(__name__)

START_TIME = time.time()
state = {"message_count": 0, "error_count": 0, "last_activity": START_TIME}


@app.route("/health", methods=["GET"])
def health():
    process = psutil.Process()
    return jsonify({
        "status": "healthy" if state["error_count"] < 10 else "degraded",
        "uptime_seconds": int(time.time() - START_TIME),
        "memory_usage_mb": round(process.memory_info().rss / 1024 / 1024, 2),
        "cpu_usage_percent": round(process.cpu_percent(), 2),
        "message_count": state["message_count"],
        "error_count": state["error_count"],
    })


@app.route("/activity", methods=["POST"])
def activity():
    data = request.get_json(silent=True) or {}
    if data.get("type") == "message":
        state["message_count"] += 1
    elif data.get("type") == "error":
        state["error_count"] += 1
    state["last_activity"] = time.time()
    return jsonify({"status": "recorded"})


if __name__ == "__main__":
    app.run(host="0.0.0.0", port=8080, debug=False)
"#;

pub struct ImageBuilder {
    bin: String,
    build_timeout: Duration,
}

impl ImageBuilder {
    pub fn new(bin: impl Into<String>, build_timeout: Duration) -> Self {
        ImageBuilder {
            bin: bin.into(),
            build_timeout,
        }
    }

    /// Validate inputs, assemble a build context, and build the image.
    /// Rebuilding with the same inputs replaces the prior image under the
    /// same tag. The scratch context is removed on every path.
    pub async fn prepare(
        &self,
        bot_id: &str,
        platform: Platform,
        script: &[u8],
        manifest: Option<&[u8]>,
    ) -> Result<ImageRef> {
        if script.is_empty() {
            return Err(SupervisorError::InvalidInput(
                "bot script is empty".to_string(),
            ));
        }

        let tag = image_tag(bot_id);
        let ctx = scratch_context_dir(bot_id);
        fs::create_dir_all(&ctx)?;

        let result = self.build_in_context(&ctx, &tag, platform, script, manifest).await;
        let _ = fs::remove_dir_all(&ctx);
        result?;

        info!(bot_id, %tag, "image built");
        Ok(ImageRef(tag))
    }

    async fn build_in_context(
        &self,
        ctx: &PathBuf,
        tag: &str,
        platform: Platform,
        script: &[u8],
        manifest: Option<&[u8]>,
    ) -> Result<()> {
        fs::write(ctx.join("bot.py"), script)?;
        fs::write(
            ctx.join("requirements.txt"),
            merge_requirements(manifest.map(|m| String::from_utf8_lossy(m).to_string())),
        )?;
        fs::write(ctx.join("health_check.py"), HEALTH_SIDECAR)?;
        fs::write(ctx.join("Dockerfile"), generate_dockerfile(platform))?;

        debug!(%tag, ctx = %ctx.display(), "building image");
        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.arg("build")
            .arg("-t")
            .arg(tag)
            .arg(ctx)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.build_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| SupervisorError::BuildFailed(format!(
                "failed to invoke {}: {}",
                self.bin, e
            )))?,
            Err(_) => {
                return Err(SupervisorError::Timeout {
                    operation: "build",
                    seconds: self.build_timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SupervisorError::BuildFailed(tail_of(stderr.trim(), 2000)));
        }
        Ok(())
    }
}

fn scratch_context_dir(bot_id: &str) -> PathBuf {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "warden-build-{}-{}-{}",
        bot_id,
        std::process::id(),
        now
    ))
}

/// Declared manifest lines plus the injected dependencies, skipping any the
/// manifest already pins.
fn merge_requirements(manifest: Option<String>) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut declared: Vec<String> = Vec::new();

    if let Some(manifest) = manifest {
        for line in manifest.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !trimmed.starts_with('#') {
                declared.push(requirement_name(trimmed));
            }
            lines.push(trimmed.to_string());
        }
    }

    for dep in INJECTED_REQUIREMENTS {
        if !declared.iter().any(|d| d == dep) {
            lines.push((*dep).to_string());
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Package name portion of a requirement line ("flask==2.0" -> "flask").
fn requirement_name(line: &str) -> String {
    line.split(|c: char| ['=', '<', '>', '~', '!', '[', ';', ' '].contains(&c))
        .next()
        .unwrap_or(line)
        .trim()
        .to_ascii_lowercase()
}

fn generate_dockerfile(platform: Platform) -> String {
    format!(
        r#"FROM {base}
WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
COPY bot.py health_check.py ./
ENV PYTHONUNBUFFERED=1
HEALTHCHECK --interval=30s --timeout=5s --retries=3 \
  CMD python -c "import urllib.request; urllib.request.urlopen('http://127.0.0.1:8080/health')" || exit 1
CMD ["sh", "-c", "python health_check.py & exec python bot.py"]
"#,
        base = platform.base_image()
    )
}

fn tail_of(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let start = text.len() - max;
    // Avoid splitting a UTF-8 sequence.
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(0);
    text[start..].to_string()
}
