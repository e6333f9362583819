//! Out-of-process OCR
//!
//! The native OCR stack can take the whole process down, so this engine
//! runs it in a child: the image goes to a temp PNG, the child is started
//! as `<program> ocr-worker <png>` and prints a single JSON line:
//!
//! ```text
//! {"status":"success","data":[{"text":"LOB-EN001","conf":0.93}]}
//! {"status":"error","message":"..."}
//! ```
//!
//! The parent enforces a deadline and kills the child when it passes.

use crossbeam_channel::RecvTimeoutError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{EngineKind, OcrOutput, OcrToken, TempPng, TextEngine};
use crate::error::EngineError;

/// Subcommand the child is started with
pub const WORKER_SUBCOMMAND: &str = "ocr-worker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerResponse {
    Success { data: Vec<WorkerEntry> },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub conf: Option<f32>,
}

impl WorkerResponse {
    /// Single JSON line as printed by the worker
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","message":"serialization failed: {}"}}"#, e)
        })
    }
}

/// Child-process PaddleOCR client
pub struct WorkerEngine {
    program: PathBuf,
    leading_args: Vec<String>,
    config: Option<PathBuf>,
    timeout: Duration,
}

impl WorkerEngine {
    pub fn new(program: PathBuf, timeout_ms: u64) -> Self {
        Self {
            program,
            leading_args: Vec::new(),
            config: None,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Arguments placed before the subcommand (e.g. an interpreter script)
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    /// Pass `--config <path>` so the child loads the same settings
    pub fn with_config(mut self, path: PathBuf) -> Self {
        self.config = Some(path);
        self
    }

    fn timeout_error(&self) -> EngineError {
        EngineError::Timeout(self.timeout.as_millis() as u64)
    }

    fn spawn(&self, image_path: &Path) -> Result<Child, EngineError> {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        command
            .arg(WORKER_SUBCOMMAND)
            .arg(image_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EngineError::Unavailable(format!("{:?}: {}", self.program, e)))
    }

    /// Wait for exit until `deadline`, killing the child past it
    fn wait_until(&self, child: &mut Child, deadline: Instant) -> Result<ExitStatus, EngineError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    kill(child);
                    return Err(self.timeout_error());
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => return Err(EngineError::Crashed(e.to_string())),
            }
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl TextEngine for WorkerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::PaddleWorker
    }

    fn run(&self, image: &RgbImage) -> Result<OcrOutput, EngineError> {
        let temp = TempPng::write(image)?;
        let started = Instant::now();
        let deadline = started + self.timeout;

        let mut child = self.spawn(temp.path())?;
        let Some(mut stdout) = child.stdout.take() else {
            kill(&mut child);
            return Err(EngineError::Crashed("worker stdout unavailable".into()));
        };

        // The reader is detached: a killed child's orphans may hold the pipe open
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let mut buf = String::new();
            let result = stdout.read_to_string(&mut buf).map(|_| buf);
            let _ = tx.send(result);
        });

        let output = match rx.recv_timeout(self.timeout) {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                kill(&mut child);
                return Err(EngineError::Crashed(format!("reading worker output: {}", e)));
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("OCR worker exceeded {:?}; killing it", self.timeout);
                kill(&mut child);
                return Err(self.timeout_error());
            }
            Err(RecvTimeoutError::Disconnected) => {
                kill(&mut child);
                return Err(EngineError::Crashed("worker output reader died".into()));
            }
        };

        let status = self.wait_until(&mut child, deadline)?;
        debug!("OCR worker finished in {:?} ({})", started.elapsed(), status);
        if !status.success() {
            return Err(EngineError::Crashed(format!("worker exited with {}", status)));
        }

        parse_worker_response(&output).map(OcrOutput::from_tokens)
    }
}

/// Tokens from the worker's stdout
///
/// The last non-empty line is the response. Entries without text are
/// skipped; a missing confidence counts as 0.
pub fn parse_worker_response(stdout: &str) -> Result<Vec<OcrToken>, EngineError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| EngineError::Protocol("empty worker output".into()))?;

    let response: WorkerResponse =
        serde_json::from_str(line).map_err(|e| EngineError::Protocol(format!("{}: {}", e, line)))?;

    match response {
        WorkerResponse::Error { message } => Err(EngineError::Failed(message)),
        WorkerResponse::Success { data } => Ok(data
            .into_iter()
            .filter_map(|entry| {
                let text = entry.text?;
                (!text.trim().is_empty()).then(|| OcrToken::new(text, entry.conf.unwrap_or(0.0)))
            })
            .collect()),
    }
}

/// Worker side: OCR `image_path` with `engine` and build the response
pub fn serve(image_path: &Path, engine: &dyn TextEngine) -> WorkerResponse {
    let image = match image::open(image_path) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            return WorkerResponse::Error {
                message: format!("could not read {:?}: {}", image_path, e),
            }
        }
    };

    match engine.run(&image) {
        Ok(output) => WorkerResponse::Success {
            data: output
                .tokens
                .into_iter()
                .map(|t| WorkerEntry {
                    text: Some(t.text),
                    conf: Some(t.confidence),
                })
                .collect(),
        },
        Err(e) => WorkerResponse::Error { message: e.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::ocr::testing::FakeEngine;

    fn shell(script: &str, timeout_ms: u64) -> WorkerEngine {
        // `sh -c script sh ocr-worker <png>`: the subcommand and path become $1 and $2
        WorkerEngine::new(PathBuf::from("sh"), timeout_ms)
            .with_leading_args(vec!["-c".into(), script.into(), "sh".into()])
    }

    #[test]
    fn test_parse_success() {
        let tokens = parse_worker_response(
            "loading models...\n{\"status\":\"success\",\"data\":[{\"text\":\"LOB-EN001\",\"conf\":0.93},{\"text\":\"Dragon\"},{\"conf\":0.5},{\"text\":\"  \",\"conf\":0.9}]}\n",
        )
        .unwrap();
        assert_eq!(tokens, vec![OcrToken::new("LOB-EN001", 0.93), OcrToken::new("Dragon", 0.0)]);
    }

    #[test]
    fn test_parse_error_status() {
        let err = parse_worker_response(r#"{"status":"error","message":"model missing"}"#).unwrap_err();
        assert_eq!(err, EngineError::Failed("model missing".into()));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(parse_worker_response("Segmentation fault"), Err(EngineError::Protocol(_))));
        assert!(matches!(parse_worker_response("\n\n"), Err(EngineError::Protocol(_))));
        assert!(matches!(parse_worker_response(r#"{"status":"maybe"}"#), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_response_json_line_roundtrip() {
        let response = WorkerResponse::Success {
            data: vec![WorkerEntry {
                text: Some("Kashtira Oger".into()),
                conf: Some(0.8),
            }],
        };
        let line = response.to_json_line();
        assert!(line.starts_with(r#"{"status":"success""#));
        assert_eq!(parse_worker_response(&line).unwrap(), vec![OcrToken::new("Kashtira Oger", 0.8)]);
    }

    #[test]
    fn test_serve_runs_engine() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("card.png");
        RgbImage::new(4, 4).save(&path).unwrap();

        let engine = FakeEngine::tokens(EngineKind::Paddle, &[("LOB-EN001", 0.9)]);
        match serve(&path, &engine) {
            WorkerResponse::Success { data } => assert_eq!(data[0].text.as_deref(), Some("LOB-EN001")),
            other => panic!("unexpected {:?}", other),
        }

        let failing = FakeEngine::failing(EngineKind::Paddle, EngineError::Failed("boom".into()));
        assert!(matches!(serve(&path, &failing), WorkerResponse::Error { .. }));
        assert!(matches!(serve(&dir.path().join("missing.png"), &engine), WorkerResponse::Error { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_success() {
        let engine = shell(
            r#"test "$1" = ocr-worker && test -f "$2" && echo '{"status":"success","data":[{"text":"SDK-001","conf":0.7}]}'"#,
            10_000,
        );
        let out = engine.run(&RgbImage::new(8, 8)).unwrap();
        assert_eq!(out.tokens, vec![OcrToken::new("SDK-001", 0.7)]);
    }

    #[cfg(unix)]
    #[test]
    fn test_child_receives_config_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = dir.path().join("scanner.toml");
        let engine = shell(
            &format!(
                r#"test "$1" = --config && test "$2" = '{}' && test "$3" = ocr-worker && test -f "$4" && echo '{{"status":"success","data":[{{"text":"LOB-EN001","conf":0.9}}]}}'"#,
                config.display()
            ),
            10_000,
        )
        .with_config(config);

        let out = engine.run(&RgbImage::new(8, 8)).unwrap();
        assert_eq!(out.tokens, vec![OcrToken::new("LOB-EN001", 0.9)]);
    }

    #[cfg(unix)]
    #[test]
    fn test_child_timeout_is_killed() {
        let engine = shell("exec sleep 5", 200);
        let started = Instant::now();
        assert_eq!(engine.run(&RgbImage::new(8, 8)).unwrap_err(), EngineError::Timeout(200));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_crash() {
        let engine = shell("echo partial; exit 3", 10_000);
        assert!(matches!(engine.run(&RgbImage::new(8, 8)), Err(EngineError::Crashed(_))));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let engine = WorkerEngine::new(PathBuf::from("/nonexistent/card-scanner"), 1000);
        assert!(matches!(engine.run(&RgbImage::new(8, 8)), Err(EngineError::Unavailable(_))));
    }
}
