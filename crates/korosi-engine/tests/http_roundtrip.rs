use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};
use korosi_contracts::{Label, Prediction};
use korosi_engine::transport::RetryPolicy;
use korosi_engine::{
    ArtifactOrigin, GeminiReportProvider, HttpArtifactSource, ProvisionError, ProvisionPlan,
    Provisioner, ReportGenerator, ReportStatus,
};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: value.to_string().into_bytes(),
        }
    }

    fn redirect(location: &str) -> Self {
        Self {
            status: 302,
            headers: vec![("Location".to_string(), location.to_string())],
            body: Vec::new(),
        }
    }
}

type Route = dyn Fn(&Recorded) -> Reply + Send + Sync;

/// One-connection-per-request HTTP/1.1 server on loopback.
struct MockServer {
    base: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockServer {
    fn start(route: Box<Route>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let base = format!("http://{}", listener.local_addr()?);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let _ = serve(stream, route.as_ref(), &log);
            }
        });
        Ok(Self { base, requests })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().map(|rows| rows.clone()).unwrap_or_default()
    }
}

fn serve(
    mut stream: TcpStream,
    route: &Route,
    log: &Mutex<Vec<Recorded>>,
) -> anyhow::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let read = stream.read(&mut buf)?;
        if read == 0 {
            anyhow::bail!("connection closed before headers");
        }
        raw.extend_from_slice(&buf[..read]);
        if let Some(pos) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut buf)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&buf[..read]);
    }

    let request = Recorded {
        method,
        target,
        headers,
        body,
    };
    let reply = route(&request);
    // Logged before the reply goes out.
    if let Ok(mut rows) = log.lock() {
        rows.push(request);
    }
    let mut response = format!(
        "HTTP/1.1 {} Mock\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        reply.body.len()
    );
    for (name, value) in &reply.headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes())?;
    stream.write_all(&reply.body)?;
    stream.flush()?;
    Ok(())
}

fn provisioner(path: &std::path::Path, url: String) -> anyhow::Result<Provisioner> {
    let source = HttpArtifactSource::new(Duration::from_secs(30))?;
    Ok(
        Provisioner::new(ProvisionPlan::new(path, Some(url)), Arc::new(source))
            .with_retry(RetryPolicy::none()),
    )
}

fn artifact_server() -> anyhow::Result<MockServer> {
    MockServer::start(Box::new(|request: &Recorded| match request.target.as_str() {
        "/short.onnx" => Reply::bytes(200, vec![1u8; 9_999_999]),
        "/full.onnx" => Reply::bytes(200, vec![2u8; 10_000_001]),
        "/moved.onnx" => Reply::redirect("/full.onnx"),
        _ => Reply::bytes(404, b"not found".to_vec()),
    }))
}

#[test]
fn artifact_one_byte_below_minimum_is_deleted() -> anyhow::Result<()> {
    let server = artifact_server()?;
    let temp = tempfile::tempdir()?;
    let path = temp.path().join("saved_model.onnx");

    let err = provisioner(&path, server.url("/short.onnx"))?
        .ensure(&mut |_| {})
        .err();
    assert!(matches!(
        err,
        Some(ProvisionError::Undersized {
            size: 9_999_999,
            ..
        })
    ));
    assert!(!path.exists());
    assert_eq!(server.requests().len(), 1);
    Ok(())
}

#[test]
fn artifact_above_minimum_is_kept_and_reused() -> anyhow::Result<()> {
    let server = artifact_server()?;
    let temp = tempfile::tempdir()?;
    let path = temp.path().join("saved_model.onnx");
    let provisioner = provisioner(&path, server.url("/full.onnx"))?;

    let mut last = None;
    let artifact = provisioner.ensure(&mut |update| last = Some(update))?;
    assert_eq!(artifact.origin, ArtifactOrigin::Downloaded);
    assert_eq!(std::fs::metadata(&path)?.len(), 10_000_001);
    assert_eq!(last.and_then(|update| update.fraction()), Some(1.0));

    let again = provisioner.ensure(&mut |_| {})?;
    assert_eq!(again.origin, ArtifactOrigin::Cached);
    assert_eq!(server.requests().len(), 1);
    Ok(())
}

#[test]
fn missing_artifact_leaves_no_file() -> anyhow::Result<()> {
    let server = artifact_server()?;
    let temp = tempfile::tempdir()?;
    let path = temp.path().join("saved_model.onnx");

    let err = provisioner(&path, server.url("/gone.onnx"))?
        .ensure(&mut |_| {})
        .err();
    assert!(matches!(
        err,
        Some(ProvisionError::HttpStatus { status: 404, .. })
    ));
    assert!(!path.exists());
    Ok(())
}

#[test]
fn redirects_are_followed() -> anyhow::Result<()> {
    let server = artifact_server()?;
    let temp = tempfile::tempdir()?;
    let path = temp.path().join("saved_model.onnx");

    let artifact = provisioner(&path, server.url("/moved.onnx"))?.ensure(&mut |_| {})?;
    assert_eq!(artifact.size_bytes, 10_000_001);
    let targets: Vec<String> = server
        .requests()
        .into_iter()
        .map(|request| request.target)
        .collect();
    assert_eq!(targets, vec!["/moved.onnx", "/full.onnx"]);
    Ok(())
}

fn pipe_photo() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([130, 65, 20])))
}

#[test]
fn gemini_request_carries_key_prompt_and_image() -> anyhow::Result<()> {
    let server = MockServer::start(Box::new(|_: &Recorded| {
        Reply::json(
            200,
            json!({
                "candidates": [{
                    "content": {"parts": [{"text": "## Findings\n"}, {"text": "Uniform surface rust."}]},
                    "finishReason": "STOP"
                }]
            }),
        )
    }))?;
    let provider = GeminiReportProvider::new(&server.url("/v1beta"), "gemini-test")
        .with_retry(RetryPolicy::none());
    let generator = ReportGenerator::new(Arc::new(provider));
    let prediction = Prediction::from_probability(0.82);

    let report = generator.generate_report(
        &pipe_photo(),
        prediction.label,
        prediction.confidence_percent,
        Some("test-key"),
    );
    assert_eq!(report.status, ReportStatus::Generated);
    assert_eq!(report.text, "## Findings\nUniform surface rust.");
    assert_eq!(report.model.as_deref(), Some("gemini-test"));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(
        requests[0].target,
        "/v1beta/models/gemini-test:generateContent"
    );
    assert_eq!(requests[0].header("x-goog-api-key"), Some("test-key"));
    let payload: Value = serde_json::from_slice(&requests[0].body)?;
    let parts = &payload["contents"][0]["parts"];
    assert!(parts[0]["text"]
        .as_str()
        .unwrap_or_default()
        .contains("82.00%"));
    assert_eq!(parts[1]["inlineData"]["mimeType"], json!("image/png"));
    Ok(())
}

#[test]
fn gemini_error_status_becomes_report_text() -> anyhow::Result<()> {
    let server = MockServer::start(Box::new(|_: &Recorded| {
        Reply::json(429, json!({"error": {"message": "quota exhausted"}}))
    }))?;
    let provider = GeminiReportProvider::new(&server.url("/v1beta"), "gemini-test")
        .with_retry(RetryPolicy::none());
    let generator = ReportGenerator::new(Arc::new(provider));

    let report = generator.generate_report(&pipe_photo(), Label::NoCorrosion, 64.0, Some("k"));
    assert_eq!(report.status, ReportStatus::Failed);
    assert!(report
        .text
        .starts_with("Error during AI analysis: Gemini request failed (429)"));
    assert!(report.text.contains("quota exhausted"));
    Ok(())
}

#[test]
fn transport_failure_text_never_contains_the_key() -> anyhow::Result<()> {
    let closed = TcpListener::bind("127.0.0.1:0")?;
    let base = format!("http://{}/v1beta", closed.local_addr()?);
    drop(closed);
    let provider = GeminiReportProvider::new(&base, "gemini-test")
        .with_retry(RetryPolicy::none())
        .with_timeout(Duration::from_secs(5));
    let generator = ReportGenerator::new(Arc::new(provider));

    let report = generator.generate_report(
        &pipe_photo(),
        Label::Corrosion,
        82.0,
        Some("SECRET-KEY-123"),
    );
    assert_eq!(report.status, ReportStatus::Failed);
    assert!(report.text.starts_with("Error during AI analysis: Gemini request failed"));
    assert!(!report.text.contains("SECRET-KEY-123"));
    assert!(!report.text.contains("key="));
    Ok(())
}
